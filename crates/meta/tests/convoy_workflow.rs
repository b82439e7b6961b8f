//! End-to-end open / close / status / checkout / reset flows on real
//! on-disk repositories.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use git2::{Oid, Repository};
use meta::{
    checkout::{self, CheckoutOptions, OpenOptions},
    config, opener,
    reset::{self, ResetKind},
    status::{self, Relation, StatusOptions},
    util,
};
use tempfile::TempDir;

fn write_file<P: AsRef<Path>>(base: P, rel: &str, content: &str) {
    let path = base.as_ref().join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
}

fn configure_user(repo: &Repository) {
    let mut cfg = repo.config().unwrap();
    cfg.set_str("user.name", "Test User").unwrap();
    cfg.set_str("user.email", "test@example.com").unwrap();
}

fn init_repo(path: &Path) -> Repository {
    let repo = Repository::init(path).unwrap();
    configure_user(&repo);
    // Local test fetches ask for raw shas.
    repo.config()
        .unwrap()
        .set_bool("uploadpack.allowAnySHA1InWant", true)
        .unwrap();
    repo
}

fn commit_all(repo: &Repository, message: &str) -> Oid {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = repo.signature().unwrap();
    let parents: Vec<git2::Commit<'_>> = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => Vec::new(),
    };
    let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}

/// A sub origin repo with one commit carrying `files`.
fn init_sub_origin(root: &Path, name: &str, files: &[(&str, &str)]) -> (PathBuf, Oid) {
    let path = root.join("origins").join(name);
    let repo = init_repo(&path);
    for (rel, content) in files {
        write_file(&path, rel, content);
    }
    let oid = commit_all(&repo, &format!("{name}: initial"));
    (path, oid)
}

fn sub_commit(origin: &Path, files: &[(&str, &str)], message: &str) -> Oid {
    let repo = Repository::open(origin).unwrap();
    for (rel, content) in files {
        write_file(origin, rel, content);
    }
    commit_all(&repo, message)
}

/// Stage a gitlink plus its `.gitmodules` entry in the meta repo.
fn stage_sub(meta: &Repository, name: &str, url: &str, sha: Oid) {
    let workdir = meta.workdir().unwrap();
    let gitmodules = workdir.join(".gitmodules");
    let mut urls = if gitmodules.exists() {
        config::parse_gitmodules(&fs::read_to_string(&gitmodules).unwrap())
    } else {
        BTreeMap::new()
    };
    urls.insert(name.to_string(), url.to_string());
    fs::write(&gitmodules, config::write_gitmodules(&urls)).unwrap();
    let mut index = meta.index().unwrap();
    index.add_path(Path::new(".gitmodules")).unwrap();
    util::stage_gitlink(&mut index, name, sha).unwrap();
    index.write().unwrap();
}

fn commit_meta(meta: &Repository, message: &str) -> Oid {
    let mut index = meta.index().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = meta.find_tree(tree_id).unwrap();
    let sig = meta.signature().unwrap();
    let parents: Vec<git2::Commit<'_>> = match meta.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => Vec::new(),
    };
    let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
    meta.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}

/// Meta repo with one sub `s` pinned at its origin's head.
fn meta_with_sub(td: &TempDir) -> (Repository, PathBuf, Oid) {
    let (origin, sub_head) = init_sub_origin(
        td.path(),
        "s",
        &[("README.md", "sub s\n"), ("data.txt", "1\n")],
    );
    let meta_path = td.path().join("meta");
    let meta = init_repo(&meta_path);
    write_file(&meta_path, "VERSION", "1\n");
    commit_all(&meta, "meta: initial");
    stage_sub(&meta, "s", origin.to_str().unwrap(), sub_head);
    commit_meta(&meta, "add sub s");
    (meta, origin, sub_head)
}

#[test]
fn open_materializes_sub_at_recorded_sha() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, sub_head) = meta_with_sub(&td);
    let opened = checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();
    assert_eq!(opened, vec!["s".to_string()]);

    let workdir = meta.workdir().unwrap();
    assert!(workdir.join("s/.git").is_file());
    assert!(meta.path().join("modules/s/HEAD").is_file());
    assert_eq!(
        fs::read_to_string(workdir.join("s/README.md")).unwrap(),
        "sub s\n"
    );

    let sub = Repository::open(workdir.join("s")).unwrap();
    assert_eq!(sub.head().unwrap().target(), Some(sub_head));
    assert_eq!(
        opener::list_open_subs(&meta).unwrap(),
        ["s".to_string()].into_iter().collect()
    );
    // gc is disabled in materialized subs
    assert_eq!(sub.config().unwrap().get_i32("gc.auto").unwrap(), 0);
}

#[test]
fn open_by_paths_selects_nested_subs() {
    let td = TempDir::new().unwrap();
    let (origin, sub_head) =
        init_sub_origin(td.path(), "nested", &[("lib.rs", "pub fn x() {}\n")]);
    let meta_path = td.path().join("meta");
    let meta = init_repo(&meta_path);
    write_file(&meta_path, "VERSION", "1\n");
    commit_all(&meta, "meta: initial");
    stage_sub(&meta, "libs/nested", origin.to_str().unwrap(), sub_head);
    commit_meta(&meta, "add nested sub");

    let opened =
        checkout::open_subs(&meta, &["libs".to_string()], &OpenOptions::default()).unwrap();
    assert_eq!(opened, vec!["libs/nested".to_string()]);
    assert!(meta.workdir().unwrap().join("libs/nested/.git").is_file());
}

#[test]
fn close_keeps_modules_dir_and_clears_config() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, _sub_head) = meta_with_sub(&td);
    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();
    checkout::close_subs(&meta, &["s".to_string()]).unwrap();

    assert!(opener::list_open_subs(&meta).unwrap().is_empty());
    // deinit keeps the directory itself and the fetched history
    let workdir = meta.workdir().unwrap();
    assert!(workdir.join("s").is_dir());
    assert!(!workdir.join("s/.git").exists());
    assert!(meta.path().join("modules/s/HEAD").is_file());
    let config_text = fs::read_to_string(meta.path().join("config")).unwrap();
    assert!(!config_text.contains("[submodule \"s\"]"));
}

#[test]
fn reopen_after_close_promotes_half_open() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, sub_head) = meta_with_sub(&td);
    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();
    checkout::close_subs(&meta, &["s".to_string()]).unwrap();
    assert_eq!(
        opener::list_half_open_subs(&meta).unwrap(),
        ["s".to_string()].into_iter().collect()
    );

    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();
    let sub = Repository::open(meta.workdir().unwrap().join("s")).unwrap();
    assert_eq!(sub.head().unwrap().target(), Some(sub_head));
}

#[test]
fn status_reports_sub_in_sync() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, sub_head) = meta_with_sub(&td);
    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();

    let st = status::get_repo_status(&meta, &StatusOptions::default()).unwrap();
    let sub = &st.submodules["s"];
    assert_eq!(sub.commit.as_ref().unwrap().sha, sub_head);
    let index = sub.index.as_ref().unwrap();
    assert_eq!(index.sha, sub_head);
    assert_eq!(index.relation, Some(Relation::Same));
    assert_eq!(
        sub.workdir.as_ref().unwrap().relation,
        Some(Relation::Same)
    );
    assert!(status::is_deep_clean(&meta, false).unwrap());
}

#[test]
fn status_detects_sub_ahead_of_index() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, _sub_head) = meta_with_sub(&td);
    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();

    // advance the sub's HEAD past what the meta index records
    let sub_path = meta.workdir().unwrap().join("s");
    write_file(&sub_path, "data.txt", "2\n");
    let sub = Repository::open(&sub_path).unwrap();
    configure_user(&sub);
    commit_all(&sub, "sub: bump data");

    let st = status::get_repo_status(&meta, &StatusOptions::default()).unwrap();
    let index = st.submodules["s"].index.as_ref().unwrap();
    assert_eq!(index.relation, Some(Relation::Behind));
    assert!(!status::is_deep_clean(&meta, false).unwrap());
}

#[test]
fn status_reports_dirty_sub_workdir() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, _sub_head) = meta_with_sub(&td);
    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();

    write_file(meta.workdir().unwrap().join("s"), "data.txt", "dirty\n");
    let st = status::get_repo_status(&meta, &StatusOptions::default()).unwrap();
    let inner = &st.submodules["s"].workdir.as_ref().unwrap().status;
    assert!(!inner.workdir.is_empty());
    assert!(!status::is_deep_clean(&meta, false).unwrap());
}

#[test]
fn checkout_moves_meta_and_open_subs() {
    let td = TempDir::new().unwrap();
    let (meta, origin, first_sub) = meta_with_sub(&td);
    let first_meta = meta.head().unwrap().target().unwrap();

    let second_sub = sub_commit(&origin, &[("data.txt", "2\n")], "bump data");
    let mut index = meta.index().unwrap();
    util::stage_gitlink(&mut index, "s", second_sub).unwrap();
    index.write().unwrap();
    commit_meta(&meta, "bump s");

    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();
    let sub_path = meta.workdir().unwrap().join("s");
    assert_eq!(
        fs::read_to_string(sub_path.join("data.txt")).unwrap(),
        "2\n"
    );

    checkout::checkout(
        &meta,
        Some(&first_meta.to_string()),
        &CheckoutOptions::default(),
    )
    .unwrap();
    assert_eq!(meta.head().unwrap().target(), Some(first_meta));
    let sub = Repository::open(&sub_path).unwrap();
    assert_eq!(sub.head().unwrap().target(), Some(first_sub));
    assert_eq!(
        fs::read_to_string(sub_path.join("data.txt")).unwrap(),
        "1\n"
    );
}

#[test]
fn checkout_new_branch_stays_put() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, _sub) = meta_with_sub(&td);
    let head = meta.head().unwrap().target().unwrap();
    checkout::checkout(
        &meta,
        None,
        &CheckoutOptions {
            new_branch: Some("topic".to_string()),
            concurrency: 0,
        },
    )
    .unwrap();
    assert_eq!(meta.head().unwrap().shorthand(), Some("topic"));
    assert_eq!(meta.head().unwrap().target(), Some(head));
}

#[test]
fn reset_hard_tears_down_sub_added_after_target() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, _sub) = meta_with_sub(&td);
    let target = meta.head().unwrap().target().unwrap();

    let (t_origin, t_head) = init_sub_origin(td.path(), "t", &[("t.txt", "t\n")]);
    stage_sub(&meta, "t", t_origin.to_str().unwrap(), t_head);
    commit_meta(&meta, "add sub t");
    checkout::open_subs(&meta, &["t".to_string()], &OpenOptions::default()).unwrap();
    assert!(meta.workdir().unwrap().join("t/.git").is_file());

    reset::reset(&meta, target, ResetKind::Hard, 0).unwrap();

    assert_eq!(meta.head().unwrap().target(), Some(target));
    let index = meta.index().unwrap();
    assert!(index.get_path(Path::new("t"), 0).is_none());
    assert!(!meta.workdir().unwrap().join("t").exists());
    // the fetched history survives deinit
    assert!(meta.path().join("modules/t/HEAD").is_file());
}

#[test]
fn reset_soft_to_head_changes_nothing() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, sub_head) = meta_with_sub(&td);
    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();
    let head = meta.head().unwrap().target().unwrap();

    reset::reset(&meta, head, ResetKind::Soft, 0).unwrap();
    reset::reset(&meta, head, ResetKind::Soft, 0).unwrap();

    assert_eq!(meta.head().unwrap().target(), Some(head));
    let index = meta.index().unwrap();
    let entry = index.get_path(Path::new("s"), 0).unwrap();
    assert_eq!(entry.id, sub_head);
    assert!(status::is_deep_clean(&meta, false).unwrap());
}

#[test]
fn reset_mixed_moves_sub_and_restages() {
    let td = TempDir::new().unwrap();
    let (meta, origin, first_sub) = meta_with_sub(&td);
    let first_meta = meta.head().unwrap().target().unwrap();

    let second_sub = sub_commit(&origin, &[("data.txt", "2\n")], "bump data");
    let mut index = meta.index().unwrap();
    util::stage_gitlink(&mut index, "s", second_sub).unwrap();
    index.write().unwrap();
    commit_meta(&meta, "bump s");
    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();

    reset::reset(&meta, first_meta, ResetKind::Mixed, 0).unwrap();
    let sub = Repository::open(meta.workdir().unwrap().join("s")).unwrap();
    assert_eq!(sub.head().unwrap().target(), Some(first_sub));
    let index = meta.index().unwrap();
    assert_eq!(index.get_path(Path::new("s"), 0).unwrap().id, first_sub);
}

#[test]
fn open_missing_sub_reports_user_error_but_opens_rest() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, _sub) = meta_with_sub(&td);
    // A gitlink with no .gitmodules entry cannot be opened.
    let bogus = Oid::from_str("1234567890123456789012345678901234567890").unwrap();
    let mut index = meta.index().unwrap();
    util::stage_gitlink(&mut index, "ghost", bogus).unwrap();
    index.write().unwrap();
    commit_meta(&meta, "add ghost without url");

    let err = checkout::open_subs(
        &meta,
        &["s".to_string(), "ghost".to_string()],
        &OpenOptions::default(),
    )
    .unwrap_err();
    assert!(err.is_user_error());
    assert!(format!("{err}").contains("ghost"));
    // the healthy sub still opened
    assert!(opener::list_open_subs(&meta).unwrap().contains("s"));
}

#[test]
fn sparse_mode_tracks_open_subs_in_sparse_file() {
    let td = TempDir::new().unwrap();
    let (meta, _origin, _sub) = meta_with_sub(&td);
    meta.config()
        .unwrap()
        .set_bool("core.sparsecheckout", true)
        .unwrap();
    fs::create_dir_all(meta.path().join("info")).unwrap();
    fs::write(meta.path().join("info/sparse-checkout"), ".gitmodules\n").unwrap();
    assert!(meta::sparse::in_sparse_mode(&meta).unwrap());

    checkout::open_subs(&meta, &["s".to_string()], &OpenOptions::default()).unwrap();
    let sparse = fs::read_to_string(meta.path().join("info/sparse-checkout")).unwrap();
    assert!(sparse.lines().any(|l| l == "s"));
    // still sparse with an open sub recorded
    assert!(meta::sparse::in_sparse_mode(&meta).unwrap());

    checkout::close_subs(&meta, &["s".to_string()]).unwrap();
    let sparse = fs::read_to_string(meta.path().join("info/sparse-checkout")).unwrap();
    assert!(!sparse.lines().any(|l| l == "s"));
    // sparse deinit removes the whole directory
    assert!(!meta.workdir().unwrap().join("s").exists());
}
