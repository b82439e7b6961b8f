//! Merge, cherry-pick, rebase, stitch, and server-side hook behavior on
//! real on-disk repositories.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use git2::{build::CheckoutBuilder, Oid, Repository};
use meta::{
    cherry_pick, cli::GitCli, config, merge,
    merge::MergeOptions,
    pre_receive::{self, HookMode},
    rebase, ref_gc,
    sequencer::{SequencerKind, SequencerState},
    stitch::{self, StitchOptions},
    util, MetaError,
};
use tempfile::TempDir;

const ZERO: &str = "0000000000000000000000000000000000000000";

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

/// Keep a commit fetchable by pinning a ref on it.
fn pin(repo: &Repository, oid: Oid) {
    repo.reference(
        &format!("refs/heads/pin-{}", &oid.to_string()[..8]),
        oid,
        true,
        "pin",
    )
    .unwrap();
}

/// Commit `files` on top of `base` (detached), leaving a pin ref behind.
fn commit_on(origin: &Path, base: Oid, files: &[(&str, &str)], message: &str) -> Oid {
    let repo = Repository::open(origin).unwrap();
    let object = repo.find_object(base, None).unwrap();
    let mut co = CheckoutBuilder::new();
    co.force();
    repo.checkout_tree(&object, Some(&mut co)).unwrap();
    repo.set_head_detached(base).unwrap();
    for (rel, content) in files {
        write_file(origin, rel, content);
    }
    let oid = commit_all(&repo, message);
    pin(&repo, oid);
    oid
}

fn init_sub_origin(root: &Path, name: &str, files: &[(&str, &str)]) -> (PathBuf, Oid) {
    let path = root.join("origins").join(name);
    let repo = init_repo(&path);
    for (rel, content) in files {
        write_file(&path, rel, content);
    }
    let oid = commit_all(&repo, &format!("{name}: initial"));
    pin(&repo, oid);
    (path, oid)
}

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

fn stage_gitlink_only(meta: &Repository, name: &str, sha: Oid) {
    let mut index = meta.index().unwrap();
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

fn create_branch(repo: &Repository, name: &str) {
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    repo.branch(name, &head, true).unwrap();
}

fn checkout_branch(repo: &Repository, name: &str) {
    repo.set_head(&format!("refs/heads/{name}")).unwrap();
    let mut co = CheckoutBuilder::new();
    co.force();
    repo.checkout_head(Some(&mut co)).unwrap();
}

#[test]
fn merge_of_current_head_is_a_no_op() {
    let td = TempDir::new().unwrap();
    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    let outcome = merge::merge(&meta, "HEAD", &MergeOptions::default()).unwrap();
    assert!(outcome.commit.is_none());
}

#[test]
fn merge_fast_forwards_when_possible() {
    let td = TempDir::new().unwrap();
    let (s_origin, sa) = init_sub_origin(td.path(), "s", &[("f.txt", "base\n")]);
    let sb = commit_on(&s_origin, sa, &[("f.txt", "more\n")], "s: more");

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    let m0 = commit_meta(&meta, "add s");
    create_branch(&meta, "topic");
    checkout_branch(&meta, "topic");
    stage_gitlink_only(&meta, "s", sb);
    let m2 = commit_meta(&meta, "bump s");
    checkout_branch(&meta, "master");
    assert_eq!(meta.head().unwrap().target(), Some(m0));

    let outcome = merge::merge(&meta, "topic", &MergeOptions::default()).unwrap();
    assert_eq!(outcome.commit, Some(m2));
    assert_eq!(meta.head().unwrap().target(), Some(m2));
}

/// Cross-sub merge where one sub conflicts and the other fast-forwards,
/// then `--continue` finishes the job.
#[test]
fn merge_with_sub_conflict_then_continue() {
    let td = TempDir::new().unwrap();
    let (s_origin, s0) = init_sub_origin(td.path(), "s", &[("f.txt", "base\n")]);
    let sa = commit_on(&s_origin, s0, &[("f.txt", "ours\n")], "s: ours");
    let sb = commit_on(&s_origin, s0, &[("f.txt", "theirs\n")], "s: theirs");
    let (t_origin, ta) = init_sub_origin(td.path(), "t", &[("t.txt", "1\n")]);
    let tb = commit_on(&t_origin, ta, &[("t.txt", "2\n")], "t: 2");

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    stage_sub(&meta, "t", t_origin.to_str().unwrap(), ta);
    commit_meta(&meta, "add subs");

    create_branch(&meta, "topic");
    checkout_branch(&meta, "topic");
    stage_gitlink_only(&meta, "s", sb);
    stage_gitlink_only(&meta, "t", tb);
    let m2 = commit_meta(&meta, "bump both subs");
    checkout_branch(&meta, "master");
    write_file(meta.workdir().unwrap(), "VERSION", "2\n");
    let m1 = commit_all(&meta, "version 2");

    let err = merge::merge(&meta, "topic", &MergeOptions::default()).unwrap_err();
    let MetaError::Conflicts { message } = &err else {
        panic!("expected conflicts, got {err}");
    };
    assert!(message.contains("submodule 's'"));

    // t fast-forwarded in the index without being opened
    let index = meta.index().unwrap();
    assert_eq!(index.get_path(Path::new("t"), 0).unwrap().id, tb);

    // s is open with conflict markers and a sequencer record
    let sub_path = meta.workdir().unwrap().join("s");
    let conflicted = fs::read_to_string(sub_path.join("f.txt")).unwrap();
    assert!(conflicted.contains("<<<<<<<"));
    let seq = SequencerState::load(&meta, SequencerKind::Merge)
        .unwrap()
        .unwrap();
    assert_eq!(seq.original_head.sha, m1);
    assert_eq!(seq.target.sha, m2);

    // resolve inside s and continue
    write_file(&sub_path, "f.txt", "resolved\n");
    let sub = Repository::open(&sub_path).unwrap();
    let mut sub_index = sub.index().unwrap();
    sub_index.add_path(Path::new("f.txt")).unwrap();
    sub_index.write().unwrap();

    let outcome = merge::merge_continue(&meta).unwrap();
    let merge_commit = meta.find_commit(outcome.commit.unwrap()).unwrap();
    assert_eq!(merge_commit.parent_count(), 2);
    assert_eq!(merge_commit.parent_id(0).unwrap(), m1);
    assert_eq!(merge_commit.parent_id(1).unwrap(), m2);
    assert!(SequencerState::load(&meta, SequencerKind::Merge)
        .unwrap()
        .is_none());

    // the sub merge commit has both lines of history and is pinned
    let sub_head = sub.head().unwrap().peel_to_commit().unwrap();
    assert_eq!(sub_head.parent_count(), 2);
    assert_eq!(sub_head.parent_id(0).unwrap(), sa);
    assert_eq!(sub_head.parent_id(1).unwrap(), sb);
    assert!(sub
        .find_reference(&format!("refs/commits/{}", sub_head.id()))
        .is_ok());
}

#[test]
fn merge_ff_only_refuses_real_merges() {
    let td = TempDir::new().unwrap();
    let (s_origin, sa) = init_sub_origin(td.path(), "s", &[("f.txt", "base\n")]);
    let sb = commit_on(&s_origin, sa, &[("g.txt", "g\n")], "s: g");

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    commit_meta(&meta, "add s");
    create_branch(&meta, "topic");
    checkout_branch(&meta, "topic");
    stage_gitlink_only(&meta, "s", sb);
    commit_meta(&meta, "bump s");
    checkout_branch(&meta, "master");
    write_file(meta.workdir().unwrap(), "VERSION", "2\n");
    commit_all(&meta, "version 2");

    let err = merge::merge(
        &meta,
        "topic",
        &MergeOptions {
            mode: merge::MergeMode::FfOnly,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, MetaError::CannotFastForward));
}

#[test]
fn cherry_pick_adds_new_sub() {
    let td = TempDir::new().unwrap();
    let (s_origin, sa) = init_sub_origin(td.path(), "s", &[("f.txt", "s\n")]);
    let (t_origin, tc) = init_sub_origin(td.path(), "t", &[("t.txt", "t\n")]);

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    let m1 = commit_meta(&meta, "add s");

    // craft the donor commit without moving HEAD
    stage_sub(&meta, "t", t_origin.to_str().unwrap(), tc);
    let c = {
        let mut index = meta.index().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = meta.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("Donor Author", "donor@example.com").unwrap();
        let parent = meta.find_commit(m1).unwrap();
        meta.commit(None, &sig, &sig, "add sub t", &tree, &[&parent])
            .unwrap()
    };
    pin(&meta, c);
    let object = meta.find_object(m1, None).unwrap();
    meta.reset(&object, git2::ResetType::Hard, None).unwrap();

    let outcome = cherry_pick::cherry_pick(&meta, &c.to_string(), 0).unwrap();
    let new_commit = meta.find_commit(outcome.commit.unwrap()).unwrap();
    assert_eq!(new_commit.parent_count(), 1);
    assert_eq!(new_commit.parent_id(0).unwrap(), m1);
    assert_eq!(new_commit.message().unwrap(), "add sub t");
    assert_eq!(new_commit.author().name(), Some("Donor Author"));

    let index = meta.index().unwrap();
    assert_eq!(index.get_path(Path::new("t"), 0).unwrap().id, tc);
    let gitmodules =
        fs::read_to_string(meta.workdir().unwrap().join(".gitmodules")).unwrap();
    assert!(gitmodules.contains("[submodule \"t\"]"));
    assert!(SequencerState::load_any(&meta).unwrap().is_none());
}

#[test]
fn cherry_pick_conflict_then_abort_restores_state() {
    let td = TempDir::new().unwrap();
    let (s_origin, s0) = init_sub_origin(td.path(), "s", &[("f.txt", "base\n")]);
    let sa = commit_on(&s_origin, s0, &[("f.txt", "ours\n")], "s: ours");
    let sb = commit_on(&s_origin, s0, &[("f.txt", "theirs\n")], "s: theirs");

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    let m1 = commit_meta(&meta, "add s");

    // donor: parent records s at sa, child moves it to the conflicting sb
    let c = {
        stage_gitlink_only(&meta, "s", sb);
        let mut index = meta.index().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = meta.find_tree(tree_id).unwrap();
        let sig = meta.signature().unwrap();
        let parent = meta.find_commit(m1).unwrap();
        meta.commit(None, &sig, &sig, "bump s", &tree, &[&parent])
            .unwrap()
    };
    pin(&meta, c);
    let object = meta.find_object(m1, None).unwrap();
    meta.reset(&object, git2::ResetType::Hard, None).unwrap();

    let err = cherry_pick::cherry_pick(&meta, &c.to_string(), 0).unwrap_err();
    assert!(matches!(err, MetaError::Conflicts { .. }));
    assert!(SequencerState::load(&meta, SequencerKind::CherryPick)
        .unwrap()
        .is_some());
    // the conflict was materialized in an opened working tree
    let sub_path = meta.workdir().unwrap().join("s");
    assert!(sub_path.join(".git").is_file());

    cherry_pick::cherry_pick_abort(&meta).unwrap();
    assert!(SequencerState::load_any(&meta).unwrap().is_none());
    assert_eq!(meta.head().unwrap().target(), Some(m1));
    let sub = Repository::open(&sub_path).unwrap();
    assert_eq!(sub.head().unwrap().target(), Some(sa));
    assert!(!sub.path().join("rebase-merge").exists());
    assert_eq!(
        fs::read_to_string(sub_path.join("f.txt")).unwrap(),
        "ours\n"
    );
}

#[test]
fn rebase_replays_divergent_sub_changes() {
    let td = TempDir::new().unwrap();
    let (s_origin, sa) = init_sub_origin(td.path(), "s", &[("base.txt", "base\n")]);
    let sb = commit_on(&s_origin, sa, &[("b.txt", "b\n")], "s: b");
    let sc = commit_on(&s_origin, sa, &[("c.txt", "c\n")], "s: c");

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    commit_meta(&meta, "add s");

    create_branch(&meta, "topic");
    checkout_branch(&meta, "topic");
    stage_gitlink_only(&meta, "s", sb);
    let m2 = commit_meta(&meta, "topic: bump s");
    checkout_branch(&meta, "master");
    stage_gitlink_only(&meta, "s", sc);
    let m1 = commit_meta(&meta, "master: bump s");
    checkout_branch(&meta, "topic");

    let outcome = rebase::rebase(&meta, "master", 0).unwrap();
    let new_head = outcome.head.unwrap();
    assert_ne!(new_head, m2);
    assert_eq!(meta.head().unwrap().shorthand(), Some("topic"));

    let new_commit = meta.find_commit(new_head).unwrap();
    assert_eq!(new_commit.parent_id(0).unwrap(), m1);
    assert_eq!(new_commit.message().unwrap(), "topic: bump s");

    // the sub commit was replayed onto master's sub tip
    let new_sub_sha = util::gitlink_at(&new_commit.tree().unwrap(), "s").unwrap();
    let sub = Repository::open(meta.path().join("modules/s")).unwrap();
    let new_sub = sub.find_commit(new_sub_sha).unwrap();
    assert_eq!(new_sub.parent_id(0).unwrap(), sc);
    let tree = new_sub.tree().unwrap();
    assert!(tree.get_path(Path::new("b.txt")).is_ok());
    assert!(tree.get_path(Path::new("c.txt")).is_ok());

    assert!(SequencerState::load(&meta, SequencerKind::Rebase)
        .unwrap()
        .is_none());
    assert_eq!(outcome.commit_map.get(&new_head), Some(&m2));
}

#[test]
fn rebase_onto_ancestor_is_a_no_op() {
    let td = TempDir::new().unwrap();
    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    let m0 = commit_all(&meta, "initial");
    write_file(meta.workdir().unwrap(), "VERSION", "2\n");
    commit_all(&meta, "version 2");
    let outcome = rebase::rebase(&meta, &m0.to_string(), 0).unwrap();
    assert!(outcome.head.is_none());
}

#[test]
fn list_rebase_commits_orders_parents_first_and_skips_merges() {
    let td = TempDir::new().unwrap();
    let repo = init_repo(&td.path().join("repo"));
    write_file(repo.workdir().unwrap(), "a.txt", "1\n");
    let c1 = commit_all(&repo, "c1");
    create_branch(&repo, "side");
    write_file(repo.workdir().unwrap(), "a.txt", "2\n");
    let c2 = commit_all(&repo, "c2");
    checkout_branch(&repo, "side");
    write_file(repo.workdir().unwrap(), "b.txt", "b\n");
    let b1 = commit_all(&repo, "b1");
    checkout_branch(&repo, "master");

    // merge commit m with parents [c2, b1]
    let sig = repo.signature().unwrap();
    let c2_commit = repo.find_commit(c2).unwrap();
    let b1_commit = repo.find_commit(b1).unwrap();
    let mut index = repo
        .merge_commits(&c2_commit, &b1_commit, None)
        .unwrap();
    let tree_id = index.write_tree_to(&repo).unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let m = repo
        .commit(Some("HEAD"), &sig, &sig, "m", &tree, &[&c2_commit, &b1_commit])
        .unwrap();
    let mut co = CheckoutBuilder::new();
    co.force();
    repo.checkout_head(Some(&mut co)).unwrap();
    write_file(repo.workdir().unwrap(), "c.txt", "c\n");
    let c4 = commit_all(&repo, "c4");

    let commits = rebase::list_rebase_commits(&repo, c4, c1).unwrap();
    assert!(!commits.contains(&m));
    assert!(!commits.contains(&c1));
    let pos = |oid: Oid| commits.iter().position(|c| *c == oid).unwrap();
    assert!(pos(c2) < pos(c4));
    assert!(pos(b1) < pos(c4));
    assert_eq!(commits.len(), 3);
}

#[test]
fn stitch_inlines_sub_history_and_converges() {
    let td = TempDir::new().unwrap();
    let (s_origin, sa) = init_sub_origin(
        td.path(),
        "s",
        &[("README.md", "sub s\n"), ("data.txt", "1\n")],
    );
    let sb = commit_on(&s_origin, sa, &[("data.txt", "2\n")], "s: data 2");

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "README.md", "meta\n");
    let a = commit_all(&meta, "A");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    let b = commit_meta(&meta, "B: add s");
    stage_gitlink_only(&meta, "s", sb);
    let c = commit_meta(&meta, "C: bump s");

    let opts = StitchOptions {
        keep: vec!["t".to_string()],
        fetch: true,
        ..Default::default()
    };
    let outcome = stitch::stitch(&meta, "HEAD", &opts).unwrap();
    assert_eq!(outcome.converted, 3);
    assert_eq!(outcome.skipped, 0);
    let stitched_c = outcome.head.unwrap();

    // linear stitched chain mirroring A -> B -> C
    let c_commit = meta.find_commit(stitched_c).unwrap();
    assert_eq!(c_commit.parent_count(), 1);
    let b_commit = c_commit.parent(0).unwrap();
    assert_eq!(b_commit.parent_count(), 1);
    let a_commit = b_commit.parent(0).unwrap();
    assert_eq!(a_commit.parent_count(), 0);

    // sub content inlined at its path
    let c_tree = c_commit.tree().unwrap();
    assert!(c_tree.get_path(Path::new("README.md")).is_ok());
    let data = c_tree.get_path(Path::new("s/data.txt")).unwrap();
    let blob = meta.find_blob(data.id()).unwrap();
    assert_eq!(blob.content(), b"2\n");
    let b_tree = b_commit.tree().unwrap();
    let b_data = b_tree.get_path(Path::new("s/data.txt")).unwrap();
    assert_eq!(meta.find_blob(b_data.id()).unwrap().content(), b"1\n");
    assert!(a_commit.tree().unwrap().get_path(Path::new("s")).is_err());
    // .gitmodules does not survive stitching
    assert!(c_tree.get_path(Path::new(".gitmodules")).is_err());

    // conversion notes cover the whole history
    for oid in [a, b, c] {
        assert!(meta
            .find_note(Some(stitch::NOTES_CONVERTED), oid)
            .is_ok());
    }
    let reference = meta
        .find_note(Some(stitch::NOTES_REFERENCE), stitched_c)
        .unwrap();
    let payload: serde_json::Value =
        serde_json::from_str(reference.message().unwrap()).unwrap();
    assert_eq!(payload["metaRepoCommit"], c.to_string());
    assert_eq!(payload["submoduleCommits"]["s"], sb.to_string());

    // stitching again converges: nothing new
    let again = stitch::stitch(&meta, "HEAD", &opts).unwrap();
    assert_eq!(again.converted, 0);
    assert_eq!(again.head, Some(stitched_c));
}

fn setup_server(td: &TempDir) -> (Repository, PathBuf, Oid, Oid) {
    let (s_origin, sa) = init_sub_origin(td.path(), "s", &[("f.txt", "s\n")]);
    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), sa);
    let head = commit_meta(&meta, "add s");

    // server-side bare sub repo, discovered through the url mapping
    let server_sub = td.path().join("server").join("s.git");
    Repository::init_bare(&server_sub).unwrap();
    GitCli::new()
        .fetch_sha(&server_sub, s_origin.to_str().unwrap(), &sa.to_string())
        .unwrap();

    let origins = td.path().join("origins");
    let mut cfg = meta.config().unwrap();
    cfg.set_str("gitmeta.subrepourlbase", origins.to_str().unwrap())
        .unwrap();
    cfg.set_str(
        "gitmeta.subreporootpath",
        td.path().join("server").to_str().unwrap(),
    )
    .unwrap();
    cfg.set_str("gitmeta.subreposuffix", ".git").unwrap();
    (meta, server_sub, head, sa)
}

#[test]
fn pre_receive_meta_rejects_unpinned_sub_commit() {
    let td = TempDir::new().unwrap();
    let (meta, _server_sub, head, _sa) = setup_server(&td);
    let line = format!("{ZERO} {head} refs/heads/master\n");
    let mut input = std::io::Cursor::new(line);
    let (messages, code) = pre_receive::pre_receive(
        meta.workdir().unwrap(),
        HookMode::Meta,
        &mut input,
    )
    .unwrap();
    assert_eq!(code, 1);
    assert!(messages[0].contains("refs/heads/master"));
}

#[test]
fn pre_receive_meta_accepts_pinned_sub_commit_and_stamps_note() {
    let td = TempDir::new().unwrap();
    let (meta, server_sub, head, sa) = setup_server(&td);
    let sub = Repository::open_bare(&server_sub).unwrap();
    sub.reference(&format!("refs/commits/{sa}"), sa, true, "pin")
        .unwrap();

    let line = format!("{ZERO} {head} refs/heads/master\n");
    let mut input = std::io::Cursor::new(line);
    let (_, code) = pre_receive::pre_receive(
        meta.workdir().unwrap(),
        HookMode::Meta,
        &mut input,
    )
    .unwrap();
    assert_eq!(code, 0);
    assert!(meta
        .find_note(Some(pre_receive::CHECK_NOTES_REF), head)
        .is_ok());
}

#[test]
fn ref_gc_prunes_only_redundant_synthetic_refs() {
    let td = TempDir::new().unwrap();
    let (s_origin, s1) = init_sub_origin(td.path(), "s", &[("f.txt", "1\n")]);
    let s2 = commit_on(&s_origin, s1, &[("f.txt", "2\n")], "s: 2");

    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    stage_sub(&meta, "s", s_origin.to_str().unwrap(), s2);
    commit_meta(&meta, "add s at s2");

    let server_sub = td.path().join("server").join("s.git");
    Repository::init_bare(&server_sub).unwrap();
    let cli = GitCli::new();
    cli.fetch_sha(&server_sub, s_origin.to_str().unwrap(), &s2.to_string())
        .unwrap();
    let sub = Repository::open_bare(&server_sub).unwrap();
    sub.reference(&format!("refs/commits/{s1}"), s1, true, "pin")
        .unwrap();
    sub.reference(&format!("refs/commits/{s2}"), s2, true, "pin")
        .unwrap();

    let origins = td.path().join("origins");
    let mut cfg = meta.config().unwrap();
    cfg.set_str("gitmeta.subrepourlbase", origins.to_str().unwrap())
        .unwrap();
    cfg.set_str(
        "gitmeta.subreporootpath",
        td.path().join("server").to_str().unwrap(),
    )
    .unwrap();
    cfg.set_str("gitmeta.subreposuffix", ".git").unwrap();

    let dry = ref_gc::run(&meta, &ref_gc::RefGcOptions { dry_run: true }).unwrap();
    assert!(dry
        .messages
        .iter()
        .any(|m| m.contains(&format!("Would remove refs/commits/{s1}"))));
    assert!(sub.find_reference(&format!("refs/commits/{s1}")).is_ok());

    ref_gc::run(&meta, &ref_gc::RefGcOptions { dry_run: false }).unwrap();
    assert!(sub.find_reference(&format!("refs/commits/{s1}")).is_err());
    assert!(sub.find_reference(&format!("refs/commits/{s2}")).is_ok());
}

#[test]
fn continue_without_operation_reports_user_error() {
    let td = TempDir::new().unwrap();
    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    commit_all(&meta, "initial");
    assert!(matches!(
        merge::merge_continue(&meta).unwrap_err(),
        MetaError::NoMergeInProgress
    ));
    assert!(matches!(
        cherry_pick::cherry_pick_continue(&meta).unwrap_err(),
        MetaError::NoCherryPickInProgress
    ));
    assert!(matches!(
        rebase::rebase_continue(&meta).unwrap_err(),
        MetaError::NoRebaseInProgress
    ));
}

#[test]
fn operations_refuse_to_stack() {
    let td = TempDir::new().unwrap();
    let meta = init_repo(&td.path().join("meta"));
    write_file(meta.workdir().unwrap(), "VERSION", "1\n");
    let head = commit_all(&meta, "initial");
    // fake an in-progress cherry-pick
    SequencerState {
        kind: SequencerKind::CherryPick,
        original_head: meta::sequencer::RefTarget::new(head, None),
        target: meta::sequencer::RefTarget::new(head, None),
        current_commit: 0,
        commits: vec![head],
        message: "pick".to_string(),
    }
    .write(&meta)
    .unwrap();

    assert!(matches!(
        merge::merge(&meta, "HEAD", &MergeOptions::default()).unwrap_err(),
        MetaError::CherryPickInProgress
    ));
    assert!(matches!(
        rebase::rebase(&meta, "HEAD", 0).unwrap_err(),
        MetaError::CherryPickInProgress
    ));
}
