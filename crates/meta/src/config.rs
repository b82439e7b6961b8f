//! `.gitmodules` and `.git/config` submodule bookkeeping.
//!
//! The parser is deliberately tolerant: it accepts anything vaguely INI-like
//! and only captures the `url` key of `[submodule "<name>"]` sections. The
//! writer is canonical: sorted stanzas, `path` and `url` keys only, so two
//! repos with the same sub set produce byte-identical files.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use git2::{Index, IndexEntry, IndexTime, Repository};

use crate::error::{MetaError, Result};

pub const GITMODULES: &str = ".gitmodules";

/// Mode bits of a gitlink tree/index entry.
pub const GITLINK_MODE: u32 = 0o160000;
const BLOB_MODE: u32 = 0o100644;

/// Extract `name -> url` from `.gitmodules` content. A trailing slash on a
/// section name is stripped; sections without a `url` key are dropped.
pub fn parse_gitmodules(text: &str) -> BTreeMap<String, String> {
    let mut urls = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(name) = parse_submodule_section(line) {
            current = Some(name.trim_end_matches('/').to_string());
        } else if line.starts_with('[') {
            current = None;
        } else if let Some((key, value)) = line.split_once('=')
            && key.trim() == "url"
            && let Some(name) = &current
        {
            urls.insert(name.clone(), value.trim().to_string());
        }
    }
    urls
}

/// Names of `[submodule "<name>"]` sections present in a `.git/config` body.
pub fn parse_open_subs(config_text: &str) -> BTreeSet<String> {
    config_text
        .lines()
        .filter_map(|line| parse_submodule_section(line.trim()))
        .collect()
}

fn parse_submodule_section(line: &str) -> Option<String> {
    let rest = line.strip_prefix("[submodule")?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let (name, tail) = rest.split_once('"')?;
    if !tail.trim_start().starts_with(']') {
        return None;
    }
    Some(name.to_string())
}

/// Render the canonical `.gitmodules` body for a url map.
pub fn write_gitmodules(urls: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, url) in urls {
        out.push_str(&format!(
            "[submodule \"{name}\"]\n\tpath = {name}\n\turl = {url}\n"
        ));
    }
    out
}

/// Remove the `[submodule "<name>"]` stanza from a config file, deleting
/// lines until the next `[section]` or EOF. A missing stanza is a no-op.
pub fn clear_config_entry(config_path: &Path, name: &str) -> Result<()> {
    let text = match fs::read_to_string(config_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut out = String::with_capacity(text.len());
    let mut skipping = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if parse_submodule_section(trimmed).as_deref() == Some(name) {
            skipping = true;
            continue;
        }
        if skipping && trimmed.starts_with('[') {
            skipping = false;
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }
    fs::write(config_path, out)?;
    Ok(())
}

/// Resolve a possibly-relative submodule url against the meta origin url.
pub fn resolve_url(meta_url: Option<&str>, url: &str) -> Result<String> {
    if !url.starts_with("./") && !url.starts_with("../") && url != "." && url != ".." {
        return Ok(url.to_string());
    }
    let base = meta_url.ok_or_else(|| MetaError::RelativeUrlWithoutOrigin(url.to_string()))?;
    let (prefix, path) = match base.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
            (format!("{scheme}://{host}"), path.to_string())
        }
        None => (String::new(), base.to_string()),
    };
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for part in url.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if prefix.is_empty() {
        Ok(segments.join("/"))
    } else {
        Ok(format!("{prefix}/{}", segments.join("/")))
    }
}

fn modules_dir(meta: &Repository) -> PathBuf {
    meta.path().join("modules")
}

/// Gitdir of a (possibly not yet initialized) sub inside the meta repo.
pub fn sub_git_dir(meta: &Repository, name: &str) -> PathBuf {
    modules_dir(meta).join(name)
}

pub fn sub_workdir(meta: &Repository, name: &str) -> Option<PathBuf> {
    meta.workdir().map(|w| w.join(name))
}

/// Initialize the `.git/config` stanza and the repository under
/// `.git/modules/<name>` for a sub, wiring the workdir gitdir-link unless
/// `bare`. Idempotent over an existing modules dir.
pub fn init_submodule_and_repo(
    meta_url: Option<&str>,
    meta: &Repository,
    name: &str,
    url: &str,
    template_path: Option<&Path>,
    bare: bool,
) -> Result<Repository> {
    let config_path = meta.path().join("config");
    clear_config_entry(&config_path, name)?;
    let resolved = resolve_url(meta_url, url)?;
    append_config_stanza(&config_path, name, &resolved)?;

    let git_dir = sub_git_dir(meta, name);
    fs::create_dir_all(&git_dir)?;
    let mut opts = git2::RepositoryInitOptions::new();
    opts.bare(true);
    let sub = Repository::init_opts(&git_dir, &opts)?;

    if let Some(template) = template_path {
        copy_dir_contents(template, &git_dir)?;
    }

    if !bare {
        let workdir = sub_workdir(meta, name).ok_or_else(|| {
            MetaError::Internal("cannot materialize a submodule in a bare meta repo".to_string())
        })?;
        fs::create_dir_all(&workdir)?;
        let depth = name.split('/').count();
        let link = format!("gitdir: {}.git/modules/{name}\n", "../".repeat(depth));
        fs::write(workdir.join(".git"), link)?;
        let ups = depth + 2;
        let mut cfg = sub.config()?;
        cfg.set_bool("core.bare", false)?;
        cfg.set_str("core.worktree", &format!("{}{name}", "../".repeat(ups)))?;
    }

    match sub.find_remote("origin") {
        Ok(remote) => {
            if remote.url() != Some(resolved.as_str()) {
                sub.remote_set_url("origin", &resolved)?;
            }
        }
        Err(_) => {
            sub.remote("origin", &resolved)?;
        }
    }

    // Reopen so core.worktree takes effect on the handle we give back.
    let open_at = if bare {
        git_dir
    } else {
        sub_workdir(meta, name).expect("non-bare meta has a workdir")
    };
    Ok(Repository::open(open_at)?)
}

fn append_config_stanza(config_path: &Path, name: &str, url: &str) -> Result<()> {
    let mut text = match fs::read_to_string(config_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    if !text.is_empty() {
        text.push('\n');
    }
    text.push_str(&format!("[submodule \"{name}\"]\n\turl = {url}\n"));
    fs::write(config_path, text)?;
    Ok(())
}

fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_dir_contents(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Re-materialize `.gitmodules` from a url map. With `cached`, the blob is
/// written straight to the object database and staged without touching the
/// working tree; this is what keeps bare merges off the filesystem.
pub fn write_urls(
    repo: &Repository,
    index: &mut Index,
    urls: &BTreeMap<String, String>,
    cached: bool,
) -> Result<()> {
    if urls.is_empty() {
        if !cached && let Some(workdir) = repo.workdir() {
            let path = workdir.join(GITMODULES);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        // remove_path errors if the entry is absent; tolerate that.
        let _ = index.remove_path(Path::new(GITMODULES));
        return Ok(());
    }
    let content = write_gitmodules(urls);
    if cached {
        let oid = repo.blob(content.as_bytes())?;
        index.add(&blob_entry(oid, GITMODULES))?;
    } else {
        let workdir = repo
            .workdir()
            .ok_or_else(|| MetaError::Internal("bare repo needs cached .gitmodules".to_string()))?;
        fs::write(workdir.join(GITMODULES), content)?;
        index.add_path(Path::new(GITMODULES))?;
    }
    Ok(())
}

fn blob_entry(id: git2::Oid, path: &str) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: BLOB_MODE,
        uid: 0,
        gid: 0,
        file_size: 0,
        id,
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

/// Read the url map recorded in a commit's `.gitmodules`, or the working
/// tree's copy when no commit is pinned.
pub fn urls_at(repo: &Repository, commit: Option<git2::Oid>) -> Result<BTreeMap<String, String>> {
    match commit {
        Some(oid) => {
            let tree = repo.find_commit(oid)?.tree()?;
            match tree.get_name(GITMODULES) {
                Some(entry) => {
                    let blob = repo.find_blob(entry.id())?;
                    Ok(parse_gitmodules(&String::from_utf8_lossy(blob.content())))
                }
                None => Ok(BTreeMap::new()),
            }
        }
        None => {
            let Some(workdir) = repo.workdir() else {
                return Ok(BTreeMap::new());
            };
            match fs::read_to_string(workdir.join(GITMODULES)) {
                Ok(text) => Ok(parse_gitmodules(&text)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tolerates_noise_and_strips_trailing_slash() {
        let text = "\n; comment\n[submodule \"a/\"]\n  url = http://x/a\n\
                    [core]\n  bare = false\n[submodule \"b\"]\n\turl=http://x/b\n";
        let urls = parse_gitmodules(text);
        assert_eq!(urls.get("a").map(String::as_str), Some("http://x/a"));
        assert_eq!(urls.get("b").map(String::as_str), Some("http://x/b"));
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn write_then_parse_round_trips() {
        let mut urls = BTreeMap::new();
        urls.insert("z".to_string(), "http://host/z".to_string());
        urls.insert("a/b".to_string(), "../sibling".to_string());
        assert_eq!(parse_gitmodules(&write_gitmodules(&urls)), urls);
    }

    #[test]
    fn writer_sorts_by_name() {
        let mut urls = BTreeMap::new();
        urls.insert("zz".to_string(), "u1".to_string());
        urls.insert("aa".to_string(), "u2".to_string());
        let text = write_gitmodules(&urls);
        assert!(text.find("aa").unwrap() < text.find("zz").unwrap());
    }

    #[test]
    fn clear_config_entry_removes_whole_stanza() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(
            &path,
            "[core]\n\tbare = false\n[submodule \"s\"]\n\turl = u\n\textra = 1\n[user]\n\tname = n\n",
        )
        .unwrap();
        clear_config_entry(&path, "s").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("submodule"));
        assert!(!text.contains("extra"));
        assert!(text.contains("[core]"));
        assert!(text.contains("[user]"));
        // idempotent
        clear_config_entry(&path, "s").unwrap();
    }

    #[test]
    fn resolve_relative_urls() {
        assert_eq!(
            resolve_url(Some("https://host/org/meta"), "../other").unwrap(),
            "https://host/org/other"
        );
        assert_eq!(
            resolve_url(Some("https://host/org/meta"), "./sub").unwrap(),
            "https://host/org/meta/sub"
        );
        assert_eq!(
            resolve_url(None, "https://host/abs").unwrap(),
            "https://host/abs"
        );
        assert!(matches!(
            resolve_url(None, "../other"),
            Err(MetaError::RelativeUrlWithoutOrigin(_))
        ));
    }
}
