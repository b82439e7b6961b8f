//! Composite reset across the meta repo and its open subs.

use std::path::{Path, PathBuf};

use git2::{ObjectType, Oid, Repository, ResetType};

use crate::{
    error::{MetaError, Result},
    opener::{self, OpenMode, Opener},
    sparse, util,
    work_queue::{self, DEFAULT_CONCURRENCY},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Mixed,
    Hard,
}

impl From<ResetKind> for ResetType {
    fn from(kind: ResetKind) -> ResetType {
        match kind {
            ResetKind::Soft => ResetType::Soft,
            ResetKind::Mixed => ResetType::Mixed,
            ResetKind::Hard => ResetType::Hard,
        }
    }
}

/// Reset the meta repo to `target`, then bring every affected or open sub
/// along with the same semantics.
pub fn reset(repo: &Repository, target: Oid, kind: ResetKind, concurrency: usize) -> Result<()> {
    let head = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("meta repository has no HEAD commit".to_string()))?;
    let head_links = util::tree_gitlinks(&repo.find_commit(head)?.tree()?)?;
    let target_links = util::tree_gitlinks(&repo.find_commit(target)?.tree()?)?;

    let object = repo.find_object(target, Some(ObjectType::Commit))?;
    repo.reset(&object, kind.into(), None)?;

    let open = opener::list_open_subs(repo)?;

    // Subs the target does not carry at all get deinit'd outright; their
    // directory is no longer a submodule path, so it goes too. The gitdir
    // under .git/modules stays.
    if kind == ResetKind::Hard {
        let removed: Vec<String> = open
            .iter()
            .filter(|n| !target_links.contains_key(*n))
            .cloned()
            .collect();
        if !removed.is_empty() {
            crate::deinit::deinit_subs(repo, &removed)?;
            if let Some(workdir) = repo.workdir() {
                for name in &removed {
                    let dir = workdir.join(name);
                    if dir.is_dir() {
                        std::fs::remove_dir_all(&dir)?;
                    }
                }
            }
        }
    }
    let mut names: Vec<String> = Vec::new();
    for (name, sha) in &target_links {
        if head_links.get(name) != Some(sha) {
            names.push(name.clone());
        }
    }
    for name in head_links.keys() {
        if !target_links.contains_key(name) {
            names.push(name.clone());
        }
    }
    names.extend(open.iter().cloned());
    names.sort();
    names.dedup();

    let opener = Opener::new(repo, Some(target));
    let concurrency = if concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    };

    work_queue::do_in_parallel(names, concurrency, |_, name| {
        let in_head = head_links.contains_key(&name);
        let in_target = target_links.contains_key(&name);
        if !(in_head && in_target) {
            // Added or removed across the reset: the meta-level reset
            // already staged the right thing; there is no sub state to move.
            tracing::debug!(name, "sub added/removed across reset; skipping");
            return Ok(());
        }
        let is_open = open.contains(&name);
        if kind == ResetKind::Hard && !is_open {
            return Ok(());
        }
        let sha = target_links[&name];
        let sub = opener.get_subrepo(&name, OpenMode::ForceOpen)?;
        opener.fetcher()?.fetch_sha(&sub.path, &name, sha)?;
        let sub_repo = sub.open()?;
        let object = sub_repo.find_object(sha, Some(ObjectType::Commit))?;
        sub_repo.set_head_detached(sha)?;
        sub_repo.reset(&object, kind.into(), None)?;
        Ok(())
    })?;

    let mut index = repo.index()?;
    let open_now = opener::list_open_subs(repo)?;
    for name in target_links.keys() {
        if open_now.contains(name) {
            index.add_path(Path::new(name))?;
        }
    }
    if sparse::in_sparse_mode(repo)? {
        sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
    } else {
        index.write()?;
    }
    Ok(())
}

/// Path-mode reset: un-stage the named paths against HEAD, routing paths
/// that address an open sub to that sub's own index.
pub fn reset_paths(
    repo: &Repository,
    cwd: Option<&Path>,
    target: Oid,
    paths: &[String],
) -> Result<()> {
    let head = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("meta repository has no HEAD commit".to_string()))?;
    if target != head {
        return Err(MetaError::CannotResetNonHead);
    }
    let workdir = repo
        .workdir()
        .ok_or_else(|| MetaError::Internal("path-mode reset needs a working tree".to_string()))?
        .canonicalize()?;

    let open = opener::list_open_subs(repo)?;
    let mut meta_paths: Vec<String> = Vec::new();
    for path in paths {
        let abs = match cwd {
            Some(cwd) if !Path::new(path).is_absolute() => cwd.join(path),
            _ => PathBuf::from(path),
        };
        let abs = if abs.is_absolute() {
            abs
        } else {
            workdir.join(&abs)
        };
        let rel = normalize(&abs)
            .strip_prefix(&workdir)
            .map_err(|_| MetaError::PathsOutsideWorkTree(path.clone()))?
            .to_string_lossy()
            .replace('\\', "/");

        let owning_sub = open
            .iter()
            .find(|n| rel == **n || rel.starts_with(&format!("{n}/")));
        match owning_sub {
            Some(name) => {
                let sub_repo = Repository::open(workdir.join(name))?;
                let sub_head = util::head_oid(&sub_repo)?
                    .ok_or_else(|| MetaError::SubHeadMissing(name.clone()))?;
                let object = sub_repo.find_object(sub_head, Some(ObjectType::Commit))?;
                let sub_path = if rel == *name {
                    "*".to_string()
                } else {
                    rel[name.len() + 1..].to_string()
                };
                sub_repo.reset_default(Some(&object), [sub_path])?;
                sub_repo.index()?.write()?;
            }
            None => meta_paths.push(rel),
        }
    }
    if !meta_paths.is_empty() {
        let object = repo.find_object(head, Some(ObjectType::Commit))?;
        repo.reset_default(Some(&object), meta_paths)?;
        repo.index()?.write()?;
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
