//! Small libgit2 helpers shared by the engines.

use std::collections::BTreeMap;

use git2::{
    build::CheckoutBuilder, Index, IndexEntry, IndexTime, ObjectType, Oid, Repository, Tree,
    TreeWalkMode, TreeWalkResult,
};

use crate::{
    config::GITLINK_MODE,
    error::{MetaError, Result},
};

/// Stage a gitlink entry for `name` at `oid`. The object does not need to
/// exist in the meta object database; gitlinks point into foreign odbs.
pub fn stage_gitlink(index: &mut Index, name: &str, oid: Oid) -> Result<()> {
    let entry = IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: GITLINK_MODE,
        uid: 0,
        gid: 0,
        file_size: 0,
        id: oid,
        flags: 0,
        flags_extended: 0,
        path: name.as_bytes().to_vec(),
    };
    index.add(&entry)?;
    Ok(())
}

/// All gitlink entries of a tree, keyed by slash-joined path.
pub fn tree_gitlinks(tree: &Tree) -> Result<BTreeMap<String, Oid>> {
    let mut links = BTreeMap::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.filemode() as u32 == GITLINK_MODE {
            if let Some(name) = entry.name() {
                links.insert(format!("{root}{name}"), entry.id());
            }
        }
        TreeWalkResult::Ok
    })?;
    Ok(links)
}

/// The gitlink sha recorded for `name` in a tree, if any.
pub fn gitlink_at(tree: &Tree, name: &str) -> Option<Oid> {
    let entry = tree.get_path(std::path::Path::new(name)).ok()?;
    (entry.filemode() as u32 == GITLINK_MODE).then(|| entry.id())
}

/// True when `commit` has `ancestor` in its history (or equals it).
pub fn descendant_of(repo: &Repository, commit: Oid, ancestor: Oid) -> Result<bool> {
    if commit == ancestor {
        return Ok(true);
    }
    Ok(repo.graph_descendant_of(commit, ancestor)?)
}

/// Resolve a user-supplied revision to a commit id.
pub fn resolve_commit(repo: &Repository, spec: &str) -> Result<Oid> {
    let object = repo
        .revparse_single(spec)
        .map_err(|_| MetaError::BadRevision(spec.to_string()))?;
    let commit = object
        .peel(ObjectType::Commit)
        .map_err(|_| MetaError::BadRevision(spec.to_string()))?;
    Ok(commit.id())
}

pub fn head_oid(repo: &Repository) -> Result<Option<Oid>> {
    match repo.head() {
        Ok(head) => Ok(head.target()),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(None),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Branch ref name (`refs/heads/...`) when HEAD is attached.
pub fn head_branch(repo: &Repository) -> Result<Option<String>> {
    if repo.head_detached().unwrap_or(false) {
        return Ok(None);
    }
    match repo.head() {
        Ok(head) => Ok(head.name().map(|n| n.to_string())),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Force-checkout `oid` and leave HEAD detached on it.
pub fn detach_checkout(repo: &Repository, oid: Oid) -> Result<()> {
    let object = repo.find_object(oid, Some(ObjectType::Commit))?;
    let mut co = CheckoutBuilder::new();
    co.force();
    repo.checkout_tree(&object, Some(&mut co))?;
    repo.set_head_detached(oid)?;
    Ok(())
}

/// Move the current branch (or detached HEAD) to `oid`, force-updating the
/// working tree to match.
pub fn move_head_to(repo: &Repository, oid: Oid) -> Result<()> {
    let branch = head_branch(repo)?;
    let object = repo.find_object(oid, Some(ObjectType::Commit))?;
    let mut co = CheckoutBuilder::new();
    co.force();
    repo.checkout_tree(&object, Some(&mut co))?;
    match branch {
        Some(refname) => {
            repo.reference(&refname, oid, true, "convoy: move head")?;
            repo.set_head(&refname)?;
        }
        None => repo.set_head_detached(oid)?,
    }
    Ok(())
}

/// Point a sub's HEAD at `oid`. Open subs get a hard reset so the workdir
/// follows; bare and half-open subs only move the ref.
pub fn set_sub_head(sub: &Repository, oid: Oid) -> Result<()> {
    if sub.is_bare() || sub.workdir().is_none() {
        sub.set_head_detached(oid)?;
        return Ok(());
    }
    let object = sub.find_object(oid, Some(ObjectType::Commit))?;
    sub.set_head_detached(oid)?;
    sub.reset(&object, git2::ResetType::Hard, None)?;
    Ok(())
}

/// Pin a sub commit with a synthetic ref so server-side GC keeps it.
pub fn write_synthetic_ref(repo: &Repository, oid: Oid) -> Result<()> {
    repo.reference(
        &format!("refs/commits/{oid}"),
        oid,
        true,
        "convoy: pin submodule commit",
    )?;
    Ok(())
}

const STAGE_SHIFT: u16 = 12;

fn conflict_stage_entry(path: &str, mode: u32, id: Oid, stage: u16) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: 0,
        id,
        flags: stage << STAGE_SHIFT,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

/// Replace whatever is staged at `path` with ancestor/our/their conflict
/// stages.
pub fn stage_conflict(
    index: &mut Index,
    path: &str,
    ancestor: Option<(u32, Oid)>,
    ours: Option<(u32, Oid)>,
    theirs: Option<(u32, Oid)>,
) -> Result<()> {
    let _ = index.remove_path(std::path::Path::new(path));
    if let Some((mode, id)) = ancestor {
        index.add(&conflict_stage_entry(path, mode, id, 1))?;
    }
    if let Some((mode, id)) = ours {
        index.add(&conflict_stage_entry(path, mode, id, 2))?;
    }
    if let Some((mode, id)) = theirs {
        index.add(&conflict_stage_entry(path, mode, id, 3))?;
    }
    Ok(())
}

/// Paths of index entries currently in conflict.
pub fn conflicted_paths(index: &Index) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref());
        if let Some(entry) = entry {
            paths.push(String::from_utf8_lossy(&entry.path).to_string());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}
