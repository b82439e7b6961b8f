//! Classify the per-sub deltas between two meta commits against HEAD.
//!
//! Every gitlink delta lands in one of three buckets: `simple` (apply by
//! staging — add, remove, fast-forward), `changes` (both sides moved from a
//! shared point — needs a per-sub pick or merge), or `conflicts` (no
//! automatic resolution).

use std::collections::BTreeMap;

use git2::{Delta, DiffOptions, Oid, Repository, Tree};

use crate::{
    config::{self, GITLINK_MODE, GITMODULES},
    error::{MetaError, Result},
    util,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleKind {
    Add,
    Remove,
    FastForward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleChange {
    pub kind: SimpleKind,
    /// Target sha for add/fast-forward; `None` for remove.
    pub sha: Option<Oid>,
    pub old_sha: Option<Oid>,
}

/// One sub moved on both sides of a history split; replaying `old..new`
/// onto `our` is required. Exactly one of these exists per sub per commit
/// pair, and `old != new` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmoduleChange {
    pub old_sha: Option<Oid>,
    pub new_sha: Option<Oid>,
    pub our_sha: Option<Oid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictEntry {
    pub mode: u32,
    pub sha: Oid,
}

impl ConflictEntry {
    fn gitlink(sha: Oid) -> Self {
        Self {
            mode: GITLINK_MODE,
            sha,
        }
    }
}

/// Per-path three-sided conflict record; at least one of ours/theirs is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub ancestor: Option<ConflictEntry>,
    pub ours: Option<ConflictEntry>,
    pub theirs: Option<ConflictEntry>,
}

#[derive(Debug, Default)]
pub struct ComputedChanges {
    pub changes: BTreeMap<String, SubmoduleChange>,
    pub simple: BTreeMap<String, SimpleChange>,
    pub conflicts: BTreeMap<String, Conflict>,
    /// Non-gitlink paths (other than `.gitmodules`) touched by the commit;
    /// cherry-pick and rebase refuse when this is non-empty.
    pub non_sub_paths: Vec<String>,
}

fn empty_tree(repo: &Repository) -> Result<Tree<'_>> {
    let oid = repo.treebuilder(None)?.write()?;
    Ok(repo.find_tree(oid)?)
}

/// Classify what `commit` changes, relative either to its first parent or to
/// `merge_base(HEAD, commit)`.
pub fn compute_changes(repo: &Repository, commit: Oid, from_base: bool) -> Result<ComputedChanges> {
    let head_oid = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("meta repository has no HEAD commit".to_string()))?;
    let commit_obj = repo.find_commit(commit)?;
    let base_tree = if from_base {
        let base = repo
            .merge_base(head_oid, commit)
            .map_err(|_| MetaError::NoCommonAncestor(head_oid.to_string(), commit.to_string()))?;
        repo.find_commit(base)?.tree()?
    } else if commit_obj.parent_count() > 0 {
        commit_obj.parent(0)?.tree()?
    } else {
        empty_tree(repo)?
    };
    let commit_tree = commit_obj.tree()?;
    let head_tree = repo.find_commit(head_oid)?.tree()?;

    let mut opts = DiffOptions::new();
    opts.include_typechange(true);
    let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&commit_tree), Some(&mut opts))?;

    let mut out = ComputedChanges::default();
    for delta in diff.deltas() {
        let path = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        if path == GITMODULES {
            continue;
        }
        let old_is_link = delta.old_file().mode() == git2::FileMode::Commit;
        let new_is_link = delta.new_file().mode() == git2::FileMode::Commit;
        if !old_is_link && !new_is_link {
            out.non_sub_paths.push(path);
            continue;
        }

        let old = match delta.status() {
            Delta::Added => None,
            _ if old_is_link => Some(delta.old_file().id()),
            _ => None,
        };
        let new = match delta.status() {
            Delta::Deleted => None,
            _ if new_is_link => Some(delta.new_file().id()),
            _ => None,
        };
        classify(&head_tree, &path, old, new, &mut out);
    }
    Ok(out)
}

fn classify(
    head_tree: &Tree<'_>,
    path: &str,
    old: Option<Oid>,
    new: Option<Oid>,
    out: &mut ComputedChanges,
) {
    let head_entry = head_tree.get_path(std::path::Path::new(path)).ok();
    let head_link = head_entry
        .as_ref()
        .filter(|e| e.filemode() as u32 == GITLINK_MODE)
        .map(|e| e.id());
    let conflict = |out: &mut ComputedChanges, ours: Option<Oid>| {
        out.conflicts.insert(
            path.to_string(),
            Conflict {
                ancestor: old.map(ConflictEntry::gitlink),
                ours: ours.map(ConflictEntry::gitlink),
                theirs: new.map(ConflictEntry::gitlink),
            },
        );
    };

    match head_entry {
        None => match (old, new) {
            (None, Some(sha)) => {
                out.simple.insert(
                    path.to_string(),
                    SimpleChange {
                        kind: SimpleKind::Add,
                        sha: Some(sha),
                        old_sha: None,
                    },
                );
            }
            // Removed on our side too: nothing left to do.
            (Some(_), None) => {}
            (Some(_), Some(_)) => conflict(out, None),
            (None, None) => {}
        },
        // The path exists at HEAD but is not a gitlink there.
        Some(_) if head_link.is_none() => conflict(out, None),
        Some(_) => {
            let s = head_link.expect("checked above");
            match (old, new) {
                (None, Some(v)) => {
                    if s != v {
                        conflict(out, Some(s));
                    }
                }
                (Some(v), None) => {
                    if s == v {
                        out.simple.insert(
                            path.to_string(),
                            SimpleChange {
                                kind: SimpleKind::Remove,
                                sha: None,
                                old_sha: Some(v),
                            },
                        );
                    } else {
                        conflict(out, Some(s));
                    }
                }
                (Some(v), Some(w)) => {
                    if s == v {
                        out.changes.insert(
                            path.to_string(),
                            SubmoduleChange {
                                old_sha: Some(v),
                                new_sha: Some(w),
                                our_sha: Some(s),
                            },
                        );
                    } else if s == w {
                        out.simple.insert(
                            path.to_string(),
                            SimpleChange {
                                kind: SimpleKind::FastForward,
                                sha: Some(w),
                                old_sha: Some(v),
                            },
                        );
                    } else {
                        conflict(out, Some(s));
                    }
                }
                (None, None) => {}
            }
        }
    }
}

/// True iff the `.gitmodules` diff between `base` and `commit` changes the
/// url of a sub present on both sides. Those edits cannot be replayed.
pub fn contains_url_changes(
    repo: &Repository,
    commit: Oid,
    base: Option<Oid>,
) -> Result<bool> {
    let commit_obj = repo.find_commit(commit)?;
    let base = match base {
        Some(oid) => Some(oid),
        None if commit_obj.parent_count() > 0 => Some(commit_obj.parent_id(0)?),
        None => None,
    };
    let base_urls = match base {
        Some(oid) => config::urls_at(repo, Some(oid))?,
        None => BTreeMap::new(),
    };
    let new_urls = config::urls_at(repo, Some(commit))?;
    for (name, url) in &new_urls {
        if let Some(old_url) = base_urls.get(name)
            && old_url != url
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Three-way merge of `.gitmodules` url maps. Returns `None` when the same
/// name was changed to different urls on both sides.
pub fn merge_url_maps(
    base: &BTreeMap<String, String>,
    ours: &BTreeMap<String, String>,
    theirs: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, String>> {
    let mut names: Vec<&String> = ours.keys().chain(theirs.keys()).collect();
    names.sort();
    names.dedup();
    let mut merged = BTreeMap::new();
    for name in names {
        let b = base.get(name);
        let o = ours.get(name);
        let t = theirs.get(name);
        let winner = match (o, t) {
            (Some(o), Some(t)) if o == t => Some(o),
            (Some(o), Some(t)) => {
                if o == b.unwrap_or(o) {
                    Some(t)
                } else if t == b.unwrap_or(t) {
                    Some(o)
                } else {
                    return None;
                }
            }
            (Some(o), None) => {
                // theirs deleted; keep only if ours did not change it
                if b == Some(o) { None } else if b.is_none() { Some(o) } else { return None; }
            }
            (None, Some(t)) => {
                if b == Some(t) { None } else if b.is_none() { Some(t) } else { return None; }
            }
            (None, None) => None,
        };
        if let Some(url) = winner {
            merged.insert(name.clone(), url.clone());
        }
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_url_maps_takes_changed_side() {
        let base = map(&[("s", "u1"), ("t", "u2")]);
        let ours = map(&[("s", "u1"), ("t", "u2"), ("x", "u3")]);
        let theirs = map(&[("s", "u9"), ("t", "u2")]);
        let merged = merge_url_maps(&base, &ours, &theirs).unwrap();
        assert_eq!(merged, map(&[("s", "u9"), ("t", "u2"), ("x", "u3")]));
    }

    #[test]
    fn merge_url_maps_conflicts_on_divergent_edit() {
        let base = map(&[("s", "u1")]);
        let ours = map(&[("s", "u2")]);
        let theirs = map(&[("s", "u3")]);
        assert!(merge_url_maps(&base, &ours, &theirs).is_none());
    }

    #[test]
    fn merge_url_maps_respects_agreed_deletion() {
        let base = map(&[("s", "u1"), ("t", "u2")]);
        let ours = map(&[("t", "u2")]);
        let theirs = map(&[("t", "u2")]);
        let merged = merge_url_maps(&base, &ours, &theirs).unwrap();
        assert_eq!(merged, map(&[("t", "u2")]));
    }
}
