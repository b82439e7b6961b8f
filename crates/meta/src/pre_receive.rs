//! Server-side pre-receive checks.
//!
//! The meta variant guarantees that every sub commit a pushed meta ref pins
//! is itself pinned by a `refs/commits/<sha>` synthetic ref in the sub's
//! server-side repo, so nothing a meta commit points at can be collected.
//! The submodule variant only admits pushes that create such synthetic refs.

use std::{
    collections::{HashSet, VecDeque},
    io::BufRead,
    path::Path,
};

use git2::{Oid, Repository};

use crate::{
    config,
    error::{MetaError, Result},
    ref_gc::{self, SYNTHETIC_REF_PREFIX},
    util,
};

pub const CHECK_NOTES_REF: &str = "refs/notes/git-meta/subrepo-check";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    Meta,
    Submodule,
}

#[derive(Debug)]
struct RefUpdate {
    old: Oid,
    new: Oid,
    refname: String,
}

fn parse_updates(input: &mut dyn BufRead) -> Result<Vec<RefUpdate>> {
    let mut updates = Vec::new();
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(old), Some(new), Some(refname)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(MetaError::Internal(format!(
                "malformed pre-receive line: {line}"
            )));
        };
        updates.push(RefUpdate {
            old: Oid::from_str(old)
                .map_err(|_| MetaError::Internal(format!("bad old sha: {old}")))?,
            new: Oid::from_str(new)
                .map_err(|_| MetaError::Internal(format!("bad new sha: {new}")))?,
            refname: refname.to_string(),
        });
    }
    Ok(updates)
}

/// Run the hook over stdin-format input. Returns the messages to print and
/// the process exit code (0 accept, 1 reject).
pub fn pre_receive(
    repo_path: &Path,
    mode: HookMode,
    input: &mut dyn BufRead,
) -> Result<(Vec<String>, i32)> {
    let updates = parse_updates(input)?;
    match mode {
        HookMode::Submodule => Ok(check_submodule_push(&updates)),
        HookMode::Meta => check_meta_push(repo_path, &updates),
    }
}

/// Sub repos only accept pushes of `refs/commits/<sha>` pointing at `sha`.
fn check_submodule_push(updates: &[RefUpdate]) -> (Vec<String>, i32) {
    let mut messages = Vec::new();
    for update in updates {
        let accepted = update
            .refname
            .strip_prefix(SYNTHETIC_REF_PREFIX)
            .and_then(|hex| Oid::from_str(hex).ok())
            .is_some_and(|named| named == update.new);
        if !accepted {
            messages.push(format!(
                "rejected {}: only {SYNTHETIC_REF_PREFIX}<sha> refs naming the pushed commit are accepted",
                update.refname
            ));
            return (messages, 1);
        }
    }
    (messages, 0)
}

fn check_meta_push(repo_path: &Path, updates: &[RefUpdate]) -> Result<(Vec<String>, i32)> {
    let repo = Repository::open(repo_path)?;
    // Quarantine support: pushed objects may still live in the alternate
    // object directories git exposes to the hook.
    if let Ok(dir) = std::env::var("GIT_OBJECT_DIRECTORY") {
        repo.odb()?.add_disk_alternate(&dir)?;
    }
    if let Ok(dirs) = std::env::var("GIT_ALTERNATE_OBJECT_DIRECTORIES") {
        for dir in dirs.split(':').filter(|d| !d.is_empty()) {
            repo.odb()?.add_disk_alternate(dir)?;
        }
    }
    let mapping = ref_gc::url_mapping(&repo)?;
    let mut messages = Vec::new();

    for update in updates {
        if !update.refname.starts_with("refs/heads/") || update.new.is_zero() {
            continue;
        }
        for oid in commits_to_check(&repo, update)? {
            let commit = repo.find_commit(oid)?;
            let new_links = util::tree_gitlinks(&commit.tree()?)?;
            let old_links = if commit.parent_count() > 0 {
                util::tree_gitlinks(&commit.parent(0)?.tree()?)?
            } else {
                Default::default()
            };
            let urls = config::urls_at(&repo, Some(oid))?;
            for (name, sha) in &new_links {
                if old_links.get(name) == Some(sha) {
                    continue;
                }
                let Some(url) = urls.get(name) else {
                    messages.push(format!(
                        "rejected {}: submodule '{name}' has no configured url",
                        update.refname
                    ));
                    return Ok((messages, 1));
                };
                let Some(sub_path) = mapping.local_path(url) else {
                    messages.push(format!(
                        "rejected {}: cannot locate server repo for submodule '{name}'",
                        update.refname
                    ));
                    return Ok((messages, 1));
                };
                if !has_synthetic_ref(&sub_path, *sha) {
                    messages.push(format!(
                        "rejected {}: submodule '{name}' commit {sha} has no {SYNTHETIC_REF_PREFIX}{sha}",
                        update.refname
                    ));
                    return Ok((messages, 1));
                }
            }
        }
        // Stamp the tip so the next push only walks the new commits.
        let sig = git2::Signature::now("git-convoy", "git-convoy@localhost")?;
        repo.note(&sig, &sig, Some(CHECK_NOTES_REF), update.new, "ok", true)?;
    }
    Ok((messages, 0))
}

/// History of `new` back to `old` or to any commit bearing a positive
/// check-note; those boundaries are not re-checked.
fn commits_to_check(repo: &Repository, update: &RefUpdate) -> Result<Vec<Oid>> {
    let mut out = Vec::new();
    let mut seen: HashSet<Oid> = HashSet::new();
    let mut queue: VecDeque<Oid> = VecDeque::new();
    queue.push_back(update.new);
    while let Some(oid) = queue.pop_front() {
        if !seen.insert(oid) {
            continue;
        }
        if !update.old.is_zero() && oid == update.old {
            continue;
        }
        let checked = repo
            .find_note(Some(CHECK_NOTES_REF), oid)
            .ok()
            .and_then(|n| n.message().map(|m| m.trim() == "ok"))
            .unwrap_or(false);
        if checked {
            continue;
        }
        let commit = repo.find_commit(oid)?;
        out.push(oid);
        for parent in commit.parent_ids() {
            queue.push_back(parent);
        }
    }
    Ok(out)
}

fn has_synthetic_ref(sub_path: &Path, sha: Oid) -> bool {
    let Ok(sub) = Repository::open_bare(sub_path) else {
        return false;
    };
    sub.find_reference(&format!("{SYNTHETIC_REF_PREFIX}{sha}"))
        .ok()
        .and_then(|r| r.target())
        .is_some_and(|target| target == sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(old: &str, new: &str, refname: &str) -> RefUpdate {
        RefUpdate {
            old: Oid::from_str(old).unwrap(),
            new: Oid::from_str(new).unwrap(),
            refname: refname.to_string(),
        }
    }

    const A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const ZERO: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn submodule_hook_accepts_matching_synthetic_ref() {
        let (messages, code) =
            check_submodule_push(&[update(ZERO, A, &format!("refs/commits/{A}"))]);
        assert_eq!(code, 0);
        assert!(messages.is_empty());
    }

    #[test]
    fn submodule_hook_rejects_mismatched_sha() {
        let (_, code) = check_submodule_push(&[update(ZERO, B, &format!("refs/commits/{A}"))]);
        assert_eq!(code, 1);
    }

    #[test]
    fn submodule_hook_rejects_branch_pushes() {
        let (messages, code) = check_submodule_push(&[update(ZERO, A, "refs/heads/master")]);
        assert_eq!(code, 1);
        assert!(messages[0].contains("refs/heads/master"));
    }

    #[test]
    fn parses_update_lines() {
        let mut input = std::io::Cursor::new(format!("{ZERO} {A} refs/heads/x\n"));
        let updates = parse_updates(&mut input).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].refname, "refs/heads/x");
    }
}
