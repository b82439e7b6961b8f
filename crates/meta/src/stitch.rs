//! Flatten a meta history into a single linear history by inlining each
//! sub's tree at its path.
//!
//! Conversion is incremental and idempotent: every converted meta commit is
//! recorded under `refs/notes/stitched/converted` (empty content means the
//! commit was skipped as empty), so re-running stitch over the same history
//! creates nothing new. Two more notes namespaces carry bookkeeping: a
//! `reference` JSON blob on each stitched commit pointing back at its
//! sources, and a `change_cache` entry per meta commit so repeated runs skip
//! re-diffing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use git2::{Oid, Repository};
use serde::{Deserialize, Serialize};

use crate::{
    cli::GitCli,
    config::{self, GITLINK_MODE, GITMODULES},
    error::{MetaError, Result},
    ident, util,
    work_queue::{self, DEFAULT_CONCURRENCY},
};

pub const NOTES_CONVERTED: &str = "refs/notes/stitched/converted";
pub const NOTES_REFERENCE: &str = "refs/notes/stitched/reference";
pub const NOTES_CHANGE_CACHE: &str = "refs/notes/stitched/change_cache";
pub const NOTES_WHITELIST: &str = "refs/notes/stitched/whitelist";

const TREE_MODE: i32 = 0o040000;

#[derive(Debug, Clone, Default)]
pub struct StitchOptions {
    /// Branch to advance to the newest stitched commit.
    pub target_branch: Option<String>,
    pub num_parallel: usize,
    /// Globs naming subs to keep as gitlinks instead of inlining.
    pub keep: Vec<String>,
    /// Drop meta commits whose stitched tree equals their parent's.
    pub skip_empty: bool,
    /// Fetch missing sub commits into the meta object database.
    pub fetch: bool,
    /// Base url overriding the meta origin for relative sub urls.
    pub url: Option<String>,
    /// Subtree to extract; paths outside it are dropped.
    pub join_root: Option<String>,
}

#[derive(Debug, Default)]
pub struct StitchOutcome {
    pub head: Option<Oid>,
    pub converted: usize,
    pub skipped: usize,
}

/// Post-order a commit graph given an explicit parent map: every parent
/// precedes every child. Entries missing from the map are skipped.
pub fn list_commits_in_order(entry: Oid, parents: &HashMap<Oid, Vec<Oid>>) -> Vec<Oid> {
    let mut ordered = Vec::new();
    let mut visited: HashSet<Oid> = HashSet::new();
    // (oid, parents_done)
    let mut stack: Vec<(Oid, bool)> = vec![(entry, false)];
    while let Some((oid, parents_done)) = stack.pop() {
        let Some(parent_ids) = parents.get(&oid) else {
            continue;
        };
        if parents_done {
            if visited.insert(oid) {
                ordered.push(oid);
            }
            continue;
        }
        if visited.contains(&oid) {
            continue;
        }
        stack.push((oid, true));
        for parent in parent_ids {
            if !visited.contains(parent) {
                stack.push((*parent, false));
            }
        }
    }
    ordered
}

/// Unconverted ancestors of `head` in stitch order.
pub fn list_commits_to_stitch(
    repo: &Repository,
    head: Oid,
    converted: &HashMap<Oid, Option<Oid>>,
) -> Result<Vec<Oid>> {
    let mut parents: HashMap<Oid, Vec<Oid>> = HashMap::new();
    let mut queue = vec![head];
    while let Some(oid) = queue.pop() {
        if parents.contains_key(&oid) || converted.contains_key(&oid) {
            continue;
        }
        let commit = repo.find_commit(oid)?;
        let parent_ids: Vec<Oid> = commit.parent_ids().collect();
        for parent in &parent_ids {
            if !converted.contains_key(parent) {
                queue.push(*parent);
            }
        }
        parents.insert(oid, parent_ids);
    }
    Ok(list_commits_in_order(head, &parents))
}

/// Returns a path adjuster that strips `root/` (also matching `root`
/// itself) and drops paths outside the root. Without a root it is the
/// identity.
pub fn make_adjust_path_function(root: Option<&str>) -> impl Fn(&str) -> Option<String> + '_ {
    let root = root.map(|r| r.trim_end_matches('/').to_string());
    move |path: &str| match &root {
        None => Some(path.to_string()),
        Some(root) => {
            if path == root {
                Some(String::new())
            } else {
                path.strip_prefix(&format!("{root}/")).map(|p| p.to_string())
            }
        }
    }
}

/// Minimal glob matching: `*` matches any run of characters.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[derive(Serialize, Deserialize)]
struct CachedChange {
    #[serde(rename = "oldSha")]
    old_sha: Option<String>,
    #[serde(rename = "newSha")]
    new_sha: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ReferenceNote {
    #[serde(rename = "metaRepoCommit")]
    meta_repo_commit: String,
    #[serde(rename = "submoduleCommits")]
    submodule_commits: BTreeMap<String, String>,
}

/// Per-sub `(old, new)` gitlink deltas of `commit` vs its first parent,
/// cached in the change-cache notes namespace.
fn sub_changes(
    repo: &Repository,
    commit: &git2::Commit<'_>,
) -> Result<BTreeMap<String, (Option<Oid>, Option<Oid>)>> {
    if let Ok(note) = repo.find_note(Some(NOTES_CHANGE_CACHE), commit.id())
        && let Some(text) = note.message()
        && let Ok(cached) = serde_json::from_str::<BTreeMap<String, CachedChange>>(text)
    {
        let mut out = BTreeMap::new();
        for (name, c) in cached {
            let old = c.old_sha.as_deref().map(Oid::from_str).transpose().ok().flatten();
            let new = c.new_sha.as_deref().map(Oid::from_str).transpose().ok().flatten();
            out.insert(name, (old, new));
        }
        return Ok(out);
    }

    let new_links = util::tree_gitlinks(&commit.tree()?)?;
    let old_links = if commit.parent_count() > 0 {
        util::tree_gitlinks(&commit.parent(0)?.tree()?)?
    } else {
        BTreeMap::new()
    };
    let mut out = BTreeMap::new();
    for (name, sha) in &new_links {
        match old_links.get(name) {
            Some(old) if old == sha => {}
            old => {
                out.insert(name.clone(), (old.copied(), Some(*sha)));
            }
        }
    }
    for (name, old) in &old_links {
        if !new_links.contains_key(name) {
            out.insert(name.clone(), (Some(*old), None));
        }
    }

    let cached: BTreeMap<String, CachedChange> = out
        .iter()
        .map(|(name, (old, new))| {
            (
                name.clone(),
                CachedChange {
                    old_sha: old.map(|o| o.to_string()),
                    new_sha: new.map(|o| o.to_string()),
                },
            )
        })
        .collect();
    let sig = ident::committer(repo)?;
    repo.note(
        &sig,
        &sig,
        Some(NOTES_CHANGE_CACHE),
        commit.id(),
        &serde_json::to_string(&cached)
            .map_err(|e| MetaError::Internal(format!("change cache encode failed: {e}")))?,
        true,
    )?;
    Ok(out)
}

struct TreeEntrySpec {
    oid: Oid,
    filemode: i32,
}

/// Build a tree from a flat `path -> entry` map.
fn build_tree(repo: &Repository, entries: &BTreeMap<String, TreeEntrySpec>) -> Result<Oid> {
    // Group this level's direct children, recursing for subdirectories.
    let mut files: BTreeMap<&str, &TreeEntrySpec> = BTreeMap::new();
    let mut dirs: BTreeMap<&str, BTreeMap<String, TreeEntrySpec>> = BTreeMap::new();
    for (path, spec) in entries {
        match path.split_once('/') {
            None => {
                files.insert(path, spec);
            }
            Some((dir, rest)) => {
                dirs.entry(dir).or_default().insert(
                    rest.to_string(),
                    TreeEntrySpec {
                        oid: spec.oid,
                        filemode: spec.filemode,
                    },
                );
            }
        }
    }
    let mut builder = repo.treebuilder(None)?;
    for (name, spec) in files {
        builder.insert(name, spec.oid, spec.filemode)?;
    }
    for (name, children) in dirs {
        let sub_oid = build_tree(repo, &children)?;
        builder.insert(name, sub_oid, TREE_MODE)?;
    }
    Ok(builder.write()?)
}

/// Inline one meta commit into a stitched commit.
///
/// `changes` is consulted for the message trailer blocks; the tree itself is
/// rebuilt from the full meta tree so unchanged subs inline correctly too.
/// Returns `None` when `skip_empty` and the tree matches the first parent's.
#[allow(clippy::too_many_arguments)]
pub fn write_stitched_commit(
    repo: &Repository,
    commit: &git2::Commit<'_>,
    changes: &BTreeMap<String, (Option<Oid>, Option<Oid>)>,
    parents: &[Oid],
    keep_as_submodule: &dyn Fn(&str) -> bool,
    adjust_path: &dyn Fn(&str) -> Option<String>,
    skip_empty: bool,
    whitelisted: bool,
) -> Result<Option<(Oid, BTreeMap<String, Oid>)>> {
    let mut entries: BTreeMap<String, TreeEntrySpec> = BTreeMap::new();
    let mut sub_commits: BTreeMap<String, Oid> = BTreeMap::new();
    let mut missing: Vec<String> = Vec::new();

    let tree = commit.tree()?;
    tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
        let Some(name) = entry.name() else {
            return git2::TreeWalkResult::Ok;
        };
        let path = format!("{root}{name}");
        if path == GITMODULES {
            return git2::TreeWalkResult::Ok;
        }
        let filemode = entry.filemode();
        if filemode == TREE_MODE {
            return git2::TreeWalkResult::Ok;
        }
        let Some(adjusted) = adjust_path(&path) else {
            return git2::TreeWalkResult::Ok;
        };
        if filemode as u32 == GITLINK_MODE {
            if keep_as_submodule(&path) {
                entries.insert(
                    adjusted,
                    TreeEntrySpec {
                        oid: entry.id(),
                        filemode,
                    },
                );
                return git2::TreeWalkResult::Ok;
            }
            match repo.find_commit(entry.id()) {
                Ok(sub_commit) => {
                    if adjusted.is_empty() {
                        // The join root is the sub itself: its tree becomes
                        // the stitched root.
                        if let Ok(sub_tree) = repo.find_tree(sub_commit.tree_id()) {
                            let _ = sub_tree.walk(git2::TreeWalkMode::PreOrder, |r, e| {
                                if e.filemode() != TREE_MODE
                                    && let Some(n) = e.name()
                                {
                                    entries.insert(
                                        format!("{r}{n}"),
                                        TreeEntrySpec {
                                            oid: e.id(),
                                            filemode: e.filemode(),
                                        },
                                    );
                                }
                                git2::TreeWalkResult::Ok
                            });
                        }
                    } else {
                        entries.insert(
                            adjusted,
                            TreeEntrySpec {
                                oid: sub_commit.tree_id(),
                                filemode: TREE_MODE,
                            },
                        );
                    }
                    sub_commits.insert(path, entry.id());
                }
                Err(_) => missing.push(path),
            }
        } else {
            entries.insert(
                adjusted,
                TreeEntrySpec {
                    oid: entry.id(),
                    filemode,
                },
            );
        }
        git2::TreeWalkResult::Ok
    })?;
    if !missing.is_empty() && !whitelisted {
        return Err(MetaError::SubHeadMissing(missing.join(", ")));
    }

    let tree_oid = build_tree(repo, &entries)?;
    if skip_empty
        && let Some(first) = parents.first()
        && repo.find_commit(*first)?.tree_id() == tree_oid
    {
        return Ok(None);
    }

    let message = stitched_message(repo, commit, changes, &sub_commits)?;
    let new_tree = repo.find_tree(tree_oid)?;
    let parent_commits: Vec<git2::Commit<'_>> = parents
        .iter()
        .map(|oid| repo.find_commit(*oid))
        .collect::<std::result::Result<_, git2::Error>>()?;
    let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();
    let stitched = repo.commit(
        None,
        &commit.author(),
        &commit.committer(),
        &message,
        &new_tree,
        &parent_refs,
    )?;
    Ok(Some((stitched, sub_commits)))
}

/// The stitched message: the meta message, then one block per sub whose
/// author or timestamp differs from the meta commit. The format is a stable
/// contract; tests assert it line for line.
fn stitched_message(
    repo: &Repository,
    commit: &git2::Commit<'_>,
    changes: &BTreeMap<String, (Option<Oid>, Option<Oid>)>,
    sub_commits: &BTreeMap<String, Oid>,
) -> Result<String> {
    let mut message = commit.message().unwrap_or("").to_string();
    if !message.ends_with('\n') {
        message.push('\n');
    }
    for (name, (_, new)) in changes {
        let Some(new) = new else { continue };
        if !sub_commits.contains_key(name) {
            continue;
        }
        let Ok(sub_commit) = repo.find_commit(*new) else {
            continue;
        };
        let sub_author = sub_commit.author();
        let meta_author = commit.author();
        let same_ident = sub_author.name() == meta_author.name()
            && sub_author.email() == meta_author.email()
            && sub_commit.time() == commit.time();
        if same_ident {
            continue;
        }
        message.push_str(&format!(
            "From '{name}'\n[Author: {} <{}>]\n[Date: {} {:+05}]\n{}\n",
            sub_author.name().unwrap_or(""),
            sub_author.email().unwrap_or(""),
            sub_commit.time().seconds(),
            sub_commit.time().offset_minutes(),
            sub_commit.message().unwrap_or("").trim_end()
        ));
    }
    Ok(message)
}

fn read_notes_map(repo: &Repository, ns: &str) -> Result<HashMap<Oid, Option<Oid>>> {
    let mut map = HashMap::new();
    let notes = match repo.notes(Some(ns)) {
        Ok(notes) => notes,
        Err(_) => return Ok(map),
    };
    for item in notes {
        let (_, annotated) = item?;
        let content = repo
            .find_note(Some(ns), annotated)
            .ok()
            .and_then(|n| n.message().map(|m| m.trim().to_string()))
            .unwrap_or_default();
        let stitched = if content.is_empty() {
            None
        } else {
            Oid::from_str(&content).ok()
        };
        map.insert(annotated, stitched);
    }
    Ok(map)
}

/// Effective stitched parent for `meta`: walks past skipped commits.
fn resolve_stitched_parent(
    repo: &Repository,
    converted: &HashMap<Oid, Option<Oid>>,
    meta: Oid,
) -> Result<Option<Oid>> {
    let mut current = meta;
    loop {
        match converted.get(&current) {
            Some(Some(stitched)) => return Ok(Some(*stitched)),
            Some(None) => {
                let commit = repo.find_commit(current)?;
                if commit.parent_count() == 0 {
                    return Ok(None);
                }
                current = commit.parent_id(0)?;
            }
            None => return Ok(None),
        }
    }
}

/// Fetch the sub commits `commit` pins into the meta object database.
fn fetch_sub_commits(
    repo: &Repository,
    commit: &git2::Commit<'_>,
    changes: &BTreeMap<String, (Option<Oid>, Option<Oid>)>,
    opts: &StitchOptions,
) -> Result<()> {
    let urls = config::urls_at(repo, Some(commit.id()))?;
    let origin = match &opts.url {
        Some(url) => Some(url.clone()),
        None => repo
            .find_remote("origin")
            .ok()
            .and_then(|r| r.url().map(|u| u.to_string())),
    };
    let mut to_fetch: Vec<(String, Oid)> = Vec::new();
    for (name, (_, new)) in changes {
        let Some(new) = new else { continue };
        if !repo.odb()?.exists(*new) {
            to_fetch.push((name.clone(), *new));
        }
    }
    if to_fetch.is_empty() {
        return Ok(());
    }
    let concurrency = if opts.num_parallel == 0 {
        DEFAULT_CONCURRENCY
    } else {
        opts.num_parallel
    };
    let repo_path = repo.path().to_path_buf();
    work_queue::do_in_parallel(to_fetch, concurrency, |_, (name, sha)| {
        let raw = urls
            .get(&name)
            .ok_or_else(|| MetaError::NoSubmoduleUrl(name.clone()))?;
        let url = config::resolve_url(origin.as_deref(), raw)?;
        GitCli::new()
            .fetch_sha(&repo_path, &url, &sha.to_string())
            .map_err(|e| MetaError::FetchFailed {
                name: name.clone(),
                sha: sha.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    })?;
    Ok(())
}

/// Stitch all unconverted ancestors of `committish`.
pub fn stitch(repo: &Repository, committish: &str, opts: &StitchOptions) -> Result<StitchOutcome> {
    let head = util::resolve_commit(repo, committish)?;
    let mut converted = read_notes_map(repo, NOTES_CONVERTED)?;
    let whitelist: BTreeSet<Oid> = read_notes_map(repo, NOTES_WHITELIST)?
        .into_keys()
        .collect();
    let commits = list_commits_to_stitch(repo, head, &converted)?;
    let adjust = make_adjust_path_function(opts.join_root.as_deref());
    let keep = |name: &str| opts.keep.iter().any(|glob| glob_match(glob, name));
    let sig = ident::committer(repo)?;

    let mut outcome = StitchOutcome::default();
    for oid in commits {
        let commit = repo.find_commit(oid)?;
        let changes = sub_changes(repo, &commit)?;
        if opts.fetch {
            fetch_sub_commits(repo, &commit, &changes, opts)?;
        }
        let mut parents: Vec<Oid> = Vec::new();
        for parent in commit.parent_ids() {
            if let Some(stitched) = resolve_stitched_parent(repo, &converted, parent)? {
                parents.push(stitched);
            }
        }
        parents.dedup();

        let result = write_stitched_commit(
            repo,
            &commit,
            &changes,
            &parents,
            &keep,
            &adjust,
            opts.skip_empty,
            whitelist.contains(&oid),
        )?;
        match result {
            Some((stitched, sub_commits)) => {
                repo.note(
                    &sig,
                    &sig,
                    Some(NOTES_CONVERTED),
                    oid,
                    &stitched.to_string(),
                    true,
                )?;
                let reference = ReferenceNote {
                    meta_repo_commit: oid.to_string(),
                    submodule_commits: sub_commits
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_string()))
                        .collect(),
                };
                repo.note(
                    &sig,
                    &sig,
                    Some(NOTES_REFERENCE),
                    stitched,
                    &serde_json::to_string(&reference)
                        .map_err(|e| MetaError::Internal(format!("reference encode: {e}")))?,
                    true,
                )?;
                converted.insert(oid, Some(stitched));
                outcome.head = Some(stitched);
                outcome.converted += 1;
            }
            None => {
                // Note content stays empty: the marker for "skipped".
                repo.note(&sig, &sig, Some(NOTES_CONVERTED), oid, "", true)?;
                converted.insert(oid, None);
                outcome.skipped += 1;
            }
        }
    }

    if outcome.head.is_none() {
        outcome.head = resolve_stitched_parent(repo, &converted, head)?;
    }
    if let (Some(branch), Some(stitched)) = (&opts.target_branch, outcome.head) {
        repo.reference(
            &format!("refs/heads/{branch}"),
            stitched,
            true,
            "convoy: stitch",
        )?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> Oid {
        Oid::from_str(&format!("{n:02x}").repeat(20)).unwrap()
    }

    #[test]
    fn commits_in_order_puts_parents_first() {
        // 1 <- 2 <- 4, 1 <- 3 <- 4 (diamond)
        let mut parents = HashMap::new();
        parents.insert(oid(1), vec![]);
        parents.insert(oid(2), vec![oid(1)]);
        parents.insert(oid(3), vec![oid(1)]);
        parents.insert(oid(4), vec![oid(2), oid(3)]);
        let ordered = list_commits_in_order(oid(4), &parents);
        assert_eq!(ordered.len(), 4);
        let pos = |o: Oid| ordered.iter().position(|x| *x == o).unwrap();
        assert!(pos(oid(1)) < pos(oid(2)));
        assert!(pos(oid(1)) < pos(oid(3)));
        assert!(pos(oid(2)) < pos(oid(4)));
        assert!(pos(oid(3)) < pos(oid(4)));
    }

    #[test]
    fn commits_in_order_skips_missing_entries() {
        let mut parents = HashMap::new();
        parents.insert(oid(2), vec![oid(1)]); // 1 is not in the map
        let ordered = list_commits_in_order(oid(2), &parents);
        assert_eq!(ordered, vec![oid(2)]);
    }

    #[test]
    fn adjust_path_strips_root() {
        let adjust = make_adjust_path_function(Some("apps/web"));
        assert_eq!(adjust("apps/web/src/a.js"), Some("src/a.js".to_string()));
        assert_eq!(adjust("apps/web"), Some(String::new()));
        assert_eq!(adjust("apps/other/b.js"), None);
        let identity = make_adjust_path_function(None);
        assert_eq!(identity("x/y"), Some("x/y".to_string()));
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("t", "t"));
        assert!(glob_match("lib/*", "lib/foo"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("lib/*", "app/foo"));
        assert!(glob_match("a*c", "abbbc"));
        assert!(!glob_match("a*c", "abbbd"));
    }
}
