//! Rebase a range of meta commits onto a new base, replaying each one's sub
//! changes with nested per-sub rebases.
//!
//! The meta driver works tree-level: each original commit is three-way
//! merged (`parent`, `current head`, `commit`) in memory, gitlink conflicts
//! are resolved by rebasing the sub's range onto its current tip, and the
//! result is committed with the original author and message. HEAD stays
//! detached until the whole range lands, then the original branch is moved.

use std::collections::BTreeMap;

use git2::{Oid, Repository, Sort};

use crate::{
    changes, checkout,
    config::{self, GITLINK_MODE, GITMODULES},
    error::{MetaError, Result},
    ident,
    opener::{self, OpenMode, Opener},
    sequencer::{RefTarget, SequencerKind, SequencerState},
    sparse, status, util,
    work_queue::DEFAULT_CONCURRENCY,
};

/// Result of replaying a range of sub commits onto a new tip.
pub(crate) struct SubReplay {
    /// Created commit → the original it replays.
    pub commit_map: BTreeMap<Oid, Oid>,
    /// Tip after the replay; `None` when every commit was already applied.
    pub new_head: Option<Oid>,
    /// Original commit that stopped the replay with conflicts.
    pub conflicted: Option<Oid>,
}

/// Replay the commits of `tip` not reachable from `upstream` onto `onto`.
/// In-memory replays never touch a working tree and report conflicts by
/// returning; on-disk replays stop at the conflict and leave git's rebase
/// state behind for `continue_sub_rebase`.
pub(crate) fn replay_sub_range(
    repo: &Repository,
    upstream: Oid,
    tip: Oid,
    onto: Oid,
    in_memory: bool,
) -> Result<SubReplay> {
    let branch = repo.find_annotated_commit(tip)?;
    let upstream = repo.find_annotated_commit(upstream)?;
    let onto_ac = repo.find_annotated_commit(onto)?;
    let mut opts = git2::RebaseOptions::new();
    opts.inmemory(in_memory);
    let mut rebase = repo.rebase(
        Some(&branch),
        Some(&upstream),
        Some(&onto_ac),
        Some(&mut opts),
    )?;
    let committer = ident::committer(repo)?;

    let mut map = BTreeMap::new();
    let mut last: Option<Oid> = None;
    while let Some(op) = rebase.next() {
        let op = op?;
        let orig = op.id();
        let has_conflicts = if in_memory {
            rebase.inmemory_index()?.has_conflicts()
        } else {
            repo.index()?.has_conflicts()
        };
        if has_conflicts {
            if in_memory {
                rebase.abort()?;
            }
            return Ok(SubReplay {
                commit_map: map,
                new_head: last,
                conflicted: Some(orig),
            });
        }
        match rebase.commit(None, &committer, None) {
            Ok(new_oid) => {
                map.insert(new_oid, orig);
                last = Some(new_oid);
            }
            // Nothing left of the patch; skip it like `git rebase` does.
            Err(e) if e.code() == git2::ErrorCode::Applied => {}
            Err(e) => return Err(e.into()),
        }
    }
    rebase.finish(None)?;
    Ok(SubReplay {
        commit_map: map,
        new_head: last,
        conflicted: None,
    })
}

pub(crate) fn sub_rebase_in_progress(repo: &Repository) -> bool {
    repo.path().join("rebase-merge").exists() || repo.path().join("rebase-apply").exists()
}

/// Resume an on-disk sub rebase after the user resolved and staged. Returns
/// the final head.
pub(crate) fn continue_sub_rebase(repo: &Repository) -> Result<Oid> {
    let mut rebase = repo.open_rebase(None)?;
    let committer = ident::committer(repo)?;
    let index = repo.index()?;
    if index.has_conflicts() {
        return Err(MetaError::UnresolvedConflicts {
            paths: util::conflicted_paths(&index)?,
        });
    }
    let mut last = match rebase.commit(None, &committer, None) {
        Ok(oid) => Some(oid),
        Err(e) if e.code() == git2::ErrorCode::Applied => None,
        Err(e) => return Err(e.into()),
    };
    while let Some(op) = rebase.next() {
        let op = op?;
        let orig = op.id();
        let index = repo.index()?;
        if index.has_conflicts() {
            return Err(MetaError::Conflicts {
                message: format!(
                    "conflict replaying {orig}:\n  {}",
                    util::conflicted_paths(&index)?.join("\n  ")
                ),
            });
        }
        match rebase.commit(None, &committer, None) {
            Ok(oid) => last = Some(oid),
            Err(e) if e.code() == git2::ErrorCode::Applied => {}
            Err(e) => return Err(e.into()),
        }
    }
    rebase.finish(None)?;
    match last {
        Some(oid) => Ok(oid),
        None => util::head_oid(repo)?
            .ok_or_else(|| MetaError::Internal("sub has no HEAD after rebase".to_string())),
    }
}

pub(crate) fn abort_sub_rebase(repo: &Repository) -> Result<()> {
    let mut rebase = repo.open_rebase(None)?;
    rebase.abort()?;
    Ok(())
}

/// Non-merge commits reachable from `from` but not `onto`, parents always
/// before children. Merge commits are traversed but not emitted.
pub fn list_rebase_commits(repo: &Repository, from: Oid, onto: Oid) -> Result<Vec<Oid>> {
    let mut walk = repo.revwalk()?;
    walk.push(from)?;
    walk.hide(onto)?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid?;
        if repo.find_commit(oid)?.parent_count() <= 1 {
            commits.push(oid);
        }
    }
    Ok(commits)
}

#[derive(Debug, Default)]
pub struct RebaseOutcome {
    pub head: Option<Oid>,
    pub info: Vec<String>,
    /// New meta commit → the original it replays.
    pub commit_map: BTreeMap<Oid, Oid>,
}

fn reject_in_progress(repo: &Repository) -> Result<()> {
    match SequencerState::load_any(repo)? {
        None => Ok(()),
        Some(seq) => Err(match seq.kind {
            SequencerKind::Merge => MetaError::MergeInProgress,
            SequencerKind::CherryPick => MetaError::CherryPickInProgress,
            SequencerKind::Rebase => MetaError::RebaseInProgress,
        }),
    }
}

pub fn rebase(repo: &Repository, onto_spec: &str, concurrency: usize) -> Result<RebaseOutcome> {
    reject_in_progress(repo)?;
    if !status::is_deep_clean(repo, false)? {
        return Err(MetaError::NotDeepClean(status::describe_dirt(repo)?));
    }
    let onto = util::resolve_commit(repo, onto_spec)?;
    let head = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("meta repository has no HEAD commit".to_string()))?;

    if head == onto || util::descendant_of(repo, head, onto)? {
        return Ok(RebaseOutcome {
            head: None,
            info: vec!["Already up to date.".to_string()],
            commit_map: BTreeMap::new(),
        });
    }
    let concurrency = if concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    };
    if util::descendant_of(repo, onto, head)? {
        // Pure fast-forward: move the meta and drag open subs along.
        util::move_head_to(repo, onto)?;
        checkout::align_open_subs(repo, onto, concurrency)?;
        finish_index(repo)?;
        return Ok(RebaseOutcome {
            head: Some(onto),
            info: vec![format!("Fast-forwarded to {onto}.")],
            commit_map: BTreeMap::new(),
        });
    }

    let commits = list_rebase_commits(repo, head, onto)?;
    // Direct file changes cannot be replayed; refuse before touching
    // anything.
    for commit in &commits {
        let computed = changes::compute_changes(repo, *commit, false)?;
        if !computed.non_sub_paths.is_empty() {
            return Err(MetaError::NonSubChangeUnsupported {
                paths: computed.non_sub_paths,
            });
        }
    }
    let mut seq = SequencerState {
        kind: SequencerKind::Rebase,
        original_head: RefTarget::new(head, util::head_branch(repo)?),
        target: RefTarget::new(onto, Some(onto_spec.to_string())),
        current_commit: 0,
        commits: commits.clone(),
        message: String::new(),
    };
    seq.write(repo)?;

    repo.set_head_detached(onto)?;
    drive(repo, &mut seq, 0)
}

fn drive(repo: &Repository, seq: &mut SequencerState, start: usize) -> Result<RebaseOutcome> {
    let opener = Opener::new(repo, Some(seq.original_head.sha));
    let mut commit_map = BTreeMap::new();
    for i in start..seq.commits.len() {
        seq.current_commit = i as u32;
        seq.write(repo)?;
        let orig = seq.commits[i];
        match replay_one(repo, &opener, orig)? {
            ReplayResult::Committed(new_oid) => {
                commit_map.insert(new_oid, orig);
                repo.set_head_detached(new_oid)?;
            }
            ReplayResult::Skipped => {}
            ReplayResult::Conflicted { report } => {
                let mut lines = report;
                lines.push(
                    "fix conflicts and run 'rebase --continue', or 'rebase --abort'".to_string(),
                );
                return Err(MetaError::Conflicts {
                    message: lines.join("\n"),
                });
            }
        }
    }
    finish_rebase(repo, seq, commit_map)
}

enum ReplayResult {
    Committed(Oid),
    Skipped,
    Conflicted { report: Vec<String> },
}

fn replay_one(repo: &Repository, opener: &Opener, orig: Oid) -> Result<ReplayResult> {
    let commit = repo.find_commit(orig)?;
    let our_oid = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("rebase lost HEAD".to_string()))?;
    let our_commit = repo.find_commit(our_oid)?;
    let our_tree = our_commit.tree()?;
    let their_tree = commit.tree()?;
    let base_tree = if commit.parent_count() > 0 {
        commit.parent(0)?.tree()?
    } else {
        let oid = repo.treebuilder(None)?.write()?;
        repo.find_tree(oid)?
    };

    let mut merged = repo.merge_trees(&base_tree, &our_tree, &their_tree, None)?;

    struct PendingConflict {
        path: String,
        ancestor: Option<(u32, Oid)>,
        ours: Option<(u32, Oid)>,
        theirs: Option<(u32, Oid)>,
    }
    let mut pending: Vec<PendingConflict> = Vec::new();
    for conflict in merged.conflicts()? {
        let conflict = conflict?;
        let path = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|e| String::from_utf8_lossy(&e.path).to_string())
            .unwrap_or_default();
        pending.push(PendingConflict {
            path,
            ancestor: conflict.ancestor.as_ref().map(|e| (e.mode, e.id)),
            ours: conflict.our.as_ref().map(|e| (e.mode, e.id)),
            theirs: conflict.their.as_ref().map(|e| (e.mode, e.id)),
        });
    }

    let mut report: Vec<String> = Vec::new();
    let mut unresolved: Vec<String> = Vec::new();
    for c in &pending {
        if c.path == GITMODULES {
            if !merge_modules_file(repo, &mut merged, &commit, our_oid)? {
                report.push(format!("Conflict in '{GITMODULES}'"));
                unresolved.push(c.path.clone());
            }
            continue;
        }
        let our_link = c.ours.filter(|(mode, _)| *mode == GITLINK_MODE);
        let their_link = c.theirs.filter(|(mode, _)| *mode == GITLINK_MODE);
        match (our_link, their_link) {
            (Some((_, our_sha)), Some((_, their_sha))) => {
                let upstream = c
                    .ancestor
                    .filter(|(mode, _)| *mode == GITLINK_MODE)
                    .map(|(_, sha)| sha)
                    .unwrap_or(our_sha);
                match rebase_submodule(opener, &c.path, upstream, their_sha, our_sha)? {
                    Some(new_head) => {
                        let _ = merged.remove_path(std::path::Path::new(&c.path));
                        util::stage_gitlink(&mut merged, &c.path, new_head)?;
                    }
                    None => {
                        report.push(format!("Conflict rebasing submodule '{}'", c.path));
                        unresolved.push(c.path.clone());
                    }
                }
            }
            _ => {
                report.push(format!("Conflict in '{}'", c.path));
                unresolved.push(c.path.clone());
            }
        }
    }

    if !report.is_empty() {
        // Park the half-merged state in the real index so --continue can
        // pick it up after the user resolves.
        let mut real = repo.index()?;
        real.clear()?;
        for entry in merged.iter() {
            real.add(&entry)?;
        }
        for c in &pending {
            if unresolved.contains(&c.path) {
                util::stage_conflict(&mut real, &c.path, c.ancestor, c.ours, c.theirs)?;
            }
        }
        real.write()?;
        // Materialize the merged tree and conflict markers so the user has
        // something to resolve in.
        let mut co = git2::build::CheckoutBuilder::new();
        co.force().allow_conflicts(true).conflict_style_merge(true);
        repo.checkout_index(Some(&mut real), Some(&mut co))?;
        return Ok(ReplayResult::Conflicted { report });
    }

    let tree_oid = merged.write_tree_to(repo)?;
    if tree_oid == our_tree.id() {
        tracing::debug!(%orig, "replayed commit is empty; skipping");
        return Ok(ReplayResult::Skipped);
    }
    let tree = repo.find_tree(tree_oid)?;
    let committer = ident::committer(repo)?;
    let new_oid = repo.commit(
        None,
        &commit.author(),
        &committer,
        commit.message().unwrap_or(""),
        &tree,
        &[&our_commit],
    )?;
    Ok(ReplayResult::Committed(new_oid))
}

/// Rebase one sub's range `(upstream..their]` onto `our`. Returns the new
/// sub head, or `None` when the replay conflicted (leaving the sub open and
/// mid-rebase on disk).
fn rebase_submodule(
    opener: &Opener,
    name: &str,
    upstream: Oid,
    their: Oid,
    our: Oid,
) -> Result<Option<Oid>> {
    let sub = opener.get_subrepo(name, OpenMode::AllowBare)?;
    let fetcher = opener.fetcher()?;
    fetcher.fetch_sha(&sub.path, name, their)?;
    fetcher.fetch_sha(&sub.path, name, our)?;
    let sub_repo = sub.open()?;

    if util::descendant_of(&sub_repo, our, their)? {
        return Ok(Some(our));
    }
    if util::descendant_of(&sub_repo, their, our)? {
        if !sub.bare {
            util::set_sub_head(&sub_repo, their)?;
        }
        return Ok(Some(their));
    }

    let replay = replay_sub_range(&sub_repo, upstream, their, our, true)?;
    if replay.conflicted.is_none() {
        let new_head = replay.new_head.unwrap_or(our);
        if !sub.bare {
            util::set_sub_head(&sub_repo, new_head)?;
        } else {
            sub_repo.set_head_detached(new_head)?;
        }
        util::write_synthetic_ref(&sub_repo, new_head)?;
        return Ok(Some(new_head));
    }

    // Materialize the conflict in a working tree and leave the rebase
    // parked for --continue.
    opener.clear_absorbed_cache(name);
    let sub = opener.get_subrepo(name, OpenMode::ForceOpen)?;
    let sub_repo = sub.open()?;
    util::set_sub_head(&sub_repo, our)?;
    let _ = replay_sub_range(&sub_repo, upstream, their, our, false)?;
    Ok(None)
}

/// Three-way merge of a conflicted `.gitmodules`; true when resolvable.
fn merge_modules_file(
    repo: &Repository,
    merged: &mut git2::Index,
    their_commit: &git2::Commit<'_>,
    our_oid: Oid,
) -> Result<bool> {
    let base = if their_commit.parent_count() > 0 {
        Some(their_commit.parent_id(0)?)
    } else {
        None
    };
    let base_urls = match base {
        Some(oid) => config::urls_at(repo, Some(oid))?,
        None => BTreeMap::new(),
    };
    let our_urls = config::urls_at(repo, Some(our_oid))?;
    let their_urls = config::urls_at(repo, Some(their_commit.id()))?;
    match changes::merge_url_maps(&base_urls, &our_urls, &their_urls) {
        Some(urls) => {
            let _ = merged.remove_path(std::path::Path::new(GITMODULES));
            if !urls.is_empty() {
                config::write_urls(repo, merged, &urls, true)?;
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

fn finish_rebase(
    repo: &Repository,
    seq: &SequencerState,
    commit_map: BTreeMap<Oid, Oid>,
) -> Result<RebaseOutcome> {
    let final_head = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("rebase lost HEAD".to_string()))?;
    match &seq.original_head.ref_name {
        Some(refname) => {
            repo.reference(refname, final_head, true, "convoy: rebase finished")?;
            repo.set_head(refname)?;
        }
        None => repo.set_head_detached(final_head)?,
    }
    let object = repo.find_object(final_head, Some(git2::ObjectType::Commit))?;
    let mut co = git2::build::CheckoutBuilder::new();
    co.force();
    repo.checkout_tree(&object, Some(&mut co))?;
    checkout::align_open_subs(repo, final_head, DEFAULT_CONCURRENCY)?;
    finish_index(repo)?;
    SequencerState::clean(repo, SequencerKind::Rebase)?;
    Ok(RebaseOutcome {
        head: Some(final_head),
        info: vec![format!("Rebased onto {final_head}.")],
        commit_map,
    })
}

fn finish_index(repo: &Repository) -> Result<()> {
    let mut index = repo.index()?;
    if sparse::in_sparse_mode(repo)? {
        sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
    } else {
        index.write()?;
    }
    Ok(())
}

pub fn rebase_continue(repo: &Repository) -> Result<RebaseOutcome> {
    let mut seq = SequencerState::load(repo, SequencerKind::Rebase)?
        .ok_or(MetaError::NoRebaseInProgress)?;
    let opener = Opener::new(repo, Some(seq.original_head.sha));
    let open = opener::list_open_subs(repo)?;
    let mut index = repo.index()?;

    // Finish every parked sub rebase first; each resolved sub re-stages its
    // new tip over the recorded conflict.
    for name in &open {
        let sub = opener.get_subrepo(name, OpenMode::ForceOpen)?;
        let sub_repo = sub.open()?;
        if sub_rebase_in_progress(&sub_repo) {
            let new_head = continue_sub_rebase(&sub_repo)?;
            util::set_sub_head(&sub_repo, new_head)?;
            util::write_synthetic_ref(&sub_repo, new_head)?;
            let _ = index.remove_path(std::path::Path::new(name));
            util::stage_gitlink(&mut index, name, new_head)?;
        }
    }

    if index.has_conflicts() {
        return Err(MetaError::UnresolvedConflicts {
            paths: util::conflicted_paths(&index)?,
        });
    }
    index.write()?;

    // Commit the op that conflicted, then drive the rest of the range.
    let i = seq.current_commit as usize;
    let orig = *seq.commits.get(i).ok_or(MetaError::NoRebaseInProgress)?;
    let commit = repo.find_commit(orig)?;
    let our_commit = repo.head()?.peel_to_commit()?;
    let tree_oid = index.write_tree()?;
    let mut commit_map = BTreeMap::new();
    if tree_oid != our_commit.tree_id() {
        let tree = repo.find_tree(tree_oid)?;
        let committer = ident::committer(repo)?;
        let new_oid = repo.commit(
            None,
            &commit.author(),
            &committer,
            commit.message().unwrap_or(""),
            &tree,
            &[&our_commit],
        )?;
        commit_map.insert(new_oid, orig);
        repo.set_head_detached(new_oid)?;
    }

    let outcome = drive(repo, &mut seq, i + 1)?;
    let mut merged_map = commit_map;
    merged_map.extend(outcome.commit_map);
    Ok(RebaseOutcome {
        head: outcome.head,
        info: outcome.info,
        commit_map: merged_map,
    })
}

pub fn rebase_abort(repo: &Repository) -> Result<()> {
    let seq = SequencerState::load(repo, SequencerKind::Rebase)?
        .ok_or(MetaError::NoRebaseInProgress)?;
    let open = opener::list_open_subs(repo)?;
    let workdir = repo.workdir().unwrap_or_else(|| repo.path()).to_path_buf();
    for name in &open {
        let sub_repo = Repository::open(workdir.join(name))?;
        if sub_rebase_in_progress(&sub_repo) {
            abort_sub_rebase(&sub_repo)?;
        }
    }
    match &seq.original_head.ref_name {
        Some(refname) => {
            repo.set_head(refname)?;
        }
        None => repo.set_head_detached(seq.original_head.sha)?,
    }
    let object = repo.find_object(seq.original_head.sha, Some(git2::ObjectType::Commit))?;
    let mut co = git2::build::CheckoutBuilder::new();
    co.force();
    repo.checkout_tree(&object, Some(&mut co))?;
    checkout::align_open_subs(repo, seq.original_head.sha, DEFAULT_CONCURRENCY)?;
    finish_index(repo)?;
    SequencerState::clean(repo, SequencerKind::Rebase)?;
    Ok(())
}
