//! Replay one meta commit's sub changes onto HEAD.
//!
//! Each sub the commit touched gets the range `(old..new]` replayed onto its
//! current HEAD as a nested rebase; the meta commit is then rebuilt with the
//! original author, committer, and message.

use std::collections::BTreeSet;

use git2::{Oid, Repository};

use crate::{
    changes, checkout,
    cli::GitCli,
    config, deinit,
    error::{MetaError, Result},
    opener::{self, OpenMode, Opener},
    rebase::{sub_rebase_in_progress, continue_sub_rebase, replay_sub_range, SubReplay},
    sequencer::{RefTarget, SequencerKind, SequencerState},
    sparse, status, util,
    work_queue::{self, DEFAULT_CONCURRENCY},
};

#[derive(Debug, Default)]
pub struct CherryPickOutcome {
    pub commit: Option<Oid>,
    pub info: Vec<String>,
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

pub fn cherry_pick(
    repo: &Repository,
    spec: &str,
    concurrency: usize,
) -> Result<CherryPickOutcome> {
    reject_in_progress(repo)?;
    if !status::is_deep_clean(repo, false)? {
        return Err(MetaError::NotDeepClean(status::describe_dirt(repo)?));
    }
    let commit = util::resolve_commit(repo, spec)?;
    if changes::contains_url_changes(repo, commit, None)? {
        return Err(MetaError::UrlChangesUnsupported);
    }
    let computed = changes::compute_changes(repo, commit, false)?;
    if !computed.non_sub_paths.is_empty() {
        return Err(MetaError::NonSubChangeUnsupported {
            paths: computed.non_sub_paths.clone(),
        });
    }

    let head = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("meta repository has no HEAD commit".to_string()))?;
    let commit_obj = repo.find_commit(commit)?;
    SequencerState {
        kind: SequencerKind::CherryPick,
        original_head: RefTarget::new(head, util::head_branch(repo)?),
        target: RefTarget::new(commit, None),
        current_commit: 0,
        commits: vec![commit],
        message: commit_obj.message().unwrap_or("").to_string(),
    }
    .write(repo)?;

    let opener = Opener::new(repo, None);
    let mut index = repo.index()?;
    let mut report: Vec<String> = Vec::new();

    // Simple changes: adds, removes, fast-forwards, plus their .gitmodules
    // edits.
    opener.change_submodules(&mut index, &computed.simple, false)?;
    let mut urls = config::urls_at(repo, Some(head))?;
    let commit_urls = config::urls_at(repo, Some(commit))?;
    for (name, change) in &computed.simple {
        match change.kind {
            changes::SimpleKind::Add => {
                if let Some(url) = commit_urls.get(name) {
                    urls.insert(name.clone(), url.clone());
                }
            }
            changes::SimpleKind::Remove => {
                urls.remove(name);
            }
            changes::SimpleKind::FastForward => {}
        }
    }
    config::write_urls(repo, &mut index, &urls, false)?;

    for (name, conflict) in &computed.conflicts {
        util::stage_conflict(
            &mut index,
            name,
            conflict.ancestor.map(|e| (e.mode, e.sha)),
            conflict.ours.map(|e| (e.mode, e.sha)),
            conflict.theirs.map(|e| (e.mode, e.sha)),
        )?;
        report.push(format!("Conflicting entries for submodule '{name}'"));
    }

    let concurrency = if concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    };
    let picks: Vec<(String, Oid, Oid, Oid)> = computed
        .changes
        .iter()
        .map(|(name, c)| {
            (
                name.clone(),
                c.old_sha.expect("pick has old sha"),
                c.new_sha.expect("pick has new sha"),
                c.our_sha.expect("pick has our sha"),
            )
        })
        .collect();
    let outcomes = work_queue::run_all(picks, concurrency, |_, (name, old, new, our)| {
        pick_submodule(&opener, &name, old, new, our)
    });

    let mut touched: BTreeSet<String> = computed.conflicts.keys().cloned().collect();
    for outcome in outcomes {
        let (name, replay) = outcome?;
        match replay.conflicted {
            None => {
                if let Some(new_head) = replay.new_head {
                    let _ = index.remove_path(std::path::Path::new(&name));
                    util::stage_gitlink(&mut index, &name, new_head)?;
                    touched.insert(name);
                }
            }
            Some(orig) => {
                report.push(format!(
                    "Conflict replaying {orig} in submodule '{name}'"
                ));
                touched.insert(name);
            }
        }
    }

    // Subs opened just for this pick that ended up untouched go back down.
    opener.close_unused_auto_opened(&touched)?;

    if report.is_empty() {
        if sparse::in_sparse_mode(repo)? {
            sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
        } else {
            index.write()?;
        }
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;
        let head_commit = repo.find_commit(head)?;
        let author = commit_obj.author();
        let committer = commit_obj.committer();
        let new_commit = repo.commit(
            Some("HEAD"),
            &author,
            &committer,
            commit_obj.message().unwrap_or(""),
            &tree,
            &[&head_commit],
        )?;
        SequencerState::clean(repo, SequencerKind::CherryPick)?;
        Ok(CherryPickOutcome {
            commit: Some(new_commit),
            info: vec![format!("Cherry-picked {spec} as {new_commit}.")],
        })
    } else {
        index.write()?;
        report.push(
            "fix conflicts and run 'cherry-pick --continue', or 'cherry-pick --abort'".to_string(),
        );
        Err(MetaError::Conflicts {
            message: report.join("\n"),
        })
    }
}

/// Replay `(old..new]` of one sub onto its current HEAD. A conflict turns a
/// half-open sub into a fully open one so the user has a tree to resolve in.
fn pick_submodule(
    opener: &Opener,
    name: &str,
    old: Oid,
    new: Oid,
    our: Oid,
) -> Result<(String, SubReplay)> {
    let sub = opener.get_subrepo(name, OpenMode::AllowBare)?;
    let fetcher = opener.fetcher()?;
    fetcher.fetch_sha(&sub.path, name, old)?;
    fetcher.fetch_sha(&sub.path, name, new)?;
    let sub_repo = sub.open()?;

    let replay = replay_sub_range(&sub_repo, old, new, our, /* in_memory */ true)?;
    if replay.conflicted.is_none() {
        if let Some(new_head) = replay.new_head {
            if !sub.bare {
                util::set_sub_head(&sub_repo, new_head)?;
            } else {
                sub_repo.set_head_detached(new_head)?;
            }
            util::write_synthetic_ref(&sub_repo, new_head)?;
        }
        return Ok((name.to_string(), replay));
    }

    // Conflict: redo on disk so the conflicted files land in a workdir.
    opener.clear_absorbed_cache(name);
    let sub = opener.get_subrepo(name, OpenMode::ForceOpen)?;
    let sub_repo = sub.open()?;
    util::set_sub_head(&sub_repo, our)?;
    let replay = replay_sub_range(&sub_repo, old, new, our, /* in_memory */ false)?;
    Ok((name.to_string(), replay))
}

pub fn cherry_pick_continue(repo: &Repository) -> Result<CherryPickOutcome> {
    let seq = SequencerState::load(repo, SequencerKind::CherryPick)?
        .ok_or(MetaError::NoCherryPickInProgress)?;
    let opener = Opener::new(repo, None);
    let open = opener::list_open_subs(repo)?;
    let mut index = repo.index()?;

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
    if sparse::in_sparse_mode(repo)? {
        sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
    } else {
        index.write()?;
    }

    let target = repo.find_commit(seq.target.sha)?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;
    let head = repo.head()?.peel_to_commit()?;
    let new_commit = repo.commit(
        Some("HEAD"),
        &target.author(),
        &target.committer(),
        &seq.message,
        &tree,
        &[&head],
    )?;
    SequencerState::clean(repo, SequencerKind::CherryPick)?;
    Ok(CherryPickOutcome {
        commit: Some(new_commit),
        info: vec![format!("Cherry-pick completed: {new_commit}.")],
    })
}

pub fn cherry_pick_abort(repo: &Repository) -> Result<()> {
    let seq = SequencerState::load(repo, SequencerKind::CherryPick)?
        .ok_or(MetaError::NoCherryPickInProgress)?;
    let cli = GitCli::new();
    let opener = Opener::new(repo, Some(seq.original_head.sha));
    let open = opener::list_open_subs(repo)?;
    let original_links =
        util::tree_gitlinks(&repo.find_commit(seq.original_head.sha)?.tree()?)?;

    for name in &open {
        let sub = opener.get_subrepo(name, OpenMode::ForceOpen)?;
        let sub_repo = sub.open()?;
        if sub_rebase_in_progress(&sub_repo) {
            crate::rebase::abort_sub_rebase(&sub_repo)?;
        }
        match original_links.get(name) {
            Some(sha) => util::set_sub_head(&sub_repo, *sha)?,
            None => {
                // The pick added and opened this sub; tear it back down.
                deinit::deinit_subs(repo, &[name.clone()])?;
            }
        }
    }

    cli.reset_hard(
        repo.workdir().unwrap_or_else(|| repo.path()),
        &seq.original_head.sha.to_string(),
    )?;
    repo.cleanup_state()?;
    checkout::align_open_subs(repo, seq.original_head.sha, DEFAULT_CONCURRENCY)?;
    let mut index = repo.index()?;
    if sparse::in_sparse_mode(repo)? {
        sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
    } else {
        index.write()?;
    }
    SequencerState::clean(repo, SequencerKind::CherryPick)?;
    Ok(())
}
