//! Three-way merge across the meta repo and its subs.
//!
//! The meta-level merge is delegated to libgit2 (on disk for normal merges,
//! in memory for `--bare`), then every gitlink the classifier marked as
//! needs-pick is resolved by a per-sub merge in a bounded fan-out. A sub
//! whose merge conflicts leaves its working tree in the conflicted state and
//! a per-sub sequencer record, and the meta sequencer makes the whole thing
//! resumable with `--continue` / `--abort`.

use std::collections::BTreeMap;

use git2::{Oid, Repository};

use crate::{
    changes, checkout,
    cli::GitCli,
    config,
    error::{MetaError, Result},
    ident,
    opener::{OpenMode, Opener, SubRepo},
    sequencer::{RefTarget, SequencerKind, SequencerState},
    sparse, status, util,
    work_queue::{self, DEFAULT_CONCURRENCY},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Normal,
    FfOnly,
    ForceCommit,
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub mode: MergeMode,
    /// Merge entirely in the object database: no working trees are touched
    /// and conflicts fail the merge instead of leaving resumable state.
    pub force_bare: bool,
    pub message: Option<String>,
    pub concurrency: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            mode: MergeMode::Normal,
            force_bare: false,
            message: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// The created (or fast-forwarded-to) commit; `None` when there was
    /// nothing to do.
    pub commit: Option<Oid>,
    pub info: Vec<String>,
}

struct SubMergeOutcome {
    name: String,
    merged_sha: Option<Oid>,
    conflict_sha: Option<Oid>,
    conflict_paths: Vec<String>,
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

/// Merge `theirs_spec` into HEAD.
pub fn merge(repo: &Repository, theirs_spec: &str, opts: &MergeOptions) -> Result<MergeOutcome> {
    reject_in_progress(repo)?;
    let theirs = util::resolve_commit(repo, theirs_spec)?;
    let ours = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("meta repository has no HEAD commit".to_string()))?;

    repo.merge_base(ours, theirs)
        .map_err(|_| MetaError::NoCommonAncestor(ours.to_string(), theirs.to_string()))?;
    if !opts.force_bare && !status::is_deep_clean(repo, false)? {
        return Err(MetaError::NotDeepClean(status::describe_dirt(repo)?));
    }

    if ours == theirs || util::descendant_of(repo, ours, theirs)? {
        return Ok(MergeOutcome {
            commit: None,
            info: vec!["Already up to date.".to_string()],
        });
    }

    let is_ff = util::descendant_of(repo, theirs, ours)?;
    if !is_ff && opts.mode == MergeMode::FfOnly {
        return Err(MetaError::CannotFastForward);
    }
    if is_ff && opts.mode != MergeMode::ForceCommit {
        return fast_forward(repo, theirs, opts);
    }

    let message = opts
        .message
        .clone()
        .unwrap_or_else(|| format!("Merge {theirs_spec} into HEAD\n"));

    if opts.force_bare {
        merge_bare(repo, ours, theirs, &message, opts)
    } else {
        merge_on_disk(repo, ours, theirs, theirs_spec, &message, opts)
    }
}

fn fast_forward(repo: &Repository, theirs: Oid, opts: &MergeOptions) -> Result<MergeOutcome> {
    if opts.force_bare {
        match util::head_branch(repo)? {
            Some(refname) => {
                repo.reference(&refname, theirs, true, "convoy: fast-forward merge")?;
            }
            None => repo.set_head_detached(theirs)?,
        }
    } else {
        util::move_head_to(repo, theirs)?;
        checkout::align_open_subs(repo, theirs, opts.concurrency)?;
        let mut index = repo.index()?;
        if sparse::in_sparse_mode(repo)? {
            sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
        } else {
            index.write()?;
        }
    }
    Ok(MergeOutcome {
        commit: Some(theirs),
        info: vec![format!("Fast-forwarded to {theirs}.")],
    })
}

/// Per-sub three-way merge. The caller has classified this sub as moved on
/// both sides; here we fetch both tips and either fast-forward, create a
/// two-parent sub commit, or surface a conflict.
fn merge_submodule(
    opener: &Opener,
    name: &str,
    our_sha: Oid,
    their_sha: Oid,
    message: &str,
    force_bare: bool,
) -> Result<SubMergeOutcome> {
    let mode = if force_bare {
        OpenMode::ForceBare
    } else {
        OpenMode::AllowBare
    };
    let sub = opener.get_subrepo(name, mode)?;
    let fetcher = opener.fetcher()?;
    fetcher.fetch_sha(&sub.path, name, our_sha)?;
    fetcher.fetch_sha(&sub.path, name, their_sha)?;
    let sub_repo = sub.open()?;

    if util::descendant_of(&sub_repo, our_sha, their_sha)? {
        return Ok(SubMergeOutcome {
            name: name.to_string(),
            merged_sha: Some(our_sha),
            conflict_sha: None,
            conflict_paths: Vec::new(),
        });
    }
    if util::descendant_of(&sub_repo, their_sha, our_sha)? {
        if !sub.bare {
            util::set_sub_head(&sub_repo, their_sha)?;
        }
        return Ok(SubMergeOutcome {
            name: name.to_string(),
            merged_sha: Some(their_sha),
            conflict_sha: None,
            conflict_paths: Vec::new(),
        });
    }

    let our_commit = sub_repo.find_commit(our_sha)?;
    let their_commit = sub_repo.find_commit(their_sha)?;
    let mut merged = sub_repo.merge_commits(&our_commit, &their_commit, None)?;
    if !merged.has_conflicts() {
        let tree_oid = merged.write_tree_to(&sub_repo)?;
        let tree = sub_repo.find_tree(tree_oid)?;
        let author = ident::author(&sub_repo)?;
        let committer = ident::committer(&sub_repo)?;
        let commit = sub_repo.commit(
            None,
            &author,
            &committer,
            message,
            &tree,
            &[&our_commit, &their_commit],
        )?;
        if !sub.bare {
            util::set_sub_head(&sub_repo, commit)?;
        }
        util::write_synthetic_ref(&sub_repo, commit)?;
        return Ok(SubMergeOutcome {
            name: name.to_string(),
            merged_sha: Some(commit),
            conflict_sha: None,
            conflict_paths: Vec::new(),
        });
    }

    if force_bare {
        return Ok(SubMergeOutcome {
            name: name.to_string(),
            merged_sha: None,
            conflict_sha: Some(their_sha),
            conflict_paths: util::conflicted_paths(&merged)?,
        });
    }

    // Conflict needs a working tree to resolve in; promote a half-open sub
    // to fully open first.
    let sub = if sub.bare {
        opener.clear_absorbed_cache(name);
        opener.get_subrepo(name, OpenMode::ForceOpen)?
    } else {
        sub
    };
    let sub_repo = sub.open()?;
    util::set_sub_head(&sub_repo, our_sha)?;
    let annotated = sub_repo.find_annotated_commit(their_sha)?;
    let mut co = git2::build::CheckoutBuilder::new();
    co.allow_conflicts(true).conflict_style_merge(true);
    sub_repo.merge(&[&annotated], None, Some(&mut co))?;

    SequencerState {
        kind: SequencerKind::Merge,
        original_head: RefTarget::new(our_sha, None),
        target: RefTarget::new(their_sha, None),
        current_commit: 0,
        commits: vec![their_sha],
        message: message.to_string(),
    }
    .write(&sub_repo)?;

    Ok(SubMergeOutcome {
        name: name.to_string(),
        merged_sha: None,
        conflict_sha: Some(their_sha),
        conflict_paths: util::conflicted_paths(&sub_repo.index()?)?,
    })
}

fn merge_on_disk(
    repo: &Repository,
    ours: Oid,
    theirs: Oid,
    theirs_spec: &str,
    message: &str,
    opts: &MergeOptions,
) -> Result<MergeOutcome> {
    let computed = changes::compute_changes(repo, theirs, true)?;
    let opener = Opener::new(repo, None);

    // Let libgit2 drive the meta-level merge: plain files get real content
    // merges and the index picks up every trivially-resolved gitlink.
    let annotated = repo.find_annotated_commit(theirs)?;
    let mut co = git2::build::CheckoutBuilder::new();
    co.allow_conflicts(true).conflict_style_merge(true);
    repo.merge(&[&annotated], None, Some(&mut co))?;
    let mut index = repo.index()?;

    opener.change_submodules(&mut index, &computed.simple, false)?;
    resolve_gitmodules(repo, &mut index, ours, theirs, false)?;

    let mut report: Vec<String> = Vec::new();
    for (name, conflict) in &computed.conflicts {
        util::stage_conflict(
            &mut index,
            name,
            conflict.ancestor.map(|e| (e.mode, e.sha)),
            conflict.ours.map(|e| (e.mode, e.sha)),
            conflict.theirs.map(|e| (e.mode, e.sha)),
        )?;
        report.push(format!("Merge conflict in submodule '{name}' itself"));
    }

    let picks: Vec<(String, Oid, Oid)> = computed
        .changes
        .iter()
        .map(|(name, c)| {
            (
                name.clone(),
                c.our_sha.expect("needs-pick has our sha"),
                c.new_sha.expect("needs-pick has new sha"),
            )
        })
        .collect();
    let outcomes = work_queue::run_all(picks, opts.concurrency, |_, (name, our, their)| {
        merge_submodule(&opener, &name, our, their, message, false)
    });
    for outcome in outcomes {
        let outcome = outcome?;
        match outcome.merged_sha {
            Some(sha) => {
                let _ = index.remove_path(std::path::Path::new(&outcome.name));
                util::stage_gitlink(&mut index, &outcome.name, sha)?;
            }
            None => {
                let change = &computed.changes[&outcome.name];
                util::stage_conflict(
                    &mut index,
                    &outcome.name,
                    change.old_sha.map(|s| (config::GITLINK_MODE, s)),
                    change.our_sha.map(|s| (config::GITLINK_MODE, s)),
                    change.new_sha.map(|s| (config::GITLINK_MODE, s)),
                )?;
                report.push(format!(
                    "Merge conflict in submodule '{}':\n  {}",
                    outcome.name,
                    outcome.conflict_paths.join("\n  ")
                ));
            }
        }
    }

    // Anything libgit2 left conflicted that we have not already resolved or
    // reported is a plain meta-file conflict.
    let still_conflicted = util::conflicted_paths(&index)?;
    for path in &still_conflicted {
        if !computed.conflicts.contains_key(path)
            && !computed.changes.contains_key(path)
            && path != config::GITMODULES
        {
            report.push(format!("Merge conflict in '{path}'"));
        }
    }

    if report.is_empty() {
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;
        let author = ident::author(repo)?;
        let committer = ident::committer(repo)?;
        let our_commit = repo.find_commit(ours)?;
        let their_commit = repo.find_commit(theirs)?;
        let commit = repo.commit(
            Some("HEAD"),
            &author,
            &committer,
            message,
            &tree,
            &[&our_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        if sparse::in_sparse_mode(repo)? {
            sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
        } else {
            index.write()?;
        }
        Ok(MergeOutcome {
            commit: Some(commit),
            info: vec![format!("Merged {theirs_spec}.")],
        })
    } else {
        index.write()?;
        SequencerState {
            kind: SequencerKind::Merge,
            original_head: RefTarget::new(ours, util::head_branch(repo)?),
            target: RefTarget::new(theirs, Some(theirs_spec.to_string())),
            current_commit: 0,
            commits: vec![theirs],
            message: message.to_string(),
        }
        .write(repo)?;
        report.push("fix conflicts and run 'merge --continue', or 'merge --abort'".to_string());
        Err(MetaError::Conflicts {
            message: report.join("\n"),
        })
    }
}

fn merge_bare(
    repo: &Repository,
    ours: Oid,
    theirs: Oid,
    message: &str,
    opts: &MergeOptions,
) -> Result<MergeOutcome> {
    let computed = changes::compute_changes(repo, theirs, true)?;
    if !computed.conflicts.is_empty() {
        let lines: Vec<String> = computed
            .conflicts
            .keys()
            .map(|name| format!("Merge conflict in submodule '{name}' itself"))
            .collect();
        return Err(MetaError::Conflicts {
            message: lines.join("\n"),
        });
    }

    let opener = Opener::new(repo, None);
    let our_commit = repo.find_commit(ours)?;
    let their_commit = repo.find_commit(theirs)?;
    let mut index = repo.merge_commits(&our_commit, &their_commit, None)?;

    opener.change_submodules(&mut index, &computed.simple, true)?;
    resolve_gitmodules(repo, &mut index, ours, theirs, true)?;

    let picks: Vec<(String, Oid, Oid)> = computed
        .changes
        .iter()
        .map(|(name, c)| {
            (
                name.clone(),
                c.our_sha.expect("needs-pick has our sha"),
                c.new_sha.expect("needs-pick has new sha"),
            )
        })
        .collect();
    let outcomes = work_queue::run_all(picks, opts.concurrency, |_, (name, our, their)| {
        merge_submodule(&opener, &name, our, their, message, true)
    });
    let mut report = Vec::new();
    for outcome in outcomes {
        let outcome = outcome?;
        match outcome.merged_sha {
            Some(sha) => {
                let _ = index.remove_path(std::path::Path::new(&outcome.name));
                util::stage_gitlink(&mut index, &outcome.name, sha)?;
            }
            None => report.push(format!(
                "Merge conflict in submodule '{}' itself",
                outcome.name
            )),
        }
    }
    if !report.is_empty() {
        return Err(MetaError::Conflicts {
            message: report.join("\n"),
        });
    }
    if index.has_conflicts() {
        let paths = util::conflicted_paths(&index)?;
        return Err(MetaError::Conflicts {
            message: paths
                .iter()
                .map(|p| format!("Merge conflict in '{p}'"))
                .collect::<Vec<_>>()
                .join("\n"),
        });
    }

    let tree_oid = index.write_tree_to(repo)?;
    let tree = repo.find_tree(tree_oid)?;
    let author = ident::author(repo)?;
    let committer = ident::committer(repo)?;
    let commit = repo.commit(
        None,
        &author,
        &committer,
        message,
        &tree,
        &[&our_commit, &their_commit],
    )?;
    match util::head_branch(repo)? {
        Some(refname) => {
            repo.reference(&refname, commit, true, "convoy: bare merge")?;
        }
        None => repo.set_head_detached(commit)?,
    }
    Ok(MergeOutcome {
        commit: Some(commit),
        info: vec![format!("Merged (bare) into {commit}.")],
    })
}

/// Reconcile `.gitmodules` after the structural merge: a clean three-way
/// union of the url maps replaces whatever textual result (or conflict)
/// libgit2 produced.
fn resolve_gitmodules(
    repo: &Repository,
    index: &mut git2::Index,
    ours: Oid,
    theirs: Oid,
    cached: bool,
) -> Result<()> {
    let base = repo
        .merge_base(ours, theirs)
        .map_err(|_| MetaError::NoCommonAncestor(ours.to_string(), theirs.to_string()))?;
    let base_urls = config::urls_at(repo, Some(base))?;
    let our_urls = config::urls_at(repo, Some(ours))?;
    let their_urls = config::urls_at(repo, Some(theirs))?;
    match changes::merge_url_maps(&base_urls, &our_urls, &their_urls) {
        Some(merged) => {
            let _ = index.remove_path(std::path::Path::new(config::GITMODULES));
            config::write_urls(repo, index, &merged, cached)?;
            Ok(())
        }
        None => Err(MetaError::Conflicts {
            message: format!("Merge conflict in '{}'", config::GITMODULES),
        }),
    }
}

/// Finish a conflicted merge after the user resolved every sub.
pub fn merge_continue(repo: &Repository) -> Result<MergeOutcome> {
    let seq = SequencerState::load(repo, SequencerKind::Merge)?
        .ok_or(MetaError::NoMergeInProgress)?;
    let opener = Opener::new(repo, None);
    let open = crate::opener::list_open_subs(repo)?;
    let mut index = repo.index()?;

    for name in &open {
        let sub = opener.get_subrepo(name, OpenMode::ForceOpen)?;
        let sub_repo = sub.open()?;
        let sub_seq = SequencerState::load(&sub_repo, SequencerKind::Merge)?;
        let sub_index = sub_repo.index()?;
        if sub_index.has_conflicts() {
            return Err(MetaError::UnresolvedConflicts {
                paths: util::conflicted_paths(&sub_index)?
                    .into_iter()
                    .map(|p| format!("{name}/{p}"))
                    .collect(),
            });
        }
        match sub_seq {
            Some(sub_seq) => {
                let commit = commit_sub_merge(&sub_repo, &sub_seq)?;
                SequencerState::clean(&sub_repo, SequencerKind::Merge)?;
                sub_repo.cleanup_state()?;
                util::set_sub_head(&sub_repo, commit)?;
                util::write_synthetic_ref(&sub_repo, commit)?;
                let _ = index.remove_path(std::path::Path::new(name));
                util::stage_gitlink(&mut index, name, commit)?;
            }
            None => {
                if let Some(commit) = commit_sub_staged(&sub_repo, &seq.message)? {
                    util::write_synthetic_ref(&sub_repo, commit)?;
                    let _ = index.remove_path(std::path::Path::new(name));
                    util::stage_gitlink(&mut index, name, commit)?;
                }
            }
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
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;
    let author = ident::author(repo)?;
    let committer = ident::committer(repo)?;
    let head = repo.head()?.peel_to_commit()?;
    let their_commit = repo.find_commit(seq.target.sha)?;
    let commit = repo.commit(
        Some("HEAD"),
        &author,
        &committer,
        &seq.message,
        &tree,
        &[&head, &their_commit],
    )?;
    repo.cleanup_state()?;
    SequencerState::clean(repo, SequencerKind::Merge)?;
    Ok(MergeOutcome {
        commit: Some(commit),
        info: vec![format!("Merge completed: {commit}.")],
    })
}

/// Commit a resolved sub merge with `[sub HEAD, merge target]` parents.
fn commit_sub_merge(sub_repo: &Repository, sub_seq: &SequencerState) -> Result<Oid> {
    let mut sub_index = sub_repo.index()?;
    let tree_oid = sub_index.write_tree()?;
    let tree = sub_repo.find_tree(tree_oid)?;
    let head = sub_repo.head()?.peel_to_commit()?;
    let merge_head = sub_repo.find_commit(sub_seq.target.sha)?;
    let author = ident::author(sub_repo)?;
    let committer = ident::committer(sub_repo)?;
    Ok(sub_repo.commit(
        None,
        &author,
        &committer,
        &sub_seq.message,
        &tree,
        &[&head, &merge_head],
    )?)
}

/// Commit staged (non-merge) changes in a sub; `None` if the index matches
/// HEAD.
fn commit_sub_staged(sub_repo: &Repository, message: &str) -> Result<Option<Oid>> {
    let mut sub_index = sub_repo.index()?;
    let tree_oid = sub_index.write_tree()?;
    let head = sub_repo.head()?.peel_to_commit()?;
    if head.tree_id() == tree_oid {
        return Ok(None);
    }
    let tree = sub_repo.find_tree(tree_oid)?;
    let author = ident::author(sub_repo)?;
    let committer = ident::committer(sub_repo)?;
    let commit = sub_repo.commit(None, &author, &committer, message, &tree, &[&head])?;
    util::set_sub_head(sub_repo, commit)?;
    Ok(Some(commit))
}

/// Abort a conflicted merge, restoring every open sub and the meta repo.
pub fn merge_abort(repo: &Repository) -> Result<()> {
    let _seq = SequencerState::load(repo, SequencerKind::Merge)?
        .ok_or(MetaError::NoMergeInProgress)?;
    let cli = GitCli::new();
    let opener = Opener::new(repo, None);
    let open = crate::opener::list_open_subs(repo)?;

    for name in &open {
        let sub: SubRepo = opener.get_subrepo(name, OpenMode::ForceOpen)?;
        let sub_repo = sub.open()?;
        let sub_seq = SequencerState::load(&sub_repo, SequencerKind::Merge)?;
        cli.reset_merge(&sub.path)?;
        if let Some(sub_seq) = sub_seq {
            let head = util::head_oid(&sub_repo)?;
            if head != Some(sub_seq.original_head.sha) {
                sub_repo.set_head_detached(sub_seq.original_head.sha)?;
                cli.reset_merge(&sub.path)?;
            }
            SequencerState::clean(&sub_repo, SequencerKind::Merge)?;
        }
        sub_repo.cleanup_state()?;
    }

    repo.cleanup_state()?;
    cli.reset_merge(repo.workdir().unwrap_or_else(|| repo.path()))?;
    // Fast-forwarded subs moved on disk before the conflict surfaced; bring
    // every open sub back to what HEAD records.
    if let Some(head) = util::head_oid(repo)? {
        checkout::align_open_subs(repo, head, DEFAULT_CONCURRENCY)?;
    }
    SequencerState::clean(repo, SequencerKind::Merge)?;
    Ok(())
}
