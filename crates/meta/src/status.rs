//! Status computation over the meta repo and its open subs.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use git2::{Oid, Repository};

use crate::{
    config::{self, GITMODULES},
    error::{MetaError, Result},
    opener::{self, SubRepo},
    sequencer::SequencerState,
    sparse, util,
};

/// How two commits in the same sub relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Same,
    Ahead,
    Behind,
    Unrelated,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Added,
    Modified,
    Deleted,
    TypeChange,
    Conflicted,
}

#[derive(Debug, Clone)]
pub struct CommitAndUrl {
    pub sha: Oid,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub sha: Oid,
    pub url: Option<String>,
    pub relation: Option<Relation>,
}

#[derive(Debug)]
pub struct WorkdirStatus {
    pub status: Box<RepoStatus>,
    pub relation: Option<Relation>,
}

#[derive(Debug, Default)]
pub struct SubmoduleStatus {
    pub commit: Option<CommitAndUrl>,
    pub index: Option<IndexStatus>,
    pub workdir: Option<WorkdirStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseState {
    pub onto: Option<Oid>,
}

#[derive(Debug, Default)]
pub struct RepoStatus {
    pub head_commit: Option<Oid>,
    pub current_branch: Option<String>,
    pub staged: BTreeMap<String, FileChange>,
    pub workdir: BTreeMap<String, FileChange>,
    pub submodules: BTreeMap<String, SubmoduleStatus>,
    pub rebase: Option<RebaseState>,
    pub sequencer: Option<SequencerState>,
    pub bare: bool,
    pub sparse: bool,
}

impl RepoStatus {
    /// Clean of staged and tracked-file changes; untracked files only count
    /// when `include_untracked`.
    pub fn is_clean(&self, include_untracked: bool) -> bool {
        let workdir_dirty = self
            .workdir
            .values()
            .any(|c| include_untracked || !matches!(c, FileChange::Added));
        self.staged.is_empty() && !workdir_dirty
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    /// List every untracked file instead of rolling directories up.
    pub show_all_untracked: bool,
    /// Restrict output to these paths (resolved against `cwd`).
    pub paths: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Include non-submodule changes to tracked meta files.
    pub show_meta_changes: bool,
    /// Compare the working tree to HEAD instead of to the index.
    pub ignore_index: bool,
}

/// Compare two commits inside a sub: `Same`, or whether `a` is ahead of or
/// behind `b`; lookup failures collapse to `Unknown`.
pub fn relation(sub: &Repository, a: Oid, b: Oid) -> Relation {
    if a == b {
        return Relation::Same;
    }
    match sub.graph_descendant_of(a, b) {
        Ok(true) => Relation::Ahead,
        Ok(false) => match sub.graph_descendant_of(b, a) {
            Ok(true) => Relation::Behind,
            Ok(false) => Relation::Unrelated,
            Err(_) => Relation::Unknown,
        },
        Err(_) => Relation::Unknown,
    }
}

/// Resolve `paths` against `cwd` into repo-relative filters.
fn resolve_filters(repo: &Repository, opts: &StatusOptions) -> Result<Vec<String>> {
    if opts.paths.is_empty() {
        return Ok(Vec::new());
    }
    let workdir = repo
        .workdir()
        .ok_or_else(|| MetaError::Internal("status paths need a working tree".to_string()))?;
    let workdir = workdir.canonicalize()?;
    let cwd = match &opts.cwd {
        Some(cwd) => cwd.clone(),
        None => workdir.clone(),
    };
    let mut filters = Vec::new();
    for path in &opts.paths {
        let abs = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            cwd.join(path)
        };
        let abs = normalize(&abs);
        let rel = abs
            .strip_prefix(&workdir)
            .map_err(|_| MetaError::PathsOutsideWorkTree(path.clone()))?;
        filters.push(rel.to_string_lossy().replace('\\', "/"));
    }
    Ok(filters)
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

fn matches_filter(filters: &[String], path: &str) -> bool {
    filters.is_empty()
        || filters.iter().any(|f| {
            f.is_empty()
                || path == f
                || path.starts_with(&format!("{f}/"))
                || f.starts_with(&format!("{path}/"))
        })
}

fn detect_rebase(repo: &Repository) -> Option<RebaseState> {
    let seq = SequencerState::load(repo, crate::sequencer::SequencerKind::Rebase)
        .ok()
        .flatten();
    if let Some(seq) = seq {
        return Some(RebaseState {
            onto: Some(seq.target.sha),
        });
    }
    let in_git_rebase = repo.path().join("rebase-merge").exists()
        || repo.path().join("rebase-apply").exists();
    in_git_rebase.then_some(RebaseState { onto: None })
}

/// Compute the full status of a repo, recursing into open subs.
pub fn get_repo_status(repo: &Repository, opts: &StatusOptions) -> Result<RepoStatus> {
    let mut status = RepoStatus {
        head_commit: util::head_oid(repo)?,
        current_branch: repo
            .head()
            .ok()
            .filter(|h| !repo.head_detached().unwrap_or(false))
            .and_then(|h| h.shorthand().map(|s| s.to_string())),
        bare: repo.is_bare(),
        sparse: sparse::in_sparse_mode(repo)?,
        rebase: detect_rebase(repo),
        sequencer: SequencerState::load_any(repo)?,
        ..Default::default()
    };

    let filters = resolve_filters(repo, opts)?;
    let open = opener::list_open_subs(repo)?;

    // Sub names come from the union of what is open and what the HEAD-tree /
    // index diff mentions, so additions and deletions both show up.
    let mut names: BTreeSet<String> = open.clone();
    let head_links = match status.head_commit {
        Some(oid) => util::tree_gitlinks(&repo.find_commit(oid)?.tree()?)?,
        None => BTreeMap::new(),
    };
    names.extend(head_links.keys().cloned());
    let mut index_links = BTreeMap::new();
    if !repo.is_bare() {
        let index = repo.index()?;
        for entry in index.iter() {
            if entry.mode == config::GITLINK_MODE {
                let name = String::from_utf8_lossy(&entry.path).to_string();
                names.insert(name.clone());
                index_links.insert(name, entry.id);
            }
        }
    }

    if opts.show_meta_changes && !repo.is_bare() {
        collect_file_changes(repo, opts, &names, &filters, &mut status)?;
    }

    let head_urls = config::urls_at(repo, status.head_commit)?;
    let index_urls = config::urls_at(repo, None)?;

    for name in names {
        if !matches_filter(&filters, &name) {
            continue;
        }
        let head_sha = head_links.get(&name).copied();
        let index_sha = index_links.get(&name).copied();
        let sub_handle = open.contains(&name).then(|| SubRepo {
            name: name.clone(),
            path: repo
                .workdir()
                .expect("open subs imply a workdir")
                .join(&name),
            bare: false,
        });

        let mut sub_status = SubmoduleStatus {
            commit: head_sha.map(|sha| CommitAndUrl {
                sha,
                url: head_urls.get(&name).cloned(),
            }),
            ..Default::default()
        };

        let sub_repo = match &sub_handle {
            Some(handle) => Some(handle.open()?),
            None => None,
        };
        let sub_head = match &sub_repo {
            Some(sub) => util::head_oid(sub)?,
            None => None,
        };

        if let Some(index_sha) = index_sha {
            let rel = match (&sub_repo, sub_head) {
                (Some(sub), Some(head)) => Some(relation(sub, index_sha, head)),
                (Some(_), None) => Some(Relation::Unknown),
                (None, _) => None,
            };
            sub_status.index = Some(IndexStatus {
                sha: index_sha,
                url: index_urls.get(&name).cloned(),
                relation: rel,
            });
        }

        if let Some(sub) = &sub_repo {
            let sub_opts = StatusOptions {
                show_all_untracked: opts.show_all_untracked,
                paths: Vec::new(),
                cwd: None,
                show_meta_changes: true,
                ignore_index: opts.ignore_index,
            };
            let inner = get_repo_status(sub, &sub_opts)?;
            let rel = match (sub_head, index_sha) {
                (Some(h), Some(i)) if h == i => Some(Relation::Same),
                _ => None,
            };
            sub_status.workdir = Some(WorkdirStatus {
                status: Box::new(inner),
                relation: rel,
            });
        }
        status.submodules.insert(name, sub_status);
    }
    Ok(status)
}

fn collect_file_changes(
    repo: &Repository,
    opts: &StatusOptions,
    sub_names: &BTreeSet<String>,
    filters: &[String],
    status: &mut RepoStatus,
) -> Result<()> {
    let mut st_opts = git2::StatusOptions::new();
    st_opts
        .include_untracked(true)
        .recurse_untracked_dirs(opts.show_all_untracked)
        .exclude_submodules(true)
        .include_ignored(false);
    let entries = repo.statuses(Some(&mut st_opts))?;
    for entry in entries.iter() {
        let Some(path) = entry.path() else { continue };
        let path = path.trim_end_matches('/').to_string();
        if sub_names.contains(&path)
            || sub_names
                .iter()
                .any(|n| path.starts_with(&format!("{n}/")))
        {
            continue;
        }
        if !matches_filter(filters, &path) {
            continue;
        }
        let s = entry.status();
        if s.is_conflicted() {
            status.staged.insert(path, FileChange::Conflicted);
            continue;
        }
        if !opts.ignore_index {
            if s.is_index_new() {
                status.staged.insert(path.clone(), FileChange::Added);
            } else if s.is_index_modified() || s.is_index_renamed() {
                status.staged.insert(path.clone(), FileChange::Modified);
            } else if s.is_index_deleted() {
                status.staged.insert(path.clone(), FileChange::Deleted);
            } else if s.is_index_typechange() {
                status.staged.insert(path.clone(), FileChange::TypeChange);
            }
        }
        if s.is_wt_new() {
            status.workdir.insert(path, FileChange::Added);
        } else if s.is_wt_modified() || s.is_wt_renamed() {
            status.workdir.insert(path, FileChange::Modified);
        } else if s.is_wt_deleted() {
            status.workdir.insert(path, FileChange::Deleted);
        } else if s.is_wt_typechange() {
            status.workdir.insert(path, FileChange::TypeChange);
        }
    }
    if opts.ignore_index {
        // Workdir entries above were measured against the index; fold staged
        // differences in so the comparison baseline becomes HEAD.
        let head_tree = match status.head_commit {
            Some(oid) => Some(repo.find_commit(oid)?.tree()?),
            None => None,
        };
        let mut diff_opts = git2::DiffOptions::new();
        diff_opts.include_typechange(true);
        let diff = repo.diff_tree_to_workdir(head_tree.as_ref(), Some(&mut diff_opts))?;
        for delta in diff.deltas() {
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_string_lossy().to_string();
            if path == GITMODULES
                || sub_names.contains(&path)
                || sub_names
                    .iter()
                    .any(|n| path.starts_with(&format!("{n}/")))
                || !matches_filter(filters, &path)
            {
                continue;
            }
            let change = match delta.status() {
                git2::Delta::Added | git2::Delta::Untracked => FileChange::Added,
                git2::Delta::Deleted => FileChange::Deleted,
                git2::Delta::Typechange => FileChange::TypeChange,
                _ => FileChange::Modified,
            };
            status.workdir.insert(path, change);
        }
    }
    Ok(())
}

/// Deep-clean means the meta and every open sub have no staged, workdir, or
/// conflicted entries.
pub fn is_deep_clean(repo: &Repository, include_untracked: bool) -> Result<bool> {
    let opts = StatusOptions {
        show_meta_changes: true,
        show_all_untracked: include_untracked,
        ..Default::default()
    };
    let status = get_repo_status(repo, &opts)?;
    deep_clean_inner(&status, include_untracked)
}

fn deep_clean_inner(status: &RepoStatus, include_untracked: bool) -> Result<bool> {
    if !status.is_clean(include_untracked) {
        return Ok(false);
    }
    for sub in status.submodules.values() {
        if let Some(index) = &sub.index
            && matches!(index.relation, Some(r) if r != Relation::Same)
        {
            return Ok(false);
        }
        if let Some(workdir) = &sub.workdir
            && !deep_clean_inner(&workdir.status, include_untracked)?
        {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A human-oriented description of why the repo is not deep-clean, for the
/// `NotDeepClean` error message.
pub fn describe_dirt(repo: &Repository) -> Result<String> {
    let opts = StatusOptions {
        show_meta_changes: true,
        ..Default::default()
    };
    let status = get_repo_status(repo, &opts)?;
    let mut parts = Vec::new();
    if !status.staged.is_empty() {
        parts.push(format!(
            "staged changes to {}",
            status.staged.keys().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    let modified: Vec<String> = status
        .workdir
        .iter()
        .filter(|(_, c)| !matches!(c, FileChange::Added))
        .map(|(p, _)| p.clone())
        .collect();
    if !modified.is_empty() {
        parts.push(format!("working tree changes to {}", modified.join(", ")));
    }
    for (name, sub) in &status.submodules {
        if let Some(workdir) = &sub.workdir
            && !deep_clean_inner(&workdir.status, false)?
        {
            parts.push(format!("submodule '{name}' is dirty"));
        }
    }
    if parts.is_empty() {
        parts.push("uncommitted changes present".to_string());
    }
    Ok(parts.join("; "))
}
