use thiserror::Error;

use crate::cli::GitCliError;

/// Error taxonomy for convoy operations.
///
/// Variants fall in two classes: user errors, which the CLI prints and maps
/// to exit code 1, and everything else, which bubbles up as exit code 2.
/// `is_user_error` is the single source of truth for that split.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    GitCli(#[from] GitCliError),

    #[error("submodule url '{0}' is relative but the meta repo has no origin remote")]
    RelativeUrlWithoutOrigin(String),
    #[error("no submodule url configured for '{0}'")]
    NoSubmoduleUrl(String),
    #[error("failed to fetch {sha} for submodule '{name}': {message}")]
    FetchFailed {
        name: String,
        sha: String,
        message: String,
    },
    #[error("no common ancestor between {0} and {1}")]
    NoCommonAncestor(String, String),
    #[error("cherry-picking or rebasing submodule URL changes is not supported")]
    UrlChangesUnsupported,
    #[error("commit changes non-submodule paths: {}", .paths.join(", "))]
    NonSubChangeUnsupported { paths: Vec<String> },
    #[error("a merge is already in progress; run 'merge --continue' or 'merge --abort'")]
    MergeInProgress,
    #[error("no merge in progress")]
    NoMergeInProgress,
    #[error(
        "a cherry-pick is already in progress; run 'cherry-pick --continue' or 'cherry-pick --abort'"
    )]
    CherryPickInProgress,
    #[error("no cherry-pick in progress")]
    NoCherryPickInProgress,
    #[error("a rebase is already in progress; run 'rebase --continue' or 'rebase --abort'")]
    RebaseInProgress,
    #[error("no rebase in progress")]
    NoRebaseInProgress,
    #[error("repository is not clean: {0}")]
    NotDeepClean(String),
    #[error("cannot fast-forward")]
    CannotFastForward,
    #[error("path '{0}' is outside the working tree")]
    PathsOutsideWorkTree(String),
    #[error("unresolved conflicts remain: {}", .paths.join(", "))]
    UnresolvedConflicts { paths: Vec<String> },
    #[error("submodule '{0}' has no HEAD commit")]
    SubHeadMissing(String),
    #[error("path-mode reset requires the target to be HEAD")]
    CannotResetNonHead,
    #[error("{message}")]
    Conflicts { message: String },
    #[error("invalid revision '{0}'")]
    BadRevision(String),
    #[error("{0}")]
    Internal(String),
}

impl MetaError {
    /// True for errors the user caused and can act on; these are printed
    /// without a backtrace and exit with status 1.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            MetaError::Git(_) | MetaError::Io(_) | MetaError::GitCli(_) | MetaError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;
