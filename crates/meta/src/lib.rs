//! Engine crate for git-convoy: a meta-repository porcelain over git
//! submodules.
//!
//! A meta repo's tree entries are gitlinks into many sub repos; one meta
//! commit records one sha per sub and therefore one atomic cross-repo
//! state. The modules here keep that state consistent through composite
//! operations: acquiring subs on demand (`opener`), computing cross-repo
//! status (`status`), classifying per-sub deltas (`changes`), and driving
//! merge / cherry-pick / rebase / reset with resumable on-disk state
//! (`sequencer`). `stitch` flattens a meta history into a single inlined
//! history, and `pre_receive` / `ref_gc` maintain the server-side synthetic
//! refs that keep pinned sub commits alive.

pub mod changes;
pub mod checkout;
pub mod cherry_pick;
pub mod cli;
pub mod config;
pub mod deinit;
pub mod error;
pub mod fetcher;
pub mod ident;
pub mod merge;
pub mod opener;
pub mod pre_receive;
pub mod rebase;
pub mod ref_gc;
pub mod reset;
pub mod sequencer;
pub mod sparse;
pub mod status;
pub mod stitch;
pub mod util;
pub mod work_queue;

pub use changes::{ComputedChanges, SubmoduleChange};
pub use error::{MetaError, Result};
pub use opener::{OpenMode, Opener, SubRepo};
pub use sequencer::{SequencerKind, SequencerState};
pub use status::{RepoStatus, Relation, StatusOptions, SubmoduleStatus};
