mod render;

use std::{io::BufReader, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use git2::Repository;
use meta::{
    checkout::{self, CheckoutOptions, OpenOptions},
    cherry_pick, merge,
    merge::{MergeMode, MergeOptions},
    pre_receive::{self, HookMode},
    rebase, ref_gc,
    reset::{self, ResetKind},
    status::{self, StatusOptions},
    stitch::{self, StitchOptions},
    util, MetaError,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "git-convoy")]
#[command(
    about = "Drive a convoy of git repositories in lockstep: one meta repository \
             records a commit per sub repository, and every operation here keeps \
             the meta and its open subs mutually consistent."
)]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open sub repositories: materialize their working trees at the
    /// recorded commits
    Open(OpenArgs),
    /// Close (deinit) sub repositories, keeping their fetched history
    Close(CloseArgs),
    /// Checkout a commit in the meta repo and every open sub
    Checkout(CheckoutArgs),
    /// Reset the meta repo and open subs
    Reset(ResetArgs),
    /// Merge another meta commit, merging diverged subs
    Merge(MergeArgs),
    /// Replay one meta commit's sub changes onto HEAD
    CherryPick(CherryPickArgs),
    /// Rebase the current meta history onto another commit
    Rebase(RebaseArgs),
    /// Show cross-repo status
    Status(StatusArgs),
    /// Flatten meta history into a single history with sub trees inlined
    Stitch(StitchArgs),
    /// Server-side pre-receive check (invoked from hooks)
    #[command(hide = true)]
    PreReceive(PreReceiveArgs),
    /// Prune redundant refs/commits/<sha> synthetic refs
    #[command(hide = true)]
    GcSyntheticRefs(GcArgs),
}

#[derive(Args, Debug)]
struct OpenArgs {
    /// Open the subs modified in this commit
    #[arg(short = 'c', long = "commit")]
    committish: Option<String>,
    /// Re-pin subs that are already open
    #[arg(short, long)]
    force: bool,
    /// Acquire bare gitdirs only
    #[arg(long)]
    half: bool,
    /// Open every sub under each path
    paths: Vec<String>,
}

#[derive(Args, Debug)]
struct CloseArgs {
    #[arg(required = true)]
    names: Vec<String>,
}

#[derive(Args, Debug)]
struct CheckoutArgs {
    /// Create a branch at the target commit first
    #[arg(short = 'b')]
    new_branch: Option<String>,
    committish: Option<String>,
}

#[derive(Args, Debug)]
struct ResetArgs {
    #[arg(long, conflicts_with_all = ["mixed", "hard"])]
    soft: bool,
    #[arg(long, conflicts_with = "hard")]
    mixed: bool,
    #[arg(long)]
    hard: bool,
    committish: Option<String>,
    /// Paths for a path-mode reset (no mode flag allowed)
    #[arg(last = true, conflicts_with_all = ["soft", "mixed", "hard"])]
    paths: Vec<String>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Refuse to create a merge commit; fast-forward or fail
    #[arg(long = "ff-only", conflicts_with = "no_ff")]
    ff_only: bool,
    /// Always create a merge commit, even on fast-forward
    #[arg(long = "no-ff")]
    no_ff: bool,
    #[arg(short = 'm', long = "message")]
    message: Option<String>,
    /// Merge in the object database only; no working trees are touched
    #[arg(long)]
    bare: bool,
    #[arg(long = "continue", conflicts_with_all = ["abort", "committish"])]
    cont: bool,
    #[arg(long, conflicts_with = "committish")]
    abort: bool,
    committish: Option<String>,
}

#[derive(Args, Debug)]
struct CherryPickArgs {
    #[arg(long = "continue", conflicts_with_all = ["abort", "committish"])]
    cont: bool,
    #[arg(long, conflicts_with = "committish")]
    abort: bool,
    committish: Option<String>,
}

#[derive(Args, Debug)]
struct RebaseArgs {
    #[arg(long = "continue", conflicts_with_all = ["abort", "onto"])]
    cont: bool,
    #[arg(long, conflicts_with = "onto")]
    abort: bool,
    onto: Option<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// List every untracked file instead of rolling directories up
    #[arg(long = "all-untracked")]
    all_untracked: bool,
    /// Include non-submodule changes to tracked meta files
    #[arg(long = "meta")]
    meta_changes: bool,
    /// Compare the working tree to HEAD instead of the index
    #[arg(long = "ignore-index")]
    ignore_index: bool,
    paths: Vec<String>,
}

#[derive(Args, Debug)]
struct StitchArgs {
    #[arg(long = "target-branch")]
    target_branch: Option<String>,
    #[arg(long = "num-parallel", default_value_t = 8)]
    num_parallel: usize,
    /// Keep subs matching these globs as gitlinks instead of inlining
    #[arg(long = "keep")]
    keep: Vec<String>,
    /// Drop commits whose stitched tree equals their parent's
    #[arg(long = "skip-empty")]
    skip_empty: bool,
    /// Fetch missing sub commits into the meta object database
    #[arg(long)]
    fetch: bool,
    /// Base url for resolving relative sub urls
    #[arg(long)]
    url: Option<String>,
    /// Extract only this subtree
    #[arg(long = "join-root")]
    join_root: Option<String>,
    #[arg(default_value = "HEAD")]
    committish: String,
}

#[derive(Args, Debug)]
struct PreReceiveArgs {
    /// Which repository kind this hook guards
    #[arg(value_parser = ["meta", "submodule"])]
    mode: String,
}

#[derive(Args, Debug)]
struct GcArgs {
    /// Report what would be removed without writing
    #[arg(long = "dry-run")]
    dry_run: bool,
}

fn open_repo() -> Result<Repository, MetaError> {
    let cwd = std::env::current_dir()?;
    Repository::discover(cwd).map_err(MetaError::from)
}

fn run(cli: Cli) -> Result<i32, MetaError> {
    match cli.command {
        Command::Open(args) => {
            let repo = open_repo()?;
            let opened = checkout::open_subs(
                &repo,
                &args.paths,
                &OpenOptions {
                    committish: args.committish,
                    force: args.force,
                    half: args.half,
                    concurrency: 0,
                },
            )?;
            for name in opened {
                println!("Opened '{name}'.");
            }
            Ok(0)
        }
        Command::Close(args) => {
            let repo = open_repo()?;
            checkout::close_subs(&repo, &args.names)?;
            Ok(0)
        }
        Command::Checkout(args) => {
            let repo = open_repo()?;
            let target = checkout::checkout(
                &repo,
                args.committish.as_deref(),
                &CheckoutOptions {
                    new_branch: args.new_branch,
                    concurrency: 0,
                },
            )?;
            println!("HEAD is now at {target}.");
            Ok(0)
        }
        Command::Reset(args) => {
            let repo = open_repo()?;
            if !args.paths.is_empty() {
                let target = match args.committish.as_deref() {
                    Some(spec) => util::resolve_commit(&repo, spec)?,
                    None => repo.head()?.peel_to_commit()?.id(),
                };
                let cwd = std::env::current_dir()?;
                reset::reset_paths(&repo, Some(&cwd), target, &args.paths)?;
                return Ok(0);
            }
            let kind = if args.soft {
                ResetKind::Soft
            } else if args.hard {
                ResetKind::Hard
            } else {
                ResetKind::Mixed
            };
            let target = match args.committish.as_deref() {
                Some(spec) => util::resolve_commit(&repo, spec)?,
                None => repo.head()?.peel_to_commit()?.id(),
            };
            reset::reset(&repo, target, kind, 0)?;
            Ok(0)
        }
        Command::Merge(args) => {
            let repo = open_repo()?;
            let outcome = if args.cont {
                merge::merge_continue(&repo)?
            } else if args.abort {
                merge::merge_abort(&repo)?;
                return Ok(0);
            } else {
                let committish = args.committish.as_deref().ok_or_else(|| {
                    MetaError::BadRevision("merge needs a commit to merge".to_string())
                })?;
                let mode = if args.ff_only {
                    MergeMode::FfOnly
                } else if args.no_ff {
                    MergeMode::ForceCommit
                } else {
                    MergeMode::Normal
                };
                merge::merge(
                    &repo,
                    committish,
                    &MergeOptions {
                        mode,
                        force_bare: args.bare,
                        message: args.message,
                        ..Default::default()
                    },
                )?
            };
            for line in &outcome.info {
                println!("{line}");
            }
            Ok(0)
        }
        Command::CherryPick(args) => {
            let repo = open_repo()?;
            let outcome = if args.cont {
                cherry_pick::cherry_pick_continue(&repo)?
            } else if args.abort {
                cherry_pick::cherry_pick_abort(&repo)?;
                return Ok(0);
            } else {
                let committish = args.committish.as_deref().ok_or_else(|| {
                    MetaError::BadRevision("cherry-pick needs a commit".to_string())
                })?;
                cherry_pick::cherry_pick(&repo, committish, 0)?
            };
            for line in &outcome.info {
                println!("{line}");
            }
            Ok(0)
        }
        Command::Rebase(args) => {
            let repo = open_repo()?;
            let outcome = if args.cont {
                rebase::rebase_continue(&repo)?
            } else if args.abort {
                rebase::rebase_abort(&repo)?;
                return Ok(0);
            } else {
                let onto = args.onto.as_deref().ok_or_else(|| {
                    MetaError::BadRevision("rebase needs a commit to rebase onto".to_string())
                })?;
                rebase::rebase(&repo, onto, 0)?
            };
            for line in &outcome.info {
                println!("{line}");
            }
            Ok(0)
        }
        Command::Status(args) => {
            let repo = open_repo()?;
            let opts = StatusOptions {
                show_all_untracked: args.all_untracked,
                paths: args.paths,
                cwd: Some(std::env::current_dir()?),
                show_meta_changes: args.meta_changes,
                ignore_index: args.ignore_index,
            };
            let repo_status = status::get_repo_status(&repo, &opts)?;
            print!("{}", render::render_status(&repo_status));
            Ok(0)
        }
        Command::Stitch(args) => {
            let repo = open_repo()?;
            let outcome = stitch::stitch(
                &repo,
                &args.committish,
                &StitchOptions {
                    target_branch: args.target_branch,
                    num_parallel: args.num_parallel,
                    keep: args.keep,
                    skip_empty: args.skip_empty,
                    fetch: args.fetch,
                    url: args.url,
                    join_root: args.join_root,
                },
            )?;
            println!(
                "Stitched {} commit(s), skipped {}.",
                outcome.converted, outcome.skipped
            );
            if let Some(head) = outcome.head {
                println!("Stitched head: {head}.");
            }
            Ok(0)
        }
        Command::PreReceive(args) => {
            let mode = if args.mode == "meta" {
                HookMode::Meta
            } else {
                HookMode::Submodule
            };
            let cwd = std::env::current_dir()?;
            let stdin = std::io::stdin();
            let mut input = BufReader::new(stdin.lock());
            let (messages, code) = pre_receive::pre_receive(&cwd, mode, &mut input)?;
            for line in messages {
                eprintln!("{line}");
            }
            Ok(code)
        }
        Command::GcSyntheticRefs(args) => {
            let repo = open_repo()?;
            let outcome = ref_gc::run(&repo, &ref_gc::RefGcOptions { dry_run: args.dry_run })?;
            for line in outcome.messages {
                println!("{line}");
            }
            for (repo_path, refs) in outcome.removed {
                if !args.dry_run {
                    println!("{repo_path}: removed {} ref(s)", refs.len());
                }
            }
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) if e.is_user_error() => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("internal error: {e}");
            ExitCode::from(2)
        }
    }
}
