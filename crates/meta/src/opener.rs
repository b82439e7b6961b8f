//! On-demand acquisition of sub-repo handles.
//!
//! A sub can be **open** (workdir at `<meta>/<name>` plus a gitdir under
//! `.git/modules/<name>`), **half-open** (gitdir only), or closed. One
//! `Opener` serves one composite operation: it lazily discovers the on-disk
//! state, hands out cheap path handles, and remembers which subs this
//! operation materialized so they can be offered the post-open hook exactly
//! once and torn back down if they end up unused.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    process::Command,
    sync::{Mutex, OnceLock},
};

use git2::{Oid, Repository};

use crate::{
    changes::{SimpleChange, SimpleKind},
    config, deinit,
    error::{MetaError, Result},
    fetcher::SubmoduleFetcher,
    sparse, util,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// A working directory is required; half-open subs are promoted.
    ForceOpen,
    /// Any existing handle will do; otherwise a bare gitdir is created.
    AllowBare,
    /// Never touch the working tree, even if one exists.
    ForceBare,
}

/// A cheap, cloneable handle to a sub repository. Tasks open their own
/// `git2::Repository` from it so no libgit2 state crosses threads.
#[derive(Debug, Clone)]
pub struct SubRepo {
    pub name: String,
    pub path: PathBuf,
    pub bare: bool,
}

impl SubRepo {
    pub fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.path)?)
    }
}

/// Open subs: those whose workdir gitdir-link and modules HEAD both exist.
pub fn list_open_subs(repo: &Repository) -> Result<BTreeSet<String>> {
    let mut open = BTreeSet::new();
    let Some(workdir) = repo.workdir() else {
        return Ok(open);
    };
    for name in module_names(repo)? {
        if workdir.join(&name).join(".git").exists() {
            open.insert(name);
        }
    }
    Ok(open)
}

/// Half-open subs: a modules gitdir with no corresponding workdir.
pub fn list_half_open_subs(repo: &Repository) -> Result<BTreeSet<String>> {
    let mut half = BTreeSet::new();
    let workdir = repo.workdir();
    for name in module_names(repo)? {
        let absorbed = workdir
            .map(|w| w.join(&name).join(".git").exists())
            .unwrap_or(false);
        if !absorbed {
            half.insert(name);
        }
    }
    Ok(half)
}

/// Names under `.git/modules` whose directory holds a HEAD file.
fn module_names(repo: &Repository) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let modules = repo.path().join("modules");
    if modules.is_dir() {
        collect_module_names(&modules, &modules, &mut names)?;
    }
    Ok(names)
}

fn collect_module_names(
    root: &Path,
    dir: &Path,
    names: &mut BTreeSet<String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if path.join("HEAD").is_file() {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under modules root");
            names.insert(rel.to_string_lossy().replace('\\', "/"));
        } else {
            collect_module_names(root, &path, names)?;
        }
    }
    Ok(())
}

struct OpenerInit {
    meta_url: Option<String>,
    template_path: Option<PathBuf>,
    sparse: bool,
    open_on_entry: BTreeSet<String>,
    bare_on_entry: BTreeSet<String>,
    gitlinks: BTreeMap<String, Oid>,
}

#[derive(Default)]
struct Caches {
    open: BTreeMap<String, SubRepo>,
    bare: BTreeMap<String, SubRepo>,
    auto_opened: BTreeSet<String>,
    hooks_run: BTreeSet<String>,
}

pub struct Opener {
    meta_path: PathBuf,
    pinned: Option<Oid>,
    init: OnceLock<OpenerInit>,
    fetcher: OnceLock<SubmoduleFetcher>,
    caches: Mutex<Caches>,
    /// Serializes edits to `.git/config` and the sparse-checkout file, which
    /// are single-writer resources even when sub acquisition fans out.
    config_lock: Mutex<()>,
}

impl Opener {
    /// `pinned` selects the commit whose tree and `.gitmodules` define sub
    /// shas and urls; `None` pins HEAD at first use.
    pub fn new(repo: &Repository, pinned: Option<Oid>) -> Self {
        let meta_path = repo
            .workdir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| repo.path().to_path_buf());
        Self {
            meta_path,
            pinned,
            init: OnceLock::new(),
            fetcher: OnceLock::new(),
            caches: Mutex::new(Caches::default()),
            config_lock: Mutex::new(()),
        }
    }

    pub fn meta(&self) -> Result<Repository> {
        Ok(Repository::open(&self.meta_path)?)
    }

    fn ensure_init(&self) -> Result<&OpenerInit> {
        if let Some(init) = self.init.get() {
            return Ok(init);
        }
        let repo = self.meta()?;
        let pinned = match self.pinned {
            Some(oid) => Some(oid),
            None => util::head_oid(&repo)?,
        };
        let gitlinks = match pinned {
            Some(oid) => util::tree_gitlinks(&repo.find_commit(oid)?.tree()?)?,
            None => BTreeMap::new(),
        };
        let meta_url = repo
            .find_remote("origin")
            .ok()
            .and_then(|r| r.url().map(|u| u.to_string()));
        let template_path = repo
            .config()?
            .get_path("meta.submoduleTemplatePath")
            .ok();
        let built = OpenerInit {
            meta_url,
            template_path,
            sparse: sparse::in_sparse_mode(&repo)?,
            open_on_entry: list_open_subs(&repo)?,
            bare_on_entry: list_half_open_subs(&repo)?,
            gitlinks,
        };
        Ok(self.init.get_or_init(|| built))
    }

    pub fn fetcher(&self) -> Result<&SubmoduleFetcher> {
        if let Some(f) = self.fetcher.get() {
            return Ok(f);
        }
        let repo = self.meta()?;
        let pinned = match self.pinned {
            Some(oid) => Some(oid),
            None => util::head_oid(&repo)?,
        };
        let built = SubmoduleFetcher::new(&repo, pinned);
        Ok(self.fetcher.get_or_init(|| built))
    }

    pub fn in_sparse_mode(&self) -> Result<bool> {
        Ok(self.ensure_init()?.sparse)
    }

    /// Gitlink sha recorded for `name` in the pinned commit.
    pub fn pinned_sha(&self, name: &str) -> Result<Oid> {
        self.ensure_init()?
            .gitlinks
            .get(name)
            .copied()
            .ok_or_else(|| MetaError::SubHeadMissing(name.to_string()))
    }

    pub fn pinned_gitlinks(&self) -> Result<BTreeMap<String, Oid>> {
        Ok(self.ensure_init()?.gitlinks.clone())
    }

    /// Subs this operation materialized itself (not open when it started).
    pub fn auto_opened(&self) -> BTreeSet<String> {
        self.caches.lock().expect("opener cache poisoned").auto_opened.clone()
    }

    fn open_handle(&self, name: &str) -> SubRepo {
        SubRepo {
            name: name.to_string(),
            path: self.meta_path.join(name),
            bare: false,
        }
    }

    fn bare_handle(&self, meta: &Repository, name: &str) -> SubRepo {
        SubRepo {
            name: name.to_string(),
            path: config::sub_git_dir(meta, name),
            bare: true,
        }
    }

    /// Acquire a handle for `name` per the mode decision table.
    pub fn get_subrepo(&self, name: &str, mode: OpenMode) -> Result<SubRepo> {
        let init = self.ensure_init()?;
        let meta = self.meta()?;
        {
            let caches = self.caches.lock().expect("opener cache poisoned");
            match mode {
                OpenMode::ForceOpen => {
                    if let Some(sub) = caches.open.get(name) {
                        return Ok(sub.clone());
                    }
                }
                OpenMode::AllowBare => {
                    if let Some(sub) = caches.open.get(name) {
                        return Ok(sub.clone());
                    }
                    if let Some(sub) = caches.bare.get(name) {
                        return Ok(sub.clone());
                    }
                }
                OpenMode::ForceBare => {
                    if let Some(sub) = caches.bare.get(name) {
                        return Ok(sub.clone());
                    }
                }
            }
        }

        let is_open = init.open_on_entry.contains(name);
        let is_half = init.bare_on_entry.contains(name);
        let sub = match mode {
            OpenMode::ForceOpen => {
                if is_open {
                    let sub = self.open_handle(name);
                    self.caches
                        .lock()
                        .expect("opener cache poisoned")
                        .open
                        .insert(name.to_string(), sub.clone());
                    sub
                } else {
                    // A half-open gitdir is promoted in place; its cache
                    // entry (if any) is dropped first.
                    self.clear_absorbed_cache(name);
                    self.full_open(&meta, init, name)?
                }
            }
            OpenMode::AllowBare => {
                if is_open {
                    let sub = self.open_handle(name);
                    self.caches
                        .lock()
                        .expect("opener cache poisoned")
                        .open
                        .insert(name.to_string(), sub.clone());
                    sub
                } else if is_half {
                    let sub = self.bare_handle(&meta, name);
                    self.caches
                        .lock()
                        .expect("opener cache poisoned")
                        .bare
                        .insert(name.to_string(), sub.clone());
                    sub
                } else {
                    self.init_bare(&meta, init, name)?
                }
            }
            OpenMode::ForceBare => {
                if is_open || is_half {
                    let sub = self.bare_handle(&meta, name);
                    self.caches
                        .lock()
                        .expect("opener cache poisoned")
                        .bare
                        .insert(name.to_string(), sub.clone());
                    sub
                } else {
                    self.init_bare(&meta, init, name)?
                }
            }
        };
        Ok(sub)
    }

    /// Drop a cached half-open handle so the next `ForceOpen` re-acquires it
    /// with a working directory.
    pub fn clear_absorbed_cache(&self, name: &str) {
        self.caches
            .lock()
            .expect("opener cache poisoned")
            .bare
            .remove(name);
    }

    fn init_bare(&self, meta: &Repository, init: &OpenerInit, name: &str) -> Result<SubRepo> {
        let url = self.fetcher()?.submodule_url(name)?;
        {
            let _config = self.config_lock.lock().expect("config lock poisoned");
            config::init_submodule_and_repo(
                init.meta_url.as_deref(),
                meta,
                name,
                &url,
                init.template_path.as_deref(),
                true,
            )?;
        }
        let sub = self.bare_handle(meta, name);
        let mut caches = self.caches.lock().expect("opener cache poisoned");
        caches.bare.insert(name.to_string(), sub.clone());
        caches.auto_opened.insert(name.to_string());
        Ok(sub)
    }

    fn full_open(&self, meta: &Repository, init: &OpenerInit, name: &str) -> Result<SubRepo> {
        let sha = self.pinned_sha(name)?;
        let url = self.fetcher()?.submodule_url(name)?;
        let was_half = init.bare_on_entry.contains(name);
        let sub_repo = {
            let _config = self.config_lock.lock().expect("config lock poisoned");
            config::init_submodule_and_repo(
                init.meta_url.as_deref(),
                meta,
                name,
                &url,
                init.template_path.as_deref(),
                false,
            )?
        };
        let sub = self.open_handle(name);

        if let Err(e) = self.fetcher()?.fetch_sha(&sub.path, name, sha) {
            // Never leave a half-open carcass behind: tear the sub back
            // down so the open/half-open invariant holds after failure.
            if !was_half {
                let _config = self.config_lock.lock().expect("config lock poisoned");
                if let Err(cleanup) = deinit::deinit_subs(meta, &[name.to_string()]) {
                    tracing::warn!(name, "rollback deinit failed: {cleanup}");
                }
            }
            return Err(e);
        }
        util::set_sub_head(&sub_repo, sha)?;
        sub_repo.config()?.set_i32("gc.auto", 0)?;

        if init.sparse {
            let _config = self.config_lock.lock().expect("config lock poisoned");
            sparse::add_to_sparse_file(meta, name)?;
        }
        self.run_post_open_hook(meta, name, &sub.path);

        let mut caches = self.caches.lock().expect("opener cache poisoned");
        caches.bare.remove(name);
        caches.open.insert(name.to_string(), sub.clone());
        if !init.open_on_entry.contains(name) {
            caches.auto_opened.insert(name.to_string());
        }
        Ok(sub)
    }

    /// Run `<meta-gitdir>/hooks/post-open-submodule <name>` once per sub per
    /// operation. Hook failure is reported but does not fail the open.
    fn run_post_open_hook(&self, meta: &Repository, name: &str, workdir: &Path) {
        {
            let mut caches = self.caches.lock().expect("opener cache poisoned");
            if !caches.hooks_run.insert(name.to_string()) {
                return;
            }
        }
        let hook = meta.path().join("hooks").join("post-open-submodule");
        if !hook.is_file() {
            return;
        }
        match Command::new(&hook).arg(name).current_dir(workdir).status() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::warn!(name, %status, "post-open-submodule hook failed")
            }
            Err(e) => tracing::warn!(name, "post-open-submodule hook did not run: {e}"),
        }
    }

    /// Apply add/remove/fast-forward changes to the meta index. Under
    /// `force_bare` only the index moves; working trees are left alone.
    pub fn change_submodules(
        &self,
        index: &mut git2::Index,
        simple: &BTreeMap<String, SimpleChange>,
        force_bare: bool,
    ) -> Result<()> {
        let meta = self.meta()?;
        let open_now = list_open_subs(&meta)?;
        for (name, change) in simple {
            match change.kind {
                SimpleKind::Add => {
                    let sha = change.sha.expect("add carries a sha");
                    util::stage_gitlink(index, name, sha)?;
                }
                SimpleKind::Remove => {
                    if !force_bare && open_now.contains(name) {
                        deinit::deinit_subs(&meta, &[name.clone()])?;
                    }
                    let _ = index.remove_path(Path::new(name));
                }
                SimpleKind::FastForward => {
                    let sha = change.sha.expect("fast-forward carries a sha");
                    if !force_bare && open_now.contains(name) {
                        let sub = self.get_subrepo(name, OpenMode::ForceOpen)?;
                        self.fetcher()?.fetch_sha(&sub.path, name, sha)?;
                        util::set_sub_head(&sub.open()?, sha)?;
                    }
                    util::stage_gitlink(index, name, sha)?;
                }
            }
        }
        Ok(())
    }

    /// Deinit every auto-opened sub not named in `keep`. Used by engines
    /// that opportunistically open subs and then discover nothing changed.
    pub fn close_unused_auto_opened(&self, keep: &BTreeSet<String>) -> Result<()> {
        let meta = self.meta()?;
        let auto = self.auto_opened();
        let unused: Vec<String> = auto.difference(keep).cloned().collect();
        if unused.is_empty() {
            return Ok(());
        }
        tracing::debug!(?unused, "closing subs opened by this operation but unused");
        deinit::deinit_subs(&meta, &unused)?;
        let mut caches = self.caches.lock().expect("opener cache poisoned");
        for name in &unused {
            caches.open.remove(name);
            caches.bare.remove(name);
            caches.auto_opened.remove(name);
        }
        Ok(())
    }
}
