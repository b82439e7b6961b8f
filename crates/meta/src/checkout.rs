//! The `open`, `close`, and `checkout` porcelain drivers.

use git2::{build::CheckoutBuilder, ObjectType, Oid, Repository};

use crate::{
    deinit,
    error::{MetaError, Result},
    opener::{self, OpenMode, Opener},
    sparse, status, util,
    work_queue::{self, DEFAULT_CONCURRENCY},
};

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Select the subs modified in this commit instead of using paths.
    pub committish: Option<String>,
    /// Re-pin subs that are already open.
    pub force: bool,
    /// Acquire bare gitdirs only; no working directories.
    pub half: bool,
    pub concurrency: usize,
}

/// Open every sub under each of `paths` (or the subs modified in
/// `committish`). Per-sub user errors are collected so the remaining subs
/// still get their chance; the combined report is returned as one error.
pub fn open_subs(repo: &Repository, paths: &[String], opts: &OpenOptions) -> Result<Vec<String>> {
    let opener = Opener::new(repo, None);
    let links = opener.pinned_gitlinks()?;

    let names: Vec<String> = if let Some(spec) = &opts.committish {
        let oid = util::resolve_commit(repo, spec)?;
        subs_touched_by(repo, oid)?
            .into_iter()
            .filter(|n| links.contains_key(n))
            .collect()
    } else if paths.is_empty() {
        links.keys().cloned().collect()
    } else {
        let mut names = Vec::new();
        for name in links.keys() {
            if paths
                .iter()
                .map(|p| p.trim_end_matches('/'))
                .any(|p| p == name || name.starts_with(&format!("{p}/")) || p == ".")
            {
                names.push(name.clone());
            }
        }
        names
    };

    let already_open = opener::list_open_subs(repo)?;
    let mode = if opts.half {
        OpenMode::AllowBare
    } else {
        OpenMode::ForceOpen
    };
    let concurrency = if opts.concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        opts.concurrency
    };

    let results = work_queue::run_all(names.clone(), concurrency, |_, name| {
        let was_open = already_open.contains(&name);
        if was_open && !opts.force {
            return Ok(name);
        }
        let sub = opener.get_subrepo(&name, mode)?;
        if opts.force && was_open && !opts.half {
            let sha = opener.pinned_sha(&name)?;
            opener.fetcher()?.fetch_sha(&sub.path, &name, sha)?;
            util::set_sub_head(&sub.open()?, sha)?;
        }
        Ok(name)
    });

    let mut opened = Vec::new();
    let mut failures = Vec::new();
    for (name, result) in names.iter().zip(results) {
        match result {
            Ok(_) => opened.push(name.clone()),
            Err(e) if e.is_user_error() => failures.push(format!("{name}: {e}")),
            Err(e) => return Err(e),
        }
    }

    finish_index_write(repo)?;
    if !failures.is_empty() {
        return Err(MetaError::Conflicts {
            message: format!("failed to open:\n{}", failures.join("\n")),
        });
    }
    Ok(opened)
}

/// Subs whose gitlink differs between `commit` and its first parent.
fn subs_touched_by(repo: &Repository, commit: Oid) -> Result<Vec<String>> {
    let commit_obj = repo.find_commit(commit)?;
    let new_links = util::tree_gitlinks(&commit_obj.tree()?)?;
    let old_links = if commit_obj.parent_count() > 0 {
        util::tree_gitlinks(&commit_obj.parent(0)?.tree()?)?
    } else {
        Default::default()
    };
    let mut touched = Vec::new();
    for (name, sha) in &new_links {
        if old_links.get(name) != Some(sha) {
            touched.push(name.clone());
        }
    }
    for name in old_links.keys() {
        if !new_links.contains_key(name) {
            touched.push(name.clone());
        }
    }
    touched.sort();
    touched.dedup();
    Ok(touched)
}

/// Deinit the named subs. `.git/modules/<name>` survives so re-opening does
/// not refetch history.
pub fn close_subs(repo: &Repository, names: &[String]) -> Result<()> {
    let open = opener::list_open_subs(repo)?;
    let mut to_close = Vec::new();
    for name in names {
        let name = name.trim_end_matches('/').to_string();
        if open.contains(&name) {
            to_close.push(name);
        } else {
            tracing::warn!(name, "not open; skipping close");
        }
    }
    if to_close.is_empty() {
        return Ok(());
    }
    deinit::deinit_subs(repo, &to_close)?;
    finish_index_write(repo)?;
    Ok(())
}

fn finish_index_write(repo: &Repository) -> Result<()> {
    let mut index = repo.index()?;
    if sparse::in_sparse_mode(repo)? {
        sparse::set_sparse_bits_and_write_index(repo, &mut index)?;
    } else {
        index.write()?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutOptions {
    pub new_branch: Option<String>,
    pub concurrency: usize,
}

/// Checkout the meta repo and align every open sub with the target commit's
/// recorded shas. Subs the target no longer carries are deinit'd; subs it
/// adds stay closed until opened.
pub fn checkout(
    repo: &Repository,
    committish: Option<&str>,
    opts: &CheckoutOptions,
) -> Result<Oid> {
    let head = util::head_oid(repo)?
        .ok_or_else(|| MetaError::Internal("meta repository has no HEAD commit".to_string()))?;
    let target = match committish {
        Some(spec) => util::resolve_commit(repo, spec)?,
        None => head,
    };

    if target != head && !status::is_deep_clean(repo, false)? {
        return Err(MetaError::NotDeepClean(status::describe_dirt(repo)?));
    }

    if let Some(branch) = &opts.new_branch {
        let commit = repo.find_commit(target)?;
        repo.branch(branch, &commit, false)?;
        repo.set_head(&format!("refs/heads/{branch}"))?;
        let mut co = CheckoutBuilder::new();
        co.force();
        repo.checkout_head(Some(&mut co))?;
        if target == head {
            return Ok(target);
        }
    } else if target != head {
        // Attach to a local branch when the spec names one, else detach.
        let branch_ref = committish
            .map(|spec| format!("refs/heads/{spec}"))
            .filter(|name| repo.find_reference(name).is_ok());
        let object = repo.find_object(target, Some(ObjectType::Commit))?;
        let mut co = CheckoutBuilder::new();
        co.force();
        repo.checkout_tree(&object, Some(&mut co))?;
        match branch_ref {
            Some(name) => repo.set_head(&name)?,
            None => repo.set_head_detached(target)?,
        }
    } else {
        return Ok(target);
    }

    align_open_subs(repo, target, opts.concurrency)?;
    finish_index_write(repo)?;
    Ok(target)
}

/// Fetch and hard-reset every open sub to the sha `target` records for it.
pub fn align_open_subs(repo: &Repository, target: Oid, concurrency: usize) -> Result<()> {
    let opener = Opener::new(repo, Some(target));
    let links = opener.pinned_gitlinks()?;
    let open = opener::list_open_subs(repo)?;
    let concurrency = if concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    };

    let mut gone: Vec<String> = Vec::new();
    let mut keep: Vec<(String, Oid)> = Vec::new();
    for name in &open {
        match links.get(name) {
            Some(sha) => keep.push((name.clone(), *sha)),
            None => gone.push(name.clone()),
        }
    }

    work_queue::do_in_parallel(keep, concurrency, |_, (name, sha)| {
        let sub = opener.get_subrepo(&name, OpenMode::ForceOpen)?;
        opener.fetcher()?.fetch_sha(&sub.path, &name, sha)?;
        util::set_sub_head(&sub.open()?, sha)?;
        Ok(())
    })?;

    if !gone.is_empty() {
        deinit::deinit_subs(repo, &gone)?;
    }
    Ok(())
}
