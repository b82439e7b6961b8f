//! Tearing a sub back down to half-open: the working directory and config
//! stanza go away, `.git/modules/<name>` stays so re-opening is cheap and
//! nothing fetched is lost.

use std::{fs, path::Path};

use git2::Repository;

use crate::{config, error::Result, sparse};

/// Deinit each named sub. In sparse mode the workdir directory is removed
/// outright (and now-empty parents pruned); otherwise only its contents are
/// cleared, because deleting the directory itself would read as a submodule
/// deletion in the meta index.
pub fn deinit_subs(meta: &Repository, names: &[String]) -> Result<()> {
    let sparse_mode = sparse::in_sparse_mode(meta)?;
    let config_path = meta.path().join("config");
    for name in names {
        tracing::debug!(name, "deinit submodule");
        if let Some(workdir) = meta.workdir() {
            let sub_dir = workdir.join(name);
            if sparse_mode {
                remove_tree_tolerant(&sub_dir)?;
                prune_empty_parents(workdir, &sub_dir);
            } else {
                clear_dir_contents(&sub_dir)?;
            }
        }
        config::clear_config_entry(&config_path, name)?;
    }
    if sparse_mode {
        sparse::remove_from_sparse_file(meta, names)?;
    }
    Ok(())
}

fn remove_tree_tolerant(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove parents of `start` that became empty, stopping at the meta root.
/// Races with concurrent creation are tolerated.
fn prune_empty_parents(root: &Path, start: &Path) {
    let mut dir = start.parent();
    while let Some(current) = dir {
        if current == root {
            break;
        }
        match fs::remove_dir(current) {
            Ok(()) => {}
            Err(_) => break,
        }
        dir = current.parent();
    }
}

fn clear_dir_contents(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_tree_tolerant(&path)?;
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
