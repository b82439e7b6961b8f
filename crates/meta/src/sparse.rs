//! Sparse-mode support: a meta repo can keep only `.gitmodules` and the
//! currently open subs materialized. The sparse-checkout file anchors on a
//! `.gitmodules` first line; open sub names are appended below it, and the
//! SKIP_WORKTREE index bit carries the authoritative open/closed state.

use std::{fs, path::PathBuf};

use git2::{Index, Repository};

use crate::{config::GITMODULES, error::Result, opener};

const SKIP_WORKTREE: u16 = 1 << 14;

fn sparse_file(repo: &Repository) -> PathBuf {
    repo.path().join("info").join("sparse-checkout")
}

/// True iff `core.sparsecheckout` is on and the sparse file is anchored on
/// `.gitmodules`. Open-sub lines after the anchor do not leave sparse mode.
pub fn in_sparse_mode(repo: &Repository) -> Result<bool> {
    let enabled = repo
        .config()?
        .get_bool("core.sparsecheckout")
        .unwrap_or(false);
    if !enabled {
        return Ok(false);
    }
    match fs::read_to_string(sparse_file(repo)) {
        Ok(text) => Ok(text.starts_with(&format!("{GITMODULES}\n"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn add_to_sparse_file(repo: &Repository, name: &str) -> Result<()> {
    let path = sparse_file(repo);
    let mut text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if text.lines().any(|l| l == name) {
        return Ok(());
    }
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(name);
    text.push('\n');
    fs::write(path, text)?;
    Ok(())
}

pub fn remove_from_sparse_file(repo: &Repository, names: &[String]) -> Result<()> {
    let path = sparse_file(repo);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !names.iter().any(|n| n == line) {
            out.push_str(line);
            out.push('\n');
        }
    }
    fs::write(path, out)?;
    Ok(())
}

/// Rewrite the SKIP_WORKTREE bits over the whole index and persist it: the
/// bit is cleared on `.gitmodules` and on open-sub gitlinks, set everywhere
/// else. This is the only legal index write after open/close in sparse mode.
pub fn set_sparse_bits_and_write_index(repo: &Repository, index: &mut Index) -> Result<()> {
    let open = opener::list_open_subs(repo)?;
    let entries: Vec<git2::IndexEntry> = index.iter().collect();
    for mut entry in entries {
        let path = String::from_utf8_lossy(&entry.path).to_string();
        let keep = path == GITMODULES || open.contains(&path);
        let flagged = entry.flags_extended & SKIP_WORKTREE != 0;
        if keep && flagged {
            entry.flags_extended &= !SKIP_WORKTREE;
            index.add(&entry)?;
        } else if !keep && !flagged {
            entry.flags_extended |= SKIP_WORKTREE;
            index.add(&entry)?;
        }
    }
    index.write()?;
    Ok(())
}
