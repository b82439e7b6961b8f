//! Prune redundant `refs/commits/<sha>` synthetic refs on server-side sub
//! repos.
//!
//! A synthetic ref pins a sub commit so nothing garbage-collects it while a
//! meta ref still points at it. Once a pinned commit is merely an ancestor
//! of another pinned commit ("class-A root"), its own ref is redundant: the
//! root keeps the whole chain alive.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::PathBuf,
};

use git2::{Oid, Repository};

use crate::{config, error::Result, util};

pub const SYNTHETIC_REF_PREFIX: &str = "refs/commits/";

#[derive(Debug, Clone, Copy, Default)]
pub struct RefGcOptions {
    /// Report what would be removed without writing.
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct RefGcOutcome {
    /// Removed (or would-remove) refs, per sub repo path.
    pub removed: BTreeMap<String, Vec<String>>,
    pub messages: Vec<String>,
}

/// Map a sub url onto its server-side bare repo path using the
/// `gitmeta.subrepourlbase` / `gitmeta.subreporootpath` /
/// `gitmeta.subreposuffix` configuration.
pub(crate) fn sub_repo_local_path(
    url_base: Option<&str>,
    root_path: Option<&str>,
    suffix: Option<&str>,
    url: &str,
) -> Option<PathBuf> {
    let rest = match url_base {
        Some(base) => url.strip_prefix(base)?,
        None => url,
    };
    let root = root_path?;
    let mut path = format!("{}/{}", root.trim_end_matches('/'), rest.trim_start_matches('/'));
    if let Some(suffix) = suffix {
        path.push_str(suffix);
    }
    Some(PathBuf::from(path))
}

pub(crate) struct UrlMapping {
    pub url_base: Option<String>,
    pub root_path: Option<String>,
    pub suffix: Option<String>,
}

pub(crate) fn url_mapping(repo: &Repository) -> Result<UrlMapping> {
    let cfg = repo.config()?;
    Ok(UrlMapping {
        url_base: cfg.get_string("gitmeta.subrepourlbase").ok(),
        root_path: cfg.get_string("gitmeta.subreporootpath").ok(),
        suffix: cfg.get_string("gitmeta.subreposuffix").ok(),
    })
}

impl UrlMapping {
    pub fn local_path(&self, url: &str) -> Option<PathBuf> {
        sub_repo_local_path(
            self.url_base.as_deref(),
            self.root_path.as_deref(),
            self.suffix.as_deref(),
            url,
        )
    }
}

/// Find and prune synthetic refs that are plain ancestors of a persistent
/// tip's pinned commit.
pub fn run(repo: &Repository, opts: &RefGcOptions) -> Result<RefGcOutcome> {
    let mapping = url_mapping(repo)?;
    let mut outcome = RefGcOutcome::default();

    // Class-A roots: the sub shas pinned by the tip of every persistent ref,
    // grouped by the sub's server-side repo.
    let mut roots: HashMap<PathBuf, BTreeSet<Oid>> = HashMap::new();
    for glob in ["refs/heads/*", "refs/tags/*"] {
        for reference in repo.references_glob(glob)? {
            let reference = reference?;
            let Ok(commit) = reference.peel_to_commit() else {
                continue;
            };
            let links = util::tree_gitlinks(&commit.tree()?)?;
            let urls = config::urls_at(repo, Some(commit.id()))?;
            for (name, sha) in links {
                let Some(url) = urls.get(&name) else { continue };
                let Some(path) = mapping.local_path(url) else {
                    continue;
                };
                roots.entry(path).or_default().insert(sha);
            }
        }
    }

    for (path, roots) in roots {
        let Ok(sub) = Repository::open_bare(&path) else {
            outcome
                .messages
                .push(format!("skipping unreachable sub repo {}", path.display()));
            continue;
        };

        // Everything reachable from a root (the roots included).
        let mut reachable: HashSet<Oid> = HashSet::new();
        let mut walk = sub.revwalk()?;
        for root in &roots {
            if sub.find_commit(*root).is_ok() {
                walk.push(*root)?;
            }
        }
        for oid in walk {
            reachable.insert(oid?);
        }

        let mut to_remove: Vec<String> = Vec::new();
        for reference in sub.references_glob(&format!("{SYNTHETIC_REF_PREFIX}*"))? {
            let reference = reference?;
            let Some(name) = reference.name().map(|n| n.to_string()) else {
                continue;
            };
            let Some(target) = reference.target() else {
                continue;
            };
            if reachable.contains(&target) && !roots.contains(&target) {
                to_remove.push(name);
            }
        }

        let key = path.display().to_string();
        if opts.dry_run {
            for name in &to_remove {
                outcome.messages.push(format!("Would remove {name}"));
            }
        } else {
            // Batch the deletions per sub repo.
            for name in &to_remove {
                let mut reference = sub.find_reference(name)?;
                reference.delete()?;
            }
            tracing::info!(repo = %key, count = to_remove.len(), "pruned synthetic refs");
        }
        if !to_remove.is_empty() {
            outcome.removed.insert(key, to_remove);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_url_through_base_root_and_suffix() {
        let path = sub_repo_local_path(
            Some("https://host/org"),
            Some("/srv/repos"),
            Some(".git"),
            "https://host/org/team/sub",
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("/srv/repos/team/sub.git"));
    }

    #[test]
    fn rejects_url_outside_base() {
        assert!(sub_repo_local_path(
            Some("https://host/org"),
            Some("/srv/repos"),
            None,
            "https://elsewhere/x",
        )
        .is_none());
    }

    #[test]
    fn requires_root_path() {
        assert!(sub_repo_local_path(None, None, None, "https://host/x").is_none());
    }
}
