//! Lazy per-commit URL resolution and pinned-sha fetching for subs.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

use git2::{Oid, Repository};

use crate::{
    cli::GitCli,
    config,
    error::{MetaError, Result},
};

enum OriginCache {
    Unread,
    Missing,
    Url(String),
}

/// Caches are behind mutexes so one fetcher can serve a whole fan-out; they
/// are read-mostly after first touch.
pub struct SubmoduleFetcher {
    meta_path: PathBuf,
    commit: Option<Oid>,
    origin: Mutex<OriginCache>,
    urls: Mutex<Option<BTreeMap<String, String>>>,
    fetched: Mutex<HashSet<(String, String)>>,
    cli: GitCli,
}

impl SubmoduleFetcher {
    /// `commit` pins which `.gitmodules` defines the url map; `None` falls
    /// back to the working tree copy.
    pub fn new(meta: &Repository, commit: Option<Oid>) -> Self {
        Self {
            meta_path: meta.path().to_path_buf(),
            commit,
            origin: Mutex::new(OriginCache::Unread),
            urls: Mutex::new(None),
            fetched: Mutex::new(HashSet::new()),
            cli: GitCli::new(),
        }
    }

    fn meta(&self) -> Result<Repository> {
        Ok(Repository::open(&self.meta_path)?)
    }

    /// Url of the meta repo's `origin` remote; read once, cached, and `None`
    /// when no origin exists (only `origin` is ever consulted).
    pub fn meta_origin_url(&self) -> Result<Option<String>> {
        let mut cache = self.origin.lock().expect("origin cache poisoned");
        if let OriginCache::Unread = *cache {
            let meta = self.meta()?;
            *cache = match meta.find_remote("origin") {
                Ok(remote) => match remote.url() {
                    Some(url) => OriginCache::Url(url.to_string()),
                    None => OriginCache::Missing,
                },
                Err(_) => OriginCache::Missing,
            };
        }
        Ok(match &*cache {
            OriginCache::Url(url) => Some(url.clone()),
            _ => None,
        })
    }

    /// The raw (possibly relative) url recorded for `name`.
    pub fn submodule_url(&self, name: &str) -> Result<String> {
        let mut cache = self.urls.lock().expect("url cache poisoned");
        if cache.is_none() {
            *cache = Some(config::urls_at(&self.meta()?, self.commit)?);
        }
        cache
            .as_ref()
            .expect("just populated")
            .get(name)
            .cloned()
            .ok_or_else(|| MetaError::NoSubmoduleUrl(name.to_string()))
    }

    /// The fetch url for `name`, with relative urls resolved against origin.
    pub fn resolved_url(&self, name: &str) -> Result<String> {
        let raw = self.submodule_url(name)?;
        let origin = self.meta_origin_url()?;
        config::resolve_url(origin.as_deref(), &raw)
    }

    /// Make `sha` available in the sub repository at `sub_path`, fetching
    /// from the sub's url only when the object is not already present.
    /// Completed `(url, sha)` pairs are remembered so repeated requests from
    /// a fan-out hit the cache instead of the network.
    pub fn fetch_sha(&self, sub_path: &Path, name: &str, sha: Oid) -> Result<()> {
        let sub = Repository::open(sub_path)?;
        if sub.odb()?.exists(sha) {
            return Ok(());
        }
        let url = self.resolved_url(name)?;
        let key = (url.clone(), sha.to_string());
        if self.fetched.lock().expect("fetch cache poisoned").contains(&key) {
            return Ok(());
        }
        tracing::debug!(name, %sha, url, "fetching submodule commit");
        self.cli
            .fetch_sha(sub_path, &url, &sha.to_string())
            .map_err(|e| MetaError::FetchFailed {
                name: name.to_string(),
                sha: sha.to_string(),
                message: e.to_string(),
            })?;
        if !sub.odb()?.exists(sha) {
            return Err(MetaError::FetchFailed {
                name: name.to_string(),
                sha: sha.to_string(),
                message: "fetch completed but the commit is still absent".to_string(),
            });
        }
        self.fetched.lock().expect("fetch cache poisoned").insert(key);
        Ok(())
    }
}
