//! Client cache synchronization.
//!
//! Reconciles the local [`FileCache`] against the manifests the depot says a
//! node needs:
//!
//! 1. Cookbooks no longer needed are removed from the cache entirely.
//! 2. Per cookbook, every file whose cached digest differs from the manifest
//!    is fetched and overwritten.
//! 3. Per cookbook, cached files the manifest no longer lists are removed.
//!
//! Any failed fetch aborts the whole sync as a network error. Files already
//! written by the failed pass stay written.

use crate::cache::{FileCache, cookbook_key, cookbook_of_key};
use crate::error::{Error, Result};
use manifest::{CookbookManifest, FileEntry};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Downloads file content by URL.
pub trait FileFetcher: Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// What a sync pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Keys written with new content
    pub updated: Vec<String>,
    /// Keys removed from the cache
    pub removed: Vec<String>,
    /// Keys already up to date
    pub unchanged: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Brings a [`FileCache`] in line with a set of cookbook manifests.
pub struct CacheSynchronizer<'a> {
    cache: &'a dyn FileCache,
    fetcher: &'a dyn FileFetcher,
    jobs: usize,
}

impl<'a> CacheSynchronizer<'a> {
    pub fn new(cache: &'a dyn FileCache, fetcher: &'a dyn FileFetcher) -> Self {
        Self {
            cache,
            fetcher,
            jobs: 1,
        }
    }

    /// Fetch up to `jobs` files of a cookbook in parallel.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Synchronize every cookbook the node needs, keyed by cookbook name.
    pub fn sync_all(&self, manifests: &BTreeMap<String, CookbookManifest>) -> Result<SyncReport> {
        log::debug!("Synchronizing {} cookbook(s)", manifests.len());
        let mut report = SyncReport::default();

        // Whole cookbooks first, so no per-file pass sees a half-pruned tree.
        for key in self.cache.list()? {
            if let Some(cookbook) = cookbook_of_key(&key)
                && !manifests.contains_key(cookbook)
            {
                log::info!("Removing {key} from the cache; its cookbook is no longer needed");
                self.cache.delete(&key)?;
                report.removed.push(key);
            }
        }

        for (name, manifest) in manifests {
            self.sync_cookbook(name, manifest, &mut report)?;
        }
        Ok(report)
    }

    /// Synchronize one cookbook's files: fetch what changed, then prune.
    pub fn sync_cookbook(&self, name: &str, manifest: &CookbookManifest, report: &mut SyncReport) -> Result<()> {
        log::debug!("Synchronizing cookbook {name}");

        let mut seen = BTreeSet::new();
        let mut stale: Vec<(String, &FileEntry)> = Vec::new();

        for (segment, entry) in manifest.entries() {
            let key = cookbook_key(name, segment.as_str(), entry.specificity.as_deref(), &entry.name);
            seen.insert(key.clone());

            if self.cache.checksum(&key)?.as_ref() == Some(&entry.checksum) {
                report.unchanged += 1;
            } else {
                stale.push((key, entry));
            }
        }

        for (key, bytes) in self.fetch_all(&stale)? {
            log::info!("Storing updated {key} in the cache");
            self.cache.store(&key, &bytes)?;
            report.updated.push(key);
        }

        for key in self.cache.list()? {
            if cookbook_of_key(&key) == Some(name) && !seen.contains(&key) {
                log::info!("Removing {key} from the cache; it is no longer on the server");
                self.cache.delete(&key)?;
                report.removed.push(key);
            }
        }
        Ok(())
    }

    fn fetch_all(&self, stale: &[(String, &FileEntry)]) -> Result<Vec<(String, Vec<u8>)>> {
        let fetcher = self.fetcher;

        if self.jobs <= 1 || stale.len() <= 1 {
            return stale
                .iter()
                .map(|(key, entry)| fetch_one(fetcher, key, entry))
                .collect();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| Error::config(format!("cannot start fetch pool: {e}")))?;
        pool.install(|| {
            stale
                .par_iter()
                .map(|(key, entry)| fetch_one(fetcher, key, entry))
                .collect()
        })
    }
}

fn fetch_one(fetcher: &dyn FileFetcher, key: &str, entry: &FileEntry) -> Result<(String, Vec<u8>)> {
    let url = entry
        .url
        .as_deref()
        .ok_or_else(|| Error::network(key, "manifest entry has no download URL"))?;
    let bytes = fetcher.fetch(url).map_err(|e| e.into_network(url))?;
    Ok((key.to_string(), bytes))
}
