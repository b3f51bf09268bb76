//! The client's local file cache.
//!
//! Keys are `/`-separated relative paths such as
//! `cookbooks/apache2/templates/default/apache2.conf.erb`.

use crate::error::{Error, Result};
use manifest::Digest;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Namespace holding synchronized cookbooks.
pub const COOKBOOK_NAMESPACE: &str = "cookbooks";

/// Key/blob store the cache synchronizer works against.
pub trait FileCache {
    /// Every key, sorted.
    fn list(&self) -> Result<Vec<String>>;

    fn has_key(&self, key: &str) -> Result<bool>;

    fn load(&self, key: &str) -> Result<Vec<u8>>;

    /// Insert or overwrite.
    fn store(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Digest of the cached bytes, `None` if the key is absent.
    fn checksum(&self, key: &str) -> Result<Option<Digest>> {
        if !self.has_key(key)? {
            return Ok(None);
        }
        Ok(Some(Digest::of_bytes(&self.load(key)?)))
    }
}

/// Cache key for one file of a cookbook.
pub fn cookbook_key(cookbook: &str, segment: &str, specificity: Option<&str>, name: &str) -> String {
    match specificity {
        Some(spec) => format!("{COOKBOOK_NAMESPACE}/{cookbook}/{segment}/{spec}/{name}"),
        None => format!("{COOKBOOK_NAMESPACE}/{cookbook}/{segment}/{name}"),
    }
}

/// The cookbook a cache key belongs to, if it lives in the cookbook namespace.
pub fn cookbook_of_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(COOKBOOK_NAMESPACE)?.strip_prefix('/')?;
    let (cookbook, _) = rest.split_once('/')?;
    Some(cookbook)
}

/// Cache backed by a directory tree.
pub struct FsFileCache {
    root: PathBuf,
}

impl FsFileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding synchronized cookbooks.
    pub fn cookbook_root(&self) -> PathBuf {
        self.root.join(COOKBOOK_NAMESPACE)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::config(format!("invalid cache key '{key}'")));
        }
        Ok(self.root.join(rel))
    }

    /// Remove empty directories left behind below `dir`, stopping at the root.
    fn prune_empty_parents(&self, mut dir: &Path) {
        while dir != self.root && dir.starts_with(&self.root) {
            if fs::remove_dir(dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
}

impl FileCache for FsFileCache {
    fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                Error::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                let key: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                keys.push(key.join("/"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| Error::io(path, e))
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        // Write beside the target and rename so readers never see a torn file.
        let partial = path.with_extension("pantry-partial");
        fs::write(&partial, bytes).map_err(|e| Error::io(&partial, e))?;
        fs::rename(&partial, &path).map_err(|e| Error::io(&path, e))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        if let Some(parent) = path.parent() {
            self.prune_empty_parents(parent);
        }
        Ok(())
    }

    fn checksum(&self, key: &str) -> Result<Option<Digest>> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Digest::of_file(&path)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// In-memory cache for synchronizer and run tests.
    #[derive(Default)]
    pub(crate) struct MemoryCache {
        pub(crate) files: RefCell<BTreeMap<String, Vec<u8>>>,
    }

    impl MemoryCache {
        pub(crate) fn with(entries: &[(&str, &str)]) -> Self {
            let cache = Self::default();
            for (key, content) in entries {
                cache
                    .files
                    .borrow_mut()
                    .insert((*key).to_string(), content.as_bytes().to_vec());
            }
            cache
        }

        pub(crate) fn get(&self, key: &str) -> Option<String> {
            self.files
                .borrow()
                .get(key)
                .map(|b| String::from_utf8_lossy(b).to_string())
        }
    }

    impl FileCache for MemoryCache {
        fn list(&self) -> Result<Vec<String>> {
            Ok(self.files.borrow().keys().cloned().collect())
        }

        fn has_key(&self, key: &str) -> Result<bool> {
            Ok(self.files.borrow().contains_key(key))
        }

        fn load(&self, key: &str) -> Result<Vec<u8>> {
            self.files
                .borrow()
                .get(key)
                .cloned()
                .ok_or_else(|| Error::io(key, std::io::ErrorKind::NotFound.into()))
        }

        fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
            self.files
                .borrow_mut()
                .insert(key.to_string(), bytes.to_vec());
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.files
                .borrow_mut()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| Error::io(key, std::io::ErrorKind::NotFound.into()))
        }
    }

    #[test]
    fn test_cookbook_keys() {
        assert_eq!(
            cookbook_key("apache2", "templates", Some("default"), "a.conf.erb"),
            "cookbooks/apache2/templates/default/a.conf.erb"
        );
        assert_eq!(
            cookbook_key("apache2", "recipes", None, "default.rb"),
            "cookbooks/apache2/recipes/default.rb"
        );
        assert_eq!(cookbook_of_key("cookbooks/apache2/recipes/default.rb"), Some("apache2"));
        assert_eq!(cookbook_of_key("cookbooks/apache2"), None);
        assert_eq!(cookbook_of_key("reports/run.json"), None);
    }

    #[test]
    fn test_fs_cache_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = FsFileCache::new(tmp.path());
        let key = "cookbooks/ntp/recipes/default.rb";

        assert_eq!(cache.checksum(key).unwrap(), None);
        cache.store(key, b"package 'ntp'").unwrap();
        cache.store("cookbooks/ntp/files/default/ntp.conf", b"server x").unwrap();

        assert!(cache.has_key(key).unwrap());
        assert_eq!(cache.load(key).unwrap(), b"package 'ntp'");
        assert_eq!(
            cache.checksum(key).unwrap(),
            Some(Digest::of_bytes(b"package 'ntp'"))
        );
        assert_eq!(
            cache.list().unwrap(),
            vec!["cookbooks/ntp/files/default/ntp.conf", key]
        );
    }

    #[test]
    fn test_fs_cache_delete_prunes_empty_dirs() {
        let tmp = TempDir::new().unwrap();
        let cache = FsFileCache::new(tmp.path());
        cache.store("cookbooks/ntp/recipes/default.rb", b"x").unwrap();

        cache.delete("cookbooks/ntp/recipes/default.rb").unwrap();
        assert!(!tmp.path().join("cookbooks").exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_fs_cache_rejects_escaping_keys() {
        let tmp = TempDir::new().unwrap();
        let cache = FsFileCache::new(tmp.path());
        assert!(cache.store("../outside", b"x").is_err());
        assert!(cache.store("/etc/passwd", b"x").is_err());
    }

    #[test]
    fn test_memory_cache_default_checksum() {
        let cache = MemoryCache::with(&[("a", "hello")]);
        assert_eq!(cache.checksum("a").unwrap(), Some(Digest::of_bytes(b"hello")));
        assert_eq!(cache.checksum("b").unwrap(), None);
    }
}
