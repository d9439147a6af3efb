use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::database::{RecordStore, RecordStoreExt, SOURCES};
use crate::error::SourceError;

// The whole list is one record so default changes land in a single write.
const LIST_KEY: &str = "list";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSource {
    pub name: String,
    /// Mirror site root, e.g. `https://mirrors.example.com`.
    pub url: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Package mirrors known to the operator. At most one is the default.
pub struct PackageSources {
    store: Arc<dyn RecordStore>,
    sources: Mutex<Vec<PackageSource>>,
}

impl PackageSources {
    pub fn open(store: Arc<dyn RecordStore>) -> anyhow::Result<Self> {
        let sources: Vec<PackageSource> = store.get_as(SOURCES, LIST_KEY)?.unwrap_or_default();
        Ok(Self {
            store,
            sources: Mutex::new(sources),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PackageSource>> {
        match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn list(&self) -> Vec<PackageSource> {
        self.lock().clone()
    }

    /// Append a source and return its index.
    pub fn add(&self, name: &str, url: &str) -> Result<usize, SourceError> {
        let url = url.trim().trim_end_matches('/');
        if name.trim().is_empty() {
            return Err(SourceError::Invalid("name is required".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SourceError::Invalid(format!("'{url}' is not an http(s) URL")));
        }

        let mut sources = self.lock();
        let mut next = sources.clone();
        next.push(PackageSource {
            name: name.trim().to_string(),
            url: url.to_string(),
            is_default: false,
        });
        self.commit(&mut sources, next)?;
        Ok(sources.len() - 1)
    }

    pub fn remove(&self, index: usize) -> Result<PackageSource, SourceError> {
        let mut sources = self.lock();
        if index >= sources.len() {
            return Err(SourceError::IndexOutOfRange(index));
        }
        let mut next = sources.clone();
        let removed = next.remove(index);
        self.commit(&mut sources, next)?;
        Ok(removed)
    }

    /// Make `index` the only default.
    pub fn set_default(&self, index: usize) -> Result<(), SourceError> {
        let mut sources = self.lock();
        if index >= sources.len() {
            return Err(SourceError::IndexOutOfRange(index));
        }
        let next = sources
            .iter()
            .enumerate()
            .map(|(i, s)| PackageSource {
                is_default: i == index,
                ..s.clone()
            })
            .collect();
        self.commit(&mut sources, next)
    }

    pub fn default_url(&self) -> Option<String> {
        self.lock()
            .iter()
            .find(|s| s.is_default)
            .map(|s| s.url.clone())
    }

    // Persist first; memory only changes if the write succeeded.
    fn commit(
        &self,
        current: &mut Vec<PackageSource>,
        next: Vec<PackageSource>,
    ) -> Result<(), SourceError> {
        self.store.put_as(SOURCES, LIST_KEY, &next)?;
        *current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;

    #[test]
    fn set_default_leaves_exactly_one_default() {
        let sources = PackageSources::open(Arc::new(MemoryStore::new())).unwrap();
        sources.add("official", "https://download.example.org").unwrap();
        sources.add("mirror-a", "https://mirror-a.example.com/").unwrap();
        sources.add("mirror-b", "https://mirror-b.example.com").unwrap();

        sources.set_default(1).unwrap();
        sources.set_default(2).unwrap();

        let defaults: Vec<_> = sources.list().into_iter().filter(|s| s.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "mirror-b");
        assert_eq!(sources.default_url().as_deref(), Some("https://mirror-b.example.com"));
    }

    #[test]
    fn bad_index_changes_nothing() {
        let sources = PackageSources::open(Arc::new(MemoryStore::new())).unwrap();
        sources.add("mirror", "https://mirror.example.com").unwrap();
        sources.set_default(0).unwrap();
        assert!(matches!(sources.set_default(5), Err(SourceError::IndexOutOfRange(5))));
        assert_eq!(sources.default_url().as_deref(), Some("https://mirror.example.com"));
    }

    #[test]
    fn sources_persist() {
        let store = Arc::new(MemoryStore::new());
        {
            let sources = PackageSources::open(store.clone()).unwrap();
            sources.add("mirror", "https://mirror.example.com").unwrap();
            sources.set_default(0).unwrap();
        }
        let reopened = PackageSources::open(store).unwrap();
        assert_eq!(reopened.default_url().as_deref(), Some("https://mirror.example.com"));
    }

    #[test]
    fn rejects_non_http_urls() {
        let sources = PackageSources::open(Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            sources.add("ftp", "ftp://mirror.example.com"),
            Err(SourceError::Invalid(_))
        ));
        let removed = sources.add("ok", "https://ok.example.com").unwrap();
        assert_eq!(sources.remove(removed).unwrap().name, "ok");
        assert!(sources.list().is_empty());
    }
}
