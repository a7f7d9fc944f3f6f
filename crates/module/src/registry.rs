use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledModule {
    pub module_name: String,
    pub source_path: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub digest: String,
    pub skills_provided: BTreeSet<String>,
}

/// Modules installed during this process's lifetime.  Nothing is persisted.
///
/// Shared between installers behind an `Arc`; every mutation takes the lock,
/// readers get a cloned snapshot.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    records: Mutex<HashMap<String, InstalledModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert; a reinstall replaces the previous record.
    pub fn record(&self, module: InstalledModule) -> Option<InstalledModule> {
        self.lock().insert(module.module_name.clone(), module)
    }

    pub fn get(&self, module_name: &str) -> Option<InstalledModule> {
        self.lock().get(module_name).cloned()
    }

    pub fn contains(&self, module_name: &str) -> bool {
        self.lock().contains_key(module_name)
    }

    /// Snapshot of every record, ordered by module name.
    pub fn list(&self) -> BTreeMap<String, InstalledModule> {
        self.lock()
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    // A panic while holding the lock cannot leave a half-written record: every
    // critical section is a single map operation.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, InstalledModule>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(name: &str, path: &str) -> InstalledModule {
        InstalledModule {
            module_name: name.to_string(),
            source_path: PathBuf::from(path),
            installed_at: Utc::now(),
            digest: "00".repeat(32),
            skills_provided: BTreeSet::new(),
        }
    }

    #[test]
    fn empty_registry() {
        let registry = ModuleRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn last_install_wins() {
        let registry = ModuleRegistry::new();
        assert!(registry.record(record("alpha", "/a/1.mkm")).is_none());
        let previous = registry.record(record("alpha", "/a/2.mkm")).unwrap();
        assert_eq!(previous.source_path, PathBuf::from("/a/1.mkm"));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("alpha").unwrap().source_path,
            PathBuf::from("/a/2.mkm")
        );
    }

    #[test]
    fn list_is_sorted_snapshot() {
        let registry = ModuleRegistry::new();
        registry.record(record("zeta", "/z.mkm"));
        registry.record(record("alpha", "/a.mkm"));
        let snapshot = registry.list();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), ["alpha", "zeta"]);

        registry.clear();
        assert_eq!(snapshot.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_records_all_land() {
        let registry = Arc::new(ModuleRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.record(record(&format!("m{i}"), "/x.mkm"));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
        assert!(registry.contains("m7"));
    }
}
