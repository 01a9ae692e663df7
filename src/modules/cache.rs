//! Module cache keyed by resolved path, spec §4.7 step 5. Grounded on the
//! teacher's `module_map.rs` dual-indexed registry, simplified to the one
//! index this crate actually needs since there's no separate V8 `ModuleId`
//! layer here — modules are evaluated as wrapped CommonJS functions, not
//! native ES module records (see `mod.rs`).

use dashmap::DashMap;

use crate::convert::TransferredValue;

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub resolved_path: String,
    pub exports: TransferredValue,
}

#[derive(Default)]
pub struct ModuleCache {
    by_path: DashMap<String, ModuleRecord>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resolved_path: &str) -> Option<ModuleRecord> {
        let hit = self.by_path.get(resolved_path).map(|r| r.clone());
        if hit.is_some() {
            crate::metrics::MODULE_CACHE_HITS_TOTAL.inc();
        } else {
            crate::metrics::MODULE_CACHE_MISSES_TOTAL.inc();
        }
        hit
    }

    pub fn insert(&self, record: ModuleRecord) {
        self.by_path.insert(record.resolved_path.clone(), record);
    }

    pub fn clear(&self) {
        self.by_path.clear();
    }
}
