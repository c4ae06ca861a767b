//! Code cache for JIT-compiled functions
//!
//! Stores compiled functions by function ID, with support for invalidation
//! and a budget on the total machine code size.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::bytecode::FunctionId;
use crate::jit::error::JitError;
use crate::jit::runtime::trampoline::CompiledFunction;

/// Entry in the code cache
pub struct CacheEntry {
    pub code: Arc<CompiledFunction>,
    /// Whether this entry has been invalidated
    pub invalidated: AtomicBool,
}

/// Thread-safe cache of compiled functions
pub struct CodeCache {
    entries: RwLock<FxHashMap<FunctionId, CacheEntry>>,
    /// Total machine code size of all cached functions
    total_code_size: AtomicUsize,
    max_size: usize,
}

impl CodeCache {
    /// Create a new code cache with a maximum size limit (in bytes)
    pub fn new(max_size: usize) -> Self {
        CodeCache {
            entries: RwLock::new(FxHashMap::default()),
            total_code_size: AtomicUsize::new(0),
            max_size,
        }
    }

    /// Insert compiled code for a function, replacing any previous entry.
    pub fn insert(&self, id: FunctionId, code: Arc<CompiledFunction>) -> Result<(), JitError> {
        let mut entries = self.entries.write();
        let replaced = entries.get(&id).map_or(0, |old| old.code.code_size());
        let current = self.total_code_size.load(Ordering::Relaxed) - replaced;
        if current + code.code_size() > self.max_size {
            return Err(JitError::CacheFull { size: current, limit: self.max_size });
        }

        self.total_code_size.store(current + code.code_size(), Ordering::Relaxed);
        entries.insert(id, CacheEntry { code, invalidated: AtomicBool::new(false) });
        Ok(())
    }

    /// Look up a compiled function.
    ///
    /// Returns None if the function isn't compiled or has been invalidated.
    pub fn get(&self, id: FunctionId) -> Option<Arc<CompiledFunction>> {
        let entries = self.entries.read();
        let entry = entries.get(&id)?;
        if entry.invalidated.load(Ordering::Acquire) {
            return None;
        }
        Some(Arc::clone(&entry.code))
    }

    pub fn invalidate(&self, id: FunctionId) {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(&id) {
            entry.invalidated.store(true, Ordering::Release);
        }
    }

    /// Check if a function has been compiled and is valid
    pub fn contains(&self, id: FunctionId) -> bool {
        let entries = self.entries.read();
        entries
            .get(&id)
            .map(|e| !e.invalidated.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Drop every entry, releasing their hold on the code runtime.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.total_code_size.store(0, Ordering::Relaxed);
    }

    pub fn total_size(&self) -> usize {
        self.total_code_size.load(Ordering::Relaxed)
    }

    /// Number of cached functions (including invalidated)
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}
