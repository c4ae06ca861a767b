//! Profiling counters for hot function detection
//!
//! Atomic counters bumped on every script call and on backward jumps taken by
//! the interpreter; the engine reads them to decide when to compile.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Profiling counters for a single function
#[derive(Debug)]
pub struct FunctionProfile {
    /// Number of times this function has been called
    pub call_count: AtomicU32,
    /// Number of backward jumps taken while interpreting
    pub loop_count: AtomicU32,
    /// Whether compilation is currently in progress
    pub compiling: AtomicBool,
    /// Whether JIT-compiled code is available
    pub jit_available: AtomicBool,
    /// Whether compilation was attempted and failed
    pub jit_failed: AtomicBool,
}

impl FunctionProfile {
    /// Create a new profile with zero counters
    pub fn new() -> Self {
        FunctionProfile {
            call_count: AtomicU32::new(0),
            loop_count: AtomicU32::new(0),
            compiling: AtomicBool::new(false),
            jit_available: AtomicBool::new(false),
            jit_failed: AtomicBool::new(false),
        }
    }

    /// Record a function call, return new count
    pub fn record_call(&self) -> u32 {
        self.call_count.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// Record a loop iteration (backward jump), return new count
    pub fn record_loop(&self) -> u32 {
        self.loop_count.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn loops(&self) -> u32 {
        self.loop_count.load(Ordering::Relaxed)
    }

    /// Try to claim this function for compilation (CAS on `compiling` flag)
    /// Returns true if we successfully claimed it
    pub fn try_start_compile(&self) -> bool {
        self.compiling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Mark compilation as complete and JIT code as available
    pub fn finish_compile(&self) {
        self.jit_available.store(true, Ordering::Release);
        self.compiling.store(false, Ordering::Release);
    }

    /// Mark compilation as failed; the function stays interpreted
    pub fn fail_compile(&self) {
        self.jit_failed.store(true, Ordering::Release);
        self.compiling.store(false, Ordering::Release);
    }

    /// Check if JIT code is available
    pub fn is_jit_available(&self) -> bool {
        self.jit_available.load(Ordering::Acquire)
    }

    pub fn is_jit_failed(&self) -> bool {
        self.jit_failed.load(Ordering::Acquire)
    }

    pub fn is_compiling(&self) -> bool {
        self.compiling.load(Ordering::Acquire)
    }
}

impl Default for FunctionProfile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_profile_counters() {
        let profile = FunctionProfile::new();
        assert_eq!(profile.record_call(), 1);
        assert_eq!(profile.record_call(), 2);
        assert_eq!(profile.record_call(), 3);
        assert_eq!(profile.record_loop(), 1);
        assert_eq!(profile.record_loop(), 2);
        assert_eq!(profile.calls(), 3);
        assert_eq!(profile.loops(), 2);
    }

    #[test]
    fn test_compilation_lifecycle() {
        let profile = FunctionProfile::new();
        assert!(!profile.is_jit_available());

        // Claim for compilation
        assert!(profile.try_start_compile());
        // Can't claim again while compiling
        assert!(!profile.try_start_compile());

        profile.finish_compile();
        assert!(profile.is_jit_available());
        assert!(!profile.is_compiling());
    }

    #[test]
    fn test_failed_compilation() {
        let profile = FunctionProfile::new();
        assert!(profile.try_start_compile());
        profile.fail_compile();
        assert!(profile.is_jit_failed());
        assert!(!profile.is_jit_available());
        assert!(!profile.is_compiling());
    }
}
