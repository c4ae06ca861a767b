//! Compilation policy: decides when to JIT-compile a function
//!
//! Uses call counts and loop counts from profiling to determine
//! when a function is "hot enough" to warrant compilation.

use super::counters::FunctionProfile;

/// Configuration for when to trigger JIT compilation
#[derive(Debug, Clone)]
pub struct CompilationPolicy {
    /// Call count threshold before compiling (default: 1000)
    pub call_threshold: u32,
    /// Backward-jump threshold before compiling (default: 10_000)
    pub loop_threshold: u32,
    /// Maximum instruction count to compile (skip very large functions)
    pub max_function_size: usize,
}

impl CompilationPolicy {
    /// Create a policy with default thresholds
    pub fn new() -> Self {
        CompilationPolicy {
            call_threshold: 1000,
            loop_threshold: 10_000,
            max_function_size: 4096,
        }
    }

    /// Check if a function should be compiled based on its profile and instruction count
    pub fn should_compile(&self, profile: &FunctionProfile, code_size: usize) -> bool {
        // Already compiled, in progress, or known to fail
        if profile.is_jit_available() || profile.is_compiling() || profile.is_jit_failed() {
            return false;
        }

        if code_size > self.max_function_size {
            return false;
        }

        profile.calls() >= self.call_threshold || profile.loops() >= self.loop_threshold
    }
}

impl Default for CompilationPolicy {
    fn default() -> Self {
        Self::new()
    }
}
