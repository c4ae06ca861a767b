//! Top-level JIT engine: hot-function policy, code cache and dispatch.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::bytecode::ScriptFunction;
use crate::jit::error::JitError;
use crate::jit::profiling::CompilationPolicy;
use crate::jit::runtime::{CodeCache, CompiledFunction, JitRuntime};
use crate::vm::call::{self, ScriptDispatch};
use crate::vm::exception::{JitExceptionInfo, ScriptException};
use crate::vm::function::VmFunction;
use crate::vm::value::{ReturnBuffer, VmValue};

/// Cranelift optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Value of Cranelift's `opt_level` setting.
    pub fn as_str(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Configuration for the JIT engine
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Compile at all; when false every call is interpreted (default: true)
    pub enabled: bool,
    /// Calls before a function is compiled (default: 1000)
    pub call_threshold: u32,
    /// Backward jumps before a function is compiled (default: 10_000)
    pub loop_threshold: u32,
    /// Largest function, in instructions, the engine compiles (default: 4096)
    pub max_function_size: usize,
    /// Machine code budget of the cache in bytes (default: 64 MiB)
    pub max_code_size: usize,
    /// Cranelift optimization level of a newly created runtime (default: speed)
    pub opt_level: OptLevel,
    /// Keep per-instruction annotations with compiled code (default: false)
    pub capture_listing: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            enabled: true,
            call_threshold: 1000,
            loop_threshold: 10_000,
            max_function_size: 4096,
            max_code_size: 64 * 1024 * 1024,
            opt_level: OptLevel::Speed,
            capture_listing: false,
        }
    }
}

struct EngineShared {
    config: JitConfig,
    policy: CompilationPolicy,
    cache: CodeCache,
    runtime: OnceCell<Arc<JitRuntime>>,
}

impl EngineShared {
    fn runtime(&self) -> Result<&Arc<JitRuntime>, JitError> {
        self.runtime.get_or_try_init(|| JitRuntime::acquire(self.config.opt_level))
    }

    fn compile(&self, func: &Arc<ScriptFunction>) -> Result<Arc<CompiledFunction>, JitError> {
        if !self.config.enabled {
            return Err(JitError::Disabled);
        }
        if let Some(code) = self.cache.get(func.id()) {
            return Ok(code);
        }
        let runtime = self.runtime()?;
        let code = Arc::new(super::compile_function(runtime, func, self.config.capture_listing)?);
        if let Err(e) = self.cache.insert(func.id(), code.clone()) {
            tracing::warn!(function = %func.name(), error = %e, "compiled code not cached");
            return Err(e);
        }
        Ok(code)
    }
}

impl ScriptDispatch for EngineShared {
    fn compiled(&self, func: &Arc<ScriptFunction>) -> Option<Arc<CompiledFunction>> {
        if !self.config.enabled {
            return None;
        }
        if let Some(code) = self.cache.get(func.id()) {
            return Some(code);
        }
        let profile = func.profile();
        if !self.policy.should_compile(profile, func.code().len()) || !profile.try_start_compile() {
            return None;
        }
        match self.compile(func) {
            Ok(code) => {
                profile.finish_compile();
                Some(code)
            }
            Err(error) => {
                tracing::warn!(function = %func.name(), %error, "JIT compilation failed, interpreting");
                profile.fail_compile();
                None
            }
        }
    }
}

/// Top-level JIT engine managing compilation and caching
///
/// Cloning is cheap; clones share the cache and the runtime.
#[derive(Clone)]
pub struct JitEngine {
    shared: Arc<EngineShared>,
}

impl JitEngine {
    /// Create a new JIT engine with default configuration
    pub fn new() -> Self {
        Self::with_config(JitConfig::default())
    }

    /// Create a new JIT engine with custom configuration
    ///
    /// The code runtime is acquired lazily on the first compilation.
    pub fn with_config(config: JitConfig) -> Self {
        let policy = CompilationPolicy {
            call_threshold: config.call_threshold,
            loop_threshold: config.loop_threshold,
            max_function_size: config.max_function_size,
        };
        let cache = CodeCache::new(config.max_code_size);
        JitEngine {
            shared: Arc::new(EngineShared { config, policy, cache, runtime: OnceCell::new() }),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.shared.config
    }

    /// Compile `func` now, regardless of how hot it is.
    pub fn compile(&self, func: &Arc<ScriptFunction>) -> Result<Arc<CompiledFunction>, JitError> {
        let profile = func.profile();
        match self.shared.compile(func) {
            Ok(code) => {
                profile.jit_available.store(true, Ordering::Release);
                Ok(code)
            }
            Err(e) => {
                if !matches!(e, JitError::Disabled) {
                    profile.jit_failed.store(true, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    /// Call a script function through the engine: compiled once hot,
    /// interpreted otherwise. Nested calls are dispatched the same way.
    pub fn call(
        &self,
        func: &Arc<ScriptFunction>,
        args: &[VmValue],
        rets: &mut ReturnBuffer,
    ) -> Result<usize, ScriptException> {
        let _dispatch = call::install_dispatch(self.shared.clone());
        let mut exc = JitExceptionInfo::new();
        let count = call::invoke_script(func, args, rets.slots_mut(), &mut exc);
        match exc.take() {
            Some(exception) => Err(exception),
            None => Ok(count as usize),
        }
    }

    /// Call any function object through the engine.
    pub fn call_function(
        &self,
        func: &VmFunction,
        args: &[VmValue],
        rets: &mut ReturnBuffer,
    ) -> Result<usize, ScriptException> {
        let _dispatch = call::install_dispatch(self.shared.clone());
        call::call(func, args, rets)
    }

    pub fn is_compiled(&self, func: &ScriptFunction) -> bool {
        self.shared.cache.contains(func.id())
    }

    /// Drop the cached code for `func`; it may be compiled again once hot.
    pub fn invalidate(&self, func: &ScriptFunction) {
        self.shared.cache.invalidate(func.id());
        let profile = func.profile();
        profile.jit_available.store(false, Ordering::Release);
        profile.jit_failed.store(false, Ordering::Release);
    }

    pub fn cache(&self) -> &CodeCache {
        &self.shared.cache
    }

    /// The runtime owning this engine's code memory, once acquired.
    pub fn runtime(&self) -> Option<&Arc<JitRuntime>> {
        self.shared.runtime.get()
    }
}

impl Default for JitEngine {
    fn default() -> Self {
        Self::new()
    }
}
