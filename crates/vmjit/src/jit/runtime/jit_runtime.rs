//! Shared code-generation runtime
//!
//! One `JITModule` owns all executable memory. Every compiled function keeps
//! an `Arc` to the runtime that produced it; the runtime lives while any
//! compiled function or engine holds it and frees its memory on the last drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use cranelift_codegen::isa::{CallConv, OwnedTargetIsa};
use cranelift_jit::{JITBuilder, JITModule};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::jit::backend;
use crate::jit::engine::OptLevel;
use crate::jit::error::JitError;

static CURRENT: Lazy<Mutex<Weak<JitRuntime>>> = Lazy::new(|| Mutex::new(Weak::new()));
static LIVE: AtomicUsize = AtomicUsize::new(0);
static CREATED: AtomicUsize = AtomicUsize::new(0);

pub struct JitRuntime {
    module: Mutex<Option<JITModule>>,
    isa: OwnedTargetIsa,
    opt_level: OptLevel,
}

// The module is only touched under its mutex and the code it hands out is
// immutable once finalized.
unsafe impl Send for JitRuntime {}
unsafe impl Sync for JitRuntime {}

impl JitRuntime {
    /// The process-wide runtime, created on first use.
    ///
    /// `opt_level` applies only when a new runtime is created; a live
    /// runtime is shared as is.
    pub fn acquire(opt_level: OptLevel) -> Result<Arc<JitRuntime>, JitError> {
        let mut slot = CURRENT.lock();
        if let Some(runtime) = slot.upgrade() {
            return Ok(runtime);
        }

        let runtime = Arc::new(JitRuntime::new(opt_level)?);
        *slot = Arc::downgrade(&runtime);
        tracing::debug!(?opt_level, "created JIT runtime");
        Ok(runtime)
    }

    fn new(opt_level: OptLevel) -> Result<Self, JitError> {
        let isa = backend::host_isa(opt_level)?;
        let builder = JITBuilder::with_isa(isa.clone(), cranelift_module::default_libcall_names());
        let module = JITModule::new(builder);
        LIVE.fetch_add(1, Ordering::SeqCst);
        CREATED.fetch_add(1, Ordering::SeqCst);
        Ok(JitRuntime { module: Mutex::new(Some(module)), isa, opt_level })
    }

    pub fn isa(&self) -> &OwnedTargetIsa {
        &self.isa
    }

    pub fn call_conv(&self) -> CallConv {
        self.isa.default_call_conv()
    }

    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    /// Run `f` with exclusive access to the module.
    pub(crate) fn with_module<R>(&self, f: impl FnOnce(&mut JITModule) -> Result<R, JitError>) -> Result<R, JitError> {
        let mut guard = self.module.lock();
        let module = guard
            .as_mut()
            .ok_or_else(|| JitError::Module("runtime already released".to_string()))?;
        f(module)
    }

    /// Number of runtimes currently alive in this process
    pub fn live_count() -> usize {
        LIVE.load(Ordering::SeqCst)
    }

    /// Number of runtimes created over the life of this process
    pub fn created_count() -> usize {
        CREATED.load(Ordering::SeqCst)
    }
}

impl Drop for JitRuntime {
    fn drop(&mut self) {
        if let Some(module) = self.module.get_mut().take() {
            // No compiled function can outlive the runtime: each holds an Arc to it.
            unsafe { module.free_memory() };
        }
        LIVE.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("released JIT runtime");
    }
}
