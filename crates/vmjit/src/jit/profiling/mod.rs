//! Profiling infrastructure for hot function detection

pub mod counters;
pub mod policy;

pub use counters::FunctionProfile;
pub use policy::CompilationPolicy;
