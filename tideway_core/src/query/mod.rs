//! Query-expression surface: static input classification plus the trait seam
//! to the external query-execution engine.

pub mod classify;
pub mod engine;
