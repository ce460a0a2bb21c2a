//! Declarative entity mapping: the mapping tree, its three-way partition by
//! evaluation class, and the batch evaluator that applies it.

pub mod evaluator;
pub mod models;
pub mod partition;
