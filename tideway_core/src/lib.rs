//! Tideway core library: the shared primitives every connector depends on.
//!
//! Connectors pull raw JSON documents from third-party APIs, map each one
//! into a normalized entity via a declarative query-language mapping, and
//! publish the result. The connectors themselves are boilerplate and live
//! elsewhere; this crate holds the parts they all share:
//!
//! - classification of query expressions by how much input they consume
//!   (`query::classify`), so constant expressions are never re-evaluated
//!   per item
//! - the mapping tree, its three-way partition, and the batch evaluator
//!   (`mapping`)
//! - execution-scoped memoization of idempotent fetches (`cache`)
//! - the retrying, rate-limited pagination harness (`fetch`)

pub mod cache;
pub mod error;
pub mod fetch;
pub mod mapping;
pub mod query;

pub use cache::{cache_key, cached, cached_stream, CacheProvider, ExecutionScope};
pub use error::{Error, Result};
pub use fetch::rate_limit::{RateLimiter, RateLimiterRegistry};
pub use fetch::retry::{retry_paginated, ErrorCallback, RetryConfig};
pub use fetch::{Batch, BatchStream};
pub use mapping::evaluator::EntityEvaluator;
pub use mapping::models::{
    CalculationResult, Combinator, Entity, FilterCondition, FilterNode, FilterRule, MappingLeaf,
    ResourceMapping,
};
pub use mapping::partition::{partition, PartitionedMapping};
pub use query::classify::{classify, EvaluationClass};
pub use query::engine::QueryEngine;
