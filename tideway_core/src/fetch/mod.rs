//! Paginated-fetch plumbing: the batch stream abstraction, the retry
//! harness that re-drives a producer under a time budget, and rate limiting.

pub mod rate_limit;
pub mod retry;

use crate::Result;
use futures_util::Stream;
use std::pin::Pin;

/// One page of raw items from a paginated fetch.
pub type Batch = Vec<serde_json::Value>;

/// Ordered stream of batches, forwarded in producer order.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<Batch>> + Send + 'static>>;
