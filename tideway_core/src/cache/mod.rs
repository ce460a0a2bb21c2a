//! Memoization of idempotent fetch results within one sync run.
//!
//! The cache is a pure optimization, never a correctness dependency: provider
//! read and write failures are logged and swallowed, and the computation
//! always proceeds without them.

use crate::fetch::BatchStream;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const KEY_HASH_LEN: usize = 16;

/// Longer-lived key/value store backing the in-scope cache, for cross-process
/// sharing. Externally synchronized; writes are idempotent, so concurrent
/// callers writing the same freshly computed value are harmless.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// The active execution: one sync run. Entries live in `attributes` for the
/// scope's lifetime and are reclaimed by dropping the scope, never by
/// explicit eviction.
#[derive(Default)]
pub struct ExecutionScope {
    attributes: DashMap<String, Value>,
    provider: Option<Arc<dyn CacheProvider>>,
}

impl ExecutionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(provider: Arc<dyn CacheProvider>) -> Self {
        Self {
            attributes: DashMap::new(),
            provider: Some(provider),
        }
    }

    /// Drop every in-scope entry, simulating scope teardown without
    /// reconstructing the scope. The backing provider is untouched.
    pub fn clear(&self) {
        self.attributes.clear();
    }

    async fn read(&self, key: &str) -> Option<Value> {
        if let Some(hit) = self.attributes.get(key) {
            return Some(hit.clone());
        }
        let provider = self.provider.as_ref()?;
        match provider.get(key).await {
            Ok(Some(value)) => {
                self.attributes.insert(key.to_string(), value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache provider read failed; recomputing");
                None
            }
        }
    }

    async fn write(&self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value.clone());
        if let Some(provider) = &self.provider {
            if let Err(err) = provider.set(key, value).await {
                tracing::warn!(key, error = %err, "cache provider write failed; result kept in scope only");
            }
        }
    }
}

/// Deterministic, backend-safe cache key: the function identity with
/// non-alphanumeric characters normalized, plus a short fixed-length hash of
/// the serialized arguments. Identical logical calls always collide; distinct
/// calls practically never do.
pub fn cache_key(fn_id: &str, args: &[Value]) -> String {
    let ident: String = fn_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let serialized = serde_json::to_string(args).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    let mut hash = String::with_capacity(KEY_HASH_LEN);
    for byte in digest.iter() {
        if hash.len() >= KEY_HASH_LEN {
            break;
        }
        hash.push_str(&format!("{byte:02x}"));
    }
    format!("{ident}:{hash}")
}

/// Memoize one coroutine-form call within `scope`.
///
/// A hit short-circuits `f`; a miss computes, then best-effort writes. The
/// returned value is never affected by cache I/O failures.
#[tracing::instrument(level = "debug", skip(scope, args, f))]
pub async fn cached<T, F, Fut>(
    scope: &ExecutionScope,
    fn_id: &str,
    args: &[Value],
    f: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let key = cache_key(fn_id, args);
    if let Some(hit) = scope.read(&key).await {
        match serde_json::from_value(hit) {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(key, error = %err, "cached value failed to deserialize; recomputing");
            }
        }
    }

    let result = f().await?;
    match serde_json::to_value(&result) {
        Ok(value) => scope.write(&key, value).await,
        Err(err) => {
            tracing::warn!(key, error = %err, "result not serializable; skipping cache write");
        }
    }
    Ok(result)
}

/// Memoize one async-stream call within `scope`.
///
/// A hit replays the cached batches. A miss forwards every batch to the
/// caller as it is produced while accumulating the full list, and writes it
/// only after the stream is cleanly exhausted: an abandoned or erroring
/// stream caches nothing, since the entry would be incomplete.
#[tracing::instrument(level = "debug", skip(scope, args, producer))]
pub fn cached_stream<P>(
    scope: Arc<ExecutionScope>,
    fn_id: &str,
    args: &[Value],
    producer: P,
) -> BatchStream
where
    P: FnOnce() -> BatchStream + Send + 'static,
{
    let key = cache_key(fn_id, args);
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        if let Some(hit) = scope.read(&key).await {
            match serde_json::from_value::<Vec<Vec<Value>>>(hit) {
                Ok(batches) => {
                    for batch in batches {
                        if tx.send(Ok(batch)).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "cached batches failed to deserialize; refetching");
                }
            }
        }

        let mut stream = producer();
        let mut collected: Vec<Vec<Value>> = Vec::new();
        while let Some(next) = stream.next().await {
            match next {
                Ok(batch) => {
                    collected.push(batch.clone());
                    if tx.send(Ok(batch)).await.is_err() {
                        // Consumer stopped iterating: results already issued
                        // are discarded, not cached.
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }

        match serde_json::to_value(&collected) {
            Ok(value) => scope.write(&key, value).await,
            Err(err) => {
                tracing::warn!(key, error = %err, "batches not serializable; skipping cache write");
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::ReceiverStream as TestReceiverStream;

    struct InMemoryProvider {
        entries: DashMap<String, Value>,
    }

    impl InMemoryProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: DashMap::new(),
            })
        }
    }

    #[async_trait]
    impl CacheProvider for InMemoryProvider {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            Ok(self.entries.get(key).map(|v| v.clone()))
        }

        async fn set(&self, key: &str, value: Value) -> Result<()> {
            self.entries.insert(key.to_string(), value);
            Ok(())
        }
    }

    /// Provider whose every call fails with a wrapped source error; the
    /// cache must degrade to a no-op.
    struct BrokenProvider;

    fn connection_reset() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer")
    }

    #[async_trait]
    impl CacheProvider for BrokenProvider {
        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            Err(Error::backend("cache read", connection_reset()))
        }

        async fn set(&self, _key: &str, _value: Value) -> Result<()> {
            Err(Error::backend("cache write", connection_reset()))
        }
    }

    fn batch_stream(batches: Vec<Vec<Value>>) -> BatchStream {
        Box::pin(futures_util::stream::iter(
            batches.into_iter().map(Ok).collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn cache_key_is_stable_and_argument_sensitive() {
        let a = cache_key("client.fetch_projects", &[json!("us-east"), json!(10)]);
        let b = cache_key("client.fetch_projects", &[json!("us-east"), json!(10)]);
        let c = cache_key("client.fetch_projects", &[json!("eu-west"), json!(10)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Normalized identity, no backend-hostile characters.
        assert!(a.starts_with("client_fetch_projects:"));
        assert_eq!(a.split(':').nth(1).unwrap().len(), 16);
    }

    #[tokio::test]
    async fn cached_invokes_the_function_exactly_once_per_scope() {
        let scope = ExecutionScope::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u64 = cached(&scope, "compute", &[json!(7)], || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(41 + 1)
            })
            .await
            .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Scope teardown invalidates: the next call recomputes.
        scope.clear();
        let _: u64 = cached(&scope, "compute", &[json!(7)], || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_arguments_miss_each_other() {
        let scope = ExecutionScope::new();
        let calls = AtomicUsize::new(0);

        for region in ["us", "eu", "us"] {
            let _: String = cached(&scope, "fetch", &[json!(region)], || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(region.to_string())
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provider_failures_never_block_the_computation() {
        let scope = ExecutionScope::with_provider(Arc::new(BrokenProvider));
        let value: u64 = cached(&scope, "compute", &[], || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn backend_errors_preserve_their_source_chain() {
        let err = BrokenProvider.get("any-key").await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        let source = std::error::Error::source(&err).expect("source must be preserved");
        assert!(source.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn provider_hits_survive_a_fresh_scope() {
        let provider = InMemoryProvider::new();
        let scope = ExecutionScope::with_provider(provider.clone());
        let _: u64 = cached(&scope, "compute", &[], || async { Ok(9) })
            .await
            .unwrap();

        // A new scope over the same provider reads the persisted value.
        let scope2 = ExecutionScope::with_provider(provider);
        let value: u64 = cached(&scope2, "compute", &[], || async {
            panic!("must be served from the provider")
        })
        .await
        .unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn stream_round_trip_replays_without_reinvoking() {
        let scope = Arc::new(ExecutionScope::new());
        let produced = Arc::new(AtomicUsize::new(0));
        let batches = vec![
            vec![json!({"id": 1})],
            vec![json!({"id": 2})],
            vec![json!({"id": 3})],
        ];

        for round in 0..2 {
            let produced = produced.clone();
            let batches = batches.clone();
            let stream = cached_stream(scope.clone(), "resync", &[], move || {
                produced.fetch_add(1, Ordering::SeqCst);
                batch_stream(batches)
            });
            let collected: Vec<Vec<Value>> = stream
                .map(|b| b.unwrap())
                .collect()
                .await;
            assert_eq!(collected, batches_expected(), "round {round}");
        }
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }

    fn batches_expected() -> Vec<Vec<Value>> {
        vec![
            vec![json!({"id": 1})],
            vec![json!({"id": 2})],
            vec![json!({"id": 3})],
        ]
    }

    #[tokio::test]
    async fn abandoned_stream_caches_nothing() {
        let scope = Arc::new(ExecutionScope::new());
        let produced = Arc::new(AtomicUsize::new(0));

        // Producer that hands batches only as the consumer pulls, so dropping
        // the consumer abandons it mid-flight.
        let make_producer = |produced: Arc<AtomicUsize>| {
            move || -> BatchStream {
                produced.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    for i in 0..3 {
                        if tx.send(Ok(vec![json!({ "id": i })])).await.is_err() {
                            return;
                        }
                    }
                });
                Box::pin(TestReceiverStream::new(rx))
            }
        };

        {
            let mut stream =
                cached_stream(scope.clone(), "resync", &[], make_producer(produced.clone()));
            // Take one batch, then abandon.
            let first = stream.next().await.unwrap().unwrap();
            assert_eq!(first, vec![json!({ "id": 0 })]);
        }

        // Nothing was cached: the next consumption re-invokes the producer.
        let stream = cached_stream(scope, "resync", &[], make_producer(produced.clone()));
        let collected: Vec<Vec<Value>> = stream.map(|b| b.unwrap()).collect().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn erroring_stream_caches_nothing() {
        let scope = Arc::new(ExecutionScope::new());
        let produced = Arc::new(AtomicUsize::new(0));

        let failing = {
            let produced = produced.clone();
            move || -> BatchStream {
                produced.fetch_add(1, Ordering::SeqCst);
                Box::pin(futures_util::stream::iter(vec![
                    Ok(vec![json!({ "id": 1 })]),
                    Err(Error::BackendMessage("boom".to_string())),
                ]))
            }
        };

        let stream = cached_stream(scope.clone(), "resync", &[], failing.clone());
        let results: Vec<Result<Vec<Value>>> = stream.collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());

        let stream = cached_stream(scope, "resync", &[], failing);
        let _: Vec<Result<Vec<Value>>> = stream.collect().await;
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }
}
