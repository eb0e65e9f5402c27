//! Optimistic snapshot/apply/commit-or-rollback protocol for list mutations.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use crate::cache::{CacheKey, QueryCache, ReadOutcome};
use crate::http::temporary_id;
use crate::types::value_to_id;
use crate::AgoraError;

#[async_trait]
/// Trait contract for reloading one cached collection from the server.
pub trait CollectionSource: Send + Sync {
    async fn fetch_collection(&self, key: &CacheKey) -> Result<Vec<Value>, AgoraError>;
}

/// Reads `key` through the cache's generation check.
pub async fn refresh_collection(
    cache: &QueryCache,
    source: &dyn CollectionSource,
    key: &CacheKey,
) -> Result<ReadOutcome, AgoraError> {
    let ticket = cache.begin_read(key);
    let data = source.fetch_collection(key).await?;
    Ok(cache.complete_read(ticket, data))
}

#[derive(Debug, Clone, PartialEq)]
/// Local change installed before the server confirms a mutation.
pub enum OptimisticChange {
    Prepend(Value),
    Remove { id_field: &'static str, id: String },
    /// Replace the entry with a matching id, or prepend when absent.
    Upsert {
        id_field: &'static str,
        id: String,
        value: Value,
    },
}

impl OptimisticChange {
    pub fn apply_to(&self, mut collection: Vec<Value>) -> Vec<Value> {
        match self {
            OptimisticChange::Prepend(value) => {
                collection.insert(0, value.clone());
                collection
            }
            OptimisticChange::Remove { id_field, id } => collection
                .into_iter()
                .filter(|item| !entry_has_id(item, id_field, id))
                .collect(),
            OptimisticChange::Upsert {
                id_field,
                id,
                value,
            } => {
                match collection
                    .iter_mut()
                    .find(|item| entry_has_id(item, id_field, id))
                {
                    Some(existing) => *existing = value.clone(),
                    None => collection.insert(0, value.clone()),
                }
                collection
            }
        }
    }
}

fn entry_has_id(item: &Value, id_field: &str, id: &str) -> bool {
    item.get(id_field)
        .and_then(value_to_id)
        .is_some_and(|candidate| candidate == id)
}

/// Serialises `draft` and stamps it with a temporary id for optimistic display.
pub fn optimistic_placeholder<T: Serialize>(draft: &T) -> Result<Value, AgoraError> {
    let mut value = serde_json::to_value(draft)?;
    let Some(object) = value.as_object_mut() else {
        return Err(AgoraError::Validation(
            "optimistic placeholder must serialize to a JSON object".to_string(),
        ));
    };
    object.insert("id".to_string(), Value::String(temporary_id()));
    object.insert(
        "created_at".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    Ok(value)
}

/// One optimistic mutation of a cached collection.
///
/// Holds the key's mutation lock from `begin` until dropped. A transaction
/// dropped without `commit` or `rollback` rolls back.
pub struct MutationTransaction {
    cache: Arc<QueryCache>,
    key: CacheKey,
    snapshot: Option<Vec<Value>>,
    resolved: bool,
    _lock: OwnedMutexGuard<()>,
}

impl MutationTransaction {
    pub async fn begin(cache: Arc<QueryCache>, key: CacheKey) -> Self {
        let lock = cache.lock_mutations(&key).await;
        cache.cancel_reads(&key);
        let snapshot = cache.get(&key);
        tracing::debug!(cache_key = %key, "mutation snapshot taken");
        Self {
            cache,
            key,
            snapshot,
            resolved: false,
            _lock: lock,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn snapshot(&self) -> Option<&[Value]> {
        self.snapshot.as_deref()
    }

    pub fn apply(&self, change: &OptimisticChange) {
        if self.resolved {
            return;
        }
        self.cache.update(&self.key, |collection| change.apply_to(collection));
    }

    /// Marks the key stale so the next read replaces optimistic entries.
    ///
    /// Reads that started while the request was in flight saw pre-mutation
    /// server state and are cancelled.
    pub fn commit(&mut self) {
        if std::mem::replace(&mut self.resolved, true) {
            return;
        }
        self.cache.cancel_reads(&self.key);
        self.cache.invalidate(&self.key);
        tracing::debug!(cache_key = %self.key, "mutation committed");
    }

    pub fn rollback(&mut self) {
        if std::mem::replace(&mut self.resolved, true) {
            return;
        }
        self.cache.cancel_reads(&self.key);
        self.cache.restore(&self.key, self.snapshot.clone());
        tracing::debug!(cache_key = %self.key, "mutation rolled back");
    }
}

impl Drop for MutationTransaction {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(cache_key = %self.key, "unresolved mutation dropped; rolling back");
            self.cache.cancel_reads(&self.key);
            self.cache.restore(&self.key, self.snapshot.take());
        }
    }
}

#[derive(Clone)]
/// Runs mutations against the server with optimistic cache updates.
pub struct MutationCoordinator {
    cache: Arc<QueryCache>,
    source: Arc<dyn CollectionSource>,
}

impl MutationCoordinator {
    pub fn new(cache: Arc<QueryCache>, source: Arc<dyn CollectionSource>) -> Self {
        Self { cache, source }
    }

    pub async fn run<T, Fut>(
        &self,
        key: CacheKey,
        change: OptimisticChange,
        request: Fut,
    ) -> Result<T, AgoraError>
    where
        Fut: Future<Output = Result<T, AgoraError>>,
    {
        let mut transaction = MutationTransaction::begin(Arc::clone(&self.cache), key).await;
        transaction.apply(&change);

        match request.await {
            Ok(value) => {
                transaction.commit();
                self.refetch(transaction.key()).await;
                Ok(value)
            }
            Err(error) => {
                tracing::warn!(
                    cache_key = %transaction.key(),
                    error = %error,
                    "mutation rejected; restoring snapshot"
                );
                transaction.rollback();
                Err(error)
            }
        }
    }

    pub async fn create<T, Fut>(
        &self,
        key: CacheKey,
        placeholder: Value,
        request: Fut,
    ) -> Result<T, AgoraError>
    where
        Fut: Future<Output = Result<T, AgoraError>>,
    {
        self.run(key, OptimisticChange::Prepend(placeholder), request)
            .await
    }

    pub async fn delete<T, Fut>(
        &self,
        key: CacheKey,
        id_field: &'static str,
        id: &str,
        request: Fut,
    ) -> Result<T, AgoraError>
    where
        Fut: Future<Output = Result<T, AgoraError>>,
    {
        self.run(
            key,
            OptimisticChange::Remove {
                id_field,
                id: id.to_string(),
            },
            request,
        )
        .await
    }

    /// Acknowledgement-gated mutation: the cache changes only after the
    /// server accepts, using the change `reconcile` derives from its answer.
    pub async fn acknowledged<T, Fut, F>(
        &self,
        key: CacheKey,
        request: Fut,
        reconcile: F,
    ) -> Result<T, AgoraError>
    where
        Fut: Future<Output = Result<T, AgoraError>>,
        F: FnOnce(&T) -> Result<OptimisticChange, AgoraError>,
    {
        let _lock = self.cache.lock_mutations(&key).await;
        let value = request.await?;
        match reconcile(&value) {
            Ok(change) => {
                self.cache.cancel_reads(&key);
                if self.cache.get(&key).is_some() {
                    self.cache
                        .update(&key, |collection| change.apply_to(collection));
                }
            }
            Err(error) => {
                tracing::warn!(cache_key = %key, error = %error, "could not reconcile acknowledged mutation");
                self.cache.invalidate(&key);
            }
        }
        Ok(value)
    }

    async fn refetch(&self, key: &CacheKey) {
        match refresh_collection(&self.cache, self.source.as_ref(), key).await {
            Ok(ReadOutcome::Applied) => {}
            Ok(outcome) => {
                tracing::debug!(cache_key = %key, ?outcome, "post-mutation refresh discarded");
            }
            Err(error) => {
                tracing::warn!(cache_key = %key, error = %error, "post-mutation refresh failed");
            }
        }
    }
}
