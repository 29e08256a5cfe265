//! StateStore: per-execution cache layered over a pluggable durable
//! append store, per spec.md §4.3.

mod memory;

pub use memory::InMemoryDurableStore;

use crate::diagram::{NodeState, NodeStatus, TokenUsage};
use crate::envelope::Envelope;
use crate::error::{Result, RuntimeError};
use crate::ids::{DiagramId, ExecutionId, NodeId};
use crate::metrics::PERSISTENCE_DEGRADED;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle status of a whole execution, as recorded in `ExecutionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Durable persistence schema, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub diagram_id: DiagramId,
    pub status: ExecutionStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub node_states: HashMap<NodeId, NodeState>,
    pub node_outputs: HashMap<NodeId, Envelope>,
    pub token_usage: TokenUsage,
    pub error: Option<String>,
    pub variables: HashMap<String, Value>,
    pub exec_counts: HashMap<NodeId, u32>,
    pub executed_nodes: Vec<NodeId>,
    pub metrics: Option<Value>,
    pub persistence_degraded: bool,
}

impl ExecutionState {
    pub fn new(execution_id: ExecutionId, diagram_id: DiagramId, variables: HashMap<String, Value>) -> Self {
        Self {
            execution_id,
            diagram_id,
            status: ExecutionStatus::Running,
            started_at: chrono::Utc::now(),
            ended_at: None,
            node_states: HashMap::new(),
            node_outputs: HashMap::new(),
            token_usage: TokenUsage::default(),
            error: None,
            variables,
            exec_counts: HashMap::new(),
            executed_nodes: Vec::new(),
            metrics: None,
            persistence_degraded: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// The pluggable durable layer a `StateStore` writes through to. A local
/// embedded table with a WAL is the production shape; `InMemoryDurableStore`
/// is the in-process implementation this crate ships.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert(&self, state: ExecutionState) -> Result<()>;
    async fn get(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionState>>;
    async fn list(
        &self,
        diagram_id: Option<&DiagramId>,
        status: Option<ExecutionStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionState>>;
    async fn delete_older_than(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<u64>;
}

struct CacheEntry {
    state: ExecutionState,
    inserted_at: Instant,
}

/// Per-execution cache over a durable store. Active executions mutate the
/// cache synchronously; the durable layer is written through on
/// `save_state` with bounded retry, and cache entries are evicted once
/// their execution goes terminal (after TTL) so memory doesn't grow
/// unbounded across long-running processes.
pub struct StateStore {
    durable: Arc<dyn DurableStore>,
    cache: DashMap<ExecutionId, CacheEntry>,
    ttl: Duration,
}

impl StateStore {
    pub fn new(durable: Arc<dyn DurableStore>, ttl: Duration) -> Self {
        Self {
            durable,
            cache: DashMap::new(),
            ttl,
        }
    }

    pub async fn create_execution(
        &self,
        execution_id: ExecutionId,
        diagram_id: DiagramId,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionState> {
        let state = ExecutionState::new(execution_id.clone(), diagram_id, variables);
        self.save_state(state.clone()).await?;
        Ok(state)
    }

    /// Cache-first lookup, falling back to the durable layer.
    pub async fn get_state(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionState>> {
        if let Some(entry) = self.cache.get(execution_id) {
            return Ok(Some(entry.state.clone()));
        }
        self.durable.get(execution_id).await
    }

    /// Upsert `state`. If active, mirrored in cache; otherwise flushed to
    /// the durable layer and evicted from cache.
    pub async fn save_state(&self, state: ExecutionState) -> Result<()> {
        let execution_id = state.execution_id.clone();
        let is_active = state.is_active();

        self.write_through_with_retry(state.clone()).await?;

        if is_active {
            self.cache.insert(
                execution_id,
                CacheEntry {
                    state,
                    inserted_at: Instant::now(),
                },
            );
        } else {
            self.cache.remove(&execution_id);
        }
        Ok(())
    }

    /// Flush `state` to the durable layer and evict, regardless of its
    /// status. Used when an execution's terminal state must be durable
    /// before control returns to the caller.
    pub async fn persist_final_state(&self, state: ExecutionState) -> Result<()> {
        let execution_id = state.execution_id.clone();
        self.write_through_with_retry(state).await?;
        self.cache.remove(&execution_id);
        Ok(())
    }

    async fn write_through_with_retry(&self, state: ExecutionState) -> Result<()> {
        let execution_id = state.execution_id.clone();
        let mut attempt = 0u32;
        loop {
            match self.durable.upsert(state.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < 2 => {
                    attempt += 1;
                    let backoff_ms = 50u64 * 2u64.pow(attempt);
                    tracing::warn!(
                        execution_id = %execution_id,
                        attempt,
                        error = %err,
                        "durable write failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(err) => {
                    tracing::error!(
                        execution_id = %execution_id,
                        error = %err,
                        "durable write exhausted retries, continuing in memory"
                    );
                    PERSISTENCE_DEGRADED.inc();
                    self.cache.insert(
                        execution_id.clone(),
                        CacheEntry {
                            state: {
                                let mut degraded = state;
                                degraded.persistence_degraded = true;
                                degraded
                            },
                            inserted_at: Instant::now(),
                        },
                    );
                    return Ok(());
                }
            }
        }
    }

    pub async fn update_node_status(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        status: NodeStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.mutate(execution_id, |state| {
            let entry = state
                .node_states
                .entry(node_id.clone())
                .or_insert_with(NodeState::pending);
            entry.status = status;
            entry.error = error;
        })
        .await
    }

    pub async fn update_node_output(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        envelope: Envelope,
        token_usage: Option<TokenUsage>,
    ) -> Result<()> {
        self.mutate(execution_id, |state| {
            state.node_outputs.insert(node_id.clone(), envelope);
            *state.exec_counts.entry(node_id.clone()).or_insert(0) += 1;
            state.executed_nodes.push(node_id.clone());
            if let Some(tokens) = token_usage {
                state.token_usage.add(&tokens);
            }
        })
        .await
    }

    pub async fn update_variables(
        &self,
        execution_id: &ExecutionId,
        vars: HashMap<String, Value>,
    ) -> Result<()> {
        self.mutate(execution_id, |state| {
            state.variables.extend(vars);
        })
        .await
    }

    pub async fn add_token_usage(&self, execution_id: &ExecutionId, tokens: TokenUsage) -> Result<()> {
        self.mutate(execution_id, |state| {
            state.token_usage.add(&tokens);
        })
        .await
    }

    async fn mutate(
        &self,
        execution_id: &ExecutionId,
        f: impl FnOnce(&mut ExecutionState),
    ) -> Result<()> {
        let mut state = self
            .get_state(execution_id)
            .await?
            .ok_or_else(|| RuntimeError::Persistence {
                execution_id: execution_id.clone(),
                message: "no such execution".to_string(),
            })?;
        f(&mut state);
        self.save_state(state).await
    }

    pub async fn list_executions(
        &self,
        diagram_id: Option<&DiagramId>,
        status: Option<ExecutionStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionState>> {
        self.durable.list(diagram_id, status, limit, offset).await
    }

    /// Evict durable-layer rows older than `older_than`, and drop any
    /// cache entries whose TTL has elapsed.
    pub async fn cleanup_old_states(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        self.cache
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        self.durable.delete_older_than(older_than).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str) -> ExecutionState {
        ExecutionState::new(ExecutionId::new(id), DiagramId::new("d1"), HashMap::new())
    }

    #[tokio::test]
    async fn save_then_get_round_trips_active_execution() {
        let store = StateStore::new(Arc::new(InMemoryDurableStore::new()), Duration::from_secs(60));
        let s = state("e1");
        store.save_state(s.clone()).await.unwrap();

        let fetched = store.get_state(&s.execution_id).await.unwrap().unwrap();
        assert_eq!(fetched.execution_id, s.execution_id);
        assert!(store.cache.contains_key(&s.execution_id));
    }

    #[tokio::test]
    async fn terminal_state_evicted_from_cache_but_durable() {
        let store = StateStore::new(Arc::new(InMemoryDurableStore::new()), Duration::from_secs(60));
        let mut s = state("e2");
        s.status = ExecutionStatus::Completed;
        s.ended_at = Some(chrono::Utc::now());
        store.save_state(s.clone()).await.unwrap();

        assert!(!store.cache.contains_key(&s.execution_id));
        assert!(store.get_state(&s.execution_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_node_status_mutates_existing_execution() {
        let store = StateStore::new(Arc::new(InMemoryDurableStore::new()), Duration::from_secs(60));
        let s = state("e3");
        store.save_state(s.clone()).await.unwrap();

        store
            .update_node_status(&s.execution_id, &NodeId::new("n1"), NodeStatus::Running, None)
            .await
            .unwrap();

        let fetched = store.get_state(&s.execution_id).await.unwrap().unwrap();
        assert_eq!(fetched.node_states[&NodeId::new("n1")].status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn mutate_on_missing_execution_is_persistence_error() {
        let store = StateStore::new(Arc::new(InMemoryDurableStore::new()), Duration::from_secs(60));
        let result = store
            .update_variables(&ExecutionId::new("missing"), HashMap::new())
            .await;
        assert!(matches!(result, Err(RuntimeError::Persistence { .. })));
    }
}
