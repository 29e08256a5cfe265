//! In-process durable backend, grounded on the teacher's
//! `MemoryCheckpointer` (`Arc<DashMap<...>>` plus a secondary index),
//! generalized from thread-keyed checkpoints to execution-keyed states.

use super::{DurableStore, ExecutionState, ExecutionStatus};
use crate::error::Result;
use crate::ids::{DiagramId, ExecutionId};
use async_trait::async_trait;
use dashmap::DashMap;

pub struct InMemoryDurableStore {
    states: DashMap<ExecutionId, ExecutionState>,
    diagram_index: DashMap<DiagramId, Vec<ExecutionId>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            diagram_index: DashMap::new(),
        }
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn upsert(&self, state: ExecutionState) -> Result<()> {
        let execution_id = state.execution_id.clone();
        let diagram_id = state.diagram_id.clone();

        let mut index = self.diagram_index.entry(diagram_id).or_insert_with(Vec::new);
        if !index.contains(&execution_id) {
            index.push(execution_id.clone());
        }
        drop(index);

        self.states.insert(execution_id, state);
        Ok(())
    }

    async fn get(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionState>> {
        Ok(self.states.get(execution_id).map(|entry| entry.value().clone()))
    }

    async fn list(
        &self,
        diagram_id: Option<&DiagramId>,
        status: Option<ExecutionStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionState>> {
        let mut matches: Vec<ExecutionState> = if let Some(diagram_id) = diagram_id {
            self.diagram_index
                .get(diagram_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| self.states.get(id).map(|e| e.value().clone()))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            self.states.iter().map(|e| e.value().clone()).collect()
        };

        if let Some(status) = status {
            matches.retain(|s| s.status == status);
        }
        matches.sort_by_key(|s| s.started_at);

        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_older_than(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let stale: Vec<ExecutionId> = self
            .states
            .iter()
            .filter(|e| e.value().started_at < cutoff)
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            if let Some((_, state)) = self.states.remove(id) {
                if let Some(mut ids) = self.diagram_index.get_mut(&state.diagram_id) {
                    ids.retain(|existing| existing != id);
                }
            }
        }
        Ok(stale.len() as u64)
    }
}
