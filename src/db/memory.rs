//! In-process backends for hosts without Postgres, and for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::amas::persistence::{AmasRepository, RepositoryError, UserStateProvider};
use crate::amas::types::{BanditModel, DecisionTrace, PipelineStageTrace, UserState};
use crate::services::decision_recorder::{DecisionInsight, DecisionStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryRepository {
    states: RwLock<HashMap<String, UserState>>,
    models: RwLock<HashMap<String, BanditModel>>,
    snapshots: RwLock<HashMap<String, serde_json::Value>>,
    state_loads: AtomicUsize,
    model_loads: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_loads(&self) -> usize {
        self.state_loads.load(Ordering::SeqCst)
    }

    pub fn model_loads(&self) -> usize {
        self.model_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmasRepository for MemoryRepository {
    async fn load_state(&self, user_id: &str) -> Result<Option<UserState>, RepositoryError> {
        self.state_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.states.read().get(user_id).cloned())
    }

    async fn save_state(&self, user_id: &str, state: &UserState) -> Result<(), RepositoryError> {
        self.states
            .write()
            .insert(user_id.to_string(), state.clone());
        Ok(())
    }

    async fn load_model(&self, user_id: &str) -> Result<Option<BanditModel>, RepositoryError> {
        self.model_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.models.read().get(user_id).cloned())
    }

    async fn save_model(&self, user_id: &str, model: &BanditModel) -> Result<(), RepositoryError> {
        self.models
            .write()
            .insert(user_id.to_string(), model.clone());
        Ok(())
    }

    async fn delete_model(&self, user_id: &str) -> Result<(), RepositoryError> {
        self.models.write().remove(user_id);
        Ok(())
    }

    async fn load_snapshot(&self, name: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        Ok(self.snapshots.read().get(name).cloned())
    }

    async fn save_snapshot(&self, name: &str, payload: &serde_json::Value) -> Result<(), RepositoryError> {
        self.snapshots
            .write()
            .insert(name.to_string(), payload.clone());
        Ok(())
    }
}

#[async_trait]
impl UserStateProvider for MemoryRepository {
    async fn get_user_state(&self, user_id: &str) -> Option<UserState> {
        self.states.read().get(user_id).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StoredDecision {
    pub trace: DecisionTrace,
    pub status: RecordStatus,
    pub error: Option<String>,
}

/// Decision store keyed by decision id. Batches are applied all-or-nothing.
#[derive(Debug, Default)]
pub struct MemoryDecisionStore {
    records: RwLock<HashMap<String, StoredDecision>>,
    stages: RwLock<HashMap<String, Vec<PipelineStageTrace>>>,
    insights: RwLock<Vec<DecisionInsight>>,
    fail_persists: AtomicU32,
    persist_calls: AtomicUsize,
}

impl MemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `persist_batch` fail.
    pub fn fail_next_persists(&self, n: u32) {
        self.fail_persists.store(n, Ordering::SeqCst);
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<StoredDecision> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.trace.decision_id.cmp(&b.trace.decision_id));
        records
    }

    pub fn record(&self, decision_id: &str) -> Option<StoredDecision> {
        self.records.read().get(decision_id).cloned()
    }

    pub fn stages(&self, decision_id: &str) -> Vec<PipelineStageTrace> {
        self.stages
            .read()
            .get(decision_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insights(&self) -> Vec<DecisionInsight> {
        self.insights.read().clone()
    }
}

#[async_trait]
impl DecisionStore for MemoryDecisionStore {
    async fn persist_batch(&self, traces: &[DecisionTrace]) -> Result<(), StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_persists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::Unavailable("injected persist failure".to_string()));
        }

        let mut records = self.records.write();
        let mut stages = self.stages.write();
        for trace in traces {
            records.insert(
                trace.decision_id.clone(),
                StoredDecision {
                    trace: trace.clone(),
                    status: RecordStatus::Success,
                    error: None,
                },
            );
            stages.insert(trace.decision_id.clone(), trace.pipeline_stages.clone());
        }
        Ok(())
    }

    async fn mark_failed(&self, trace: &DecisionTrace, error: &str) -> Result<(), StoreError> {
        self.records.write().insert(
            trace.decision_id.clone(),
            StoredDecision {
                trace: trace.clone(),
                status: RecordStatus::Failed,
                error: Some(error.to_string()),
            },
        );
        Ok(())
    }

    async fn write_insights(&self, insights: &[DecisionInsight]) -> Result<(), StoreError> {
        let mut stored = self.insights.write();
        for insight in insights {
            stored.retain(|existing| existing.decision_id != insight.decision_id);
            stored.push(insight.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amas::types::{Action, PipelineStage};

    fn trace(id: &str, stages: usize) -> DecisionTrace {
        let mut trace = DecisionTrace::new(id, Action::default(), 0);
        trace.pipeline_stages = (0..stages)
            .map(|i| PipelineStageTrace::completed(PipelineStage::Perception, "feature", i as i64, 1.0))
            .collect();
        trace
    }

    #[tokio::test]
    async fn upsert_replaces_stages() {
        let store = MemoryDecisionStore::new();
        store.persist_batch(&[trace("d1", 3)]).await.unwrap();
        store.persist_batch(&[trace("d1", 1)]).await.unwrap();
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.stages("d1").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryDecisionStore::new();
        store.fail_next_persists(1);
        assert!(store.persist_batch(&[trace("d1", 0)]).await.is_err());
        assert!(store.persist_batch(&[trace("d1", 0)]).await.is_ok());
        assert_eq!(store.persist_calls(), 2);
    }
}
