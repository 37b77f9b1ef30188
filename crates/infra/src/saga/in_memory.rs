//! In-memory saga store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use wallethub_core::CorrelationId;
use wallethub_events::{SagaInstance, SagaState};

use super::{SagaStore, SagaStoreError};

#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    instances: RwLock<HashMap<CorrelationId, SagaInstance>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.instances.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SagaStore for InMemorySagaStore {
    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| SagaStoreError::Storage("saga table lock poisoned".into()))?;
        Ok(instances.get(correlation_id).cloned())
    }

    fn save(&self, instance: &SagaInstance, expected_version: u64) -> Result<(), SagaStoreError> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| SagaStoreError::Storage("saga table lock poisoned".into()))?;

        let stored = instances
            .get(instance.correlation_id())
            .map_or(0, |i| i.version());
        if stored != expected_version {
            return Err(SagaStoreError::Conflict {
                correlation_id: instance.correlation_id().clone(),
                expected: expected_version,
            });
        }

        instances.insert(instance.correlation_id().clone(), instance.clone());
        Ok(())
    }

    fn list_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>, SagaStoreError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| SagaStoreError::Storage("saga table lock poisoned".into()))?;
        let mut result: Vec<_> = instances
            .values()
            .filter(|i| i.current_state() == state)
            .cloned()
            .collect();
        result.sort_by_key(|i| i.updated_at());
        result.truncate(limit);
        Ok(result)
    }
}
