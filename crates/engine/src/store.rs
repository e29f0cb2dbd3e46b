//! The engine's view of the handle store: one cached map per entity type,
//! all sharing a single transaction registry.

use std::sync::Arc;

use tracing::debug;

use store::{CachingHandleMap, Handle, HandleMap, MemoryHandleMap, StoreError, Transaction, TransactionParticipant, TxRegistry};

use crate::instance::{NodeInstance, ProcessInstance};
use crate::models::ProcessModel;
use crate::EngineError;

pub type ModelMap = CachingHandleMap<ProcessModel, MemoryHandleMap<ProcessModel>>;
pub type InstanceMap = CachingHandleMap<ProcessInstance, MemoryHandleMap<ProcessInstance>>;
pub type NodeInstanceMap = CachingHandleMap<NodeInstance, MemoryHandleMap<NodeInstance>>;

#[derive(Debug)]
pub struct ProcessStore {
    registry: Arc<TxRegistry>,
    models: ModelMap,
    instances: InstanceMap,
    nodes: NodeInstanceMap,
}

impl ProcessStore {
    /// In-memory store whose maps each cache up to `cache_capacity` values.
    pub fn in_memory(cache_capacity: usize) -> Result<Self, StoreError> {
        let registry = TxRegistry::new();
        let models = CachingHandleMap::new(MemoryHandleMap::new(&registry, "process_models"), cache_capacity)?;
        let instances = CachingHandleMap::new(MemoryHandleMap::new(&registry, "process_instances"), cache_capacity)?;
        let nodes = CachingHandleMap::new(MemoryHandleMap::new(&registry, "node_instances"), cache_capacity)?;
        debug!(cache_capacity, "process store created");
        Ok(Self { registry, models, instances, nodes })
    }

    pub fn begin(&self) -> Transaction {
        self.registry.begin()
    }

    fn participants(&self) -> [&dyn TransactionParticipant; 3] {
        [&self.models, &self.instances, &self.nodes]
    }

    pub fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
        self.registry.commit(tx, &self.participants())
    }

    pub fn rollback(&self, tx: Transaction) {
        self.registry.rollback(tx, &self.participants())
    }

    pub fn models(&self) -> &ModelMap {
        &self.models
    }

    pub fn instances(&self) -> &InstanceMap {
        &self.instances
    }

    pub fn nodes(&self) -> &NodeInstanceMap {
        &self.nodes
    }

    // -----------------------------------------------------------------------
    // Typed lookups
    // -----------------------------------------------------------------------

    pub fn model(&self, tx: &mut Transaction, handle: Handle<ProcessModel>) -> Result<ProcessModel, EngineError> {
        self.models
            .get(tx, handle)?
            .ok_or(EngineError::NotFound { kind: "process model", handle: handle.value() })
    }

    pub fn instance(
        &self,
        tx: &mut Transaction,
        handle: Handle<ProcessInstance>,
    ) -> Result<ProcessInstance, EngineError> {
        self.instances
            .get(tx, handle)?
            .ok_or(EngineError::NotFound { kind: "process instance", handle: handle.value() })
    }

    pub fn node(&self, tx: &mut Transaction, handle: Handle<NodeInstance>) -> Result<NodeInstance, EngineError> {
        self.nodes
            .get(tx, handle)?
            .ok_or(EngineError::NotFound { kind: "node instance", handle: handle.value() })
    }

    /// Every node instance of `instance`, in handle order.
    pub fn nodes_of(&self, tx: &mut Transaction, instance: &ProcessInstance) -> Result<Vec<NodeInstance>, EngineError> {
        instance.child_nodes.iter().map(|&h| self.node(tx, h)).collect()
    }
}
