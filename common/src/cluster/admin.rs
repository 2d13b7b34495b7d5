use std::sync::Arc;
use tracing::info;

use super::pool::NodePool;
use super::ClusterError;
use crate::store::{NodeRecord, NodeStatus, NodeStore};

/// Operaciones de administración sobre los nodos: persisten el cambio y lo
/// reflejan en el pool.
#[derive(Clone)]
pub struct NodeService {
    store: Arc<dyn NodeStore>,
    pool: NodePool,
}

impl NodeService {
    pub fn new(store: Arc<dyn NodeStore>, pool: NodePool) -> Self {
        Self { store, pool }
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        self.store.list_nodes()
    }

    pub fn add(&self, mut record: NodeRecord) -> Result<NodeRecord, ClusterError> {
        record.id = 0;
        let saved = self.store.save_node(record)?;
        if saved.status == NodeStatus::Active {
            self.pool.add(saved.clone());
        }
        info!(node = saved.id, name = %saved.name, "nodo creado");
        Ok(saved)
    }

    pub fn update(&self, record: NodeRecord) -> Result<NodeRecord, ClusterError> {
        if record.is_system() {
            return Err(ClusterError::SystemNode);
        }
        self.store.get_node(record.id)?;
        let saved = self.store.save_node(record)?;
        if saved.status == NodeStatus::Active {
            self.pool.add(saved.clone());
        }
        Ok(saved)
    }

    pub fn toggle(&self, id: u64, status: NodeStatus) -> Result<NodeRecord, ClusterError> {
        let mut record = self.store.get_node(id)?;
        if record.is_system() {
            return Err(ClusterError::SystemNode);
        }

        record.status = status;
        let saved = self.store.save_node(record)?;
        match status {
            NodeStatus::Active => self.pool.add(saved.clone()),
            NodeStatus::Suspended => self.pool.delete(id),
        }
        info!(node = id, ?status, "estado de nodo cambiado");
        Ok(saved)
    }

    pub fn delete(&self, id: u64) -> Result<(), ClusterError> {
        let record = self.store.get_node(id)?;
        if record.is_system() {
            return Err(ClusterError::SystemNode);
        }
        self.store.delete_node(id)?;
        self.pool.delete(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HeartbeatPolicy, SiteInfo};
    use crate::store::{MemoryStore, NodeKind};
    use std::time::Duration;

    fn service() -> (NodeService, NodePool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let policy = HeartbeatPolicy {
            ping_interval: Duration::from_secs(3600),
            recover_interval: Duration::from_secs(3600),
            retry: 3,
            credential_ttl: 60,
            api_timeout: Duration::from_millis(200),
        };
        let pool = NodePool::new(policy, SiteInfo::default());
        (NodeService::new(store.clone(), pool.clone()), pool, store)
    }

    fn record(kind: NodeKind, status: NodeStatus) -> NodeRecord {
        NodeRecord {
            id: 0,
            name: "n".into(),
            kind,
            status,
            server: "http://127.0.0.1:1".into(),
            slave_key: "s".into(),
            master_key: "m".into(),
            features: Default::default(),
            aria2: Default::default(),
            rank: 0,
        }
    }

    #[tokio::test]
    async fn nodo_de_sistema_no_se_toca() {
        let (svc, _pool, store) = service();
        let mut master = record(NodeKind::Master, NodeStatus::Active);
        master.id = 1;
        store.save_node(master).unwrap();

        assert!(matches!(svc.toggle(1, NodeStatus::Suspended), Err(ClusterError::SystemNode)));
        assert!(matches!(svc.delete(1), Err(ClusterError::SystemNode)));
    }

    #[tokio::test]
    async fn toggle_saca_y_mete_en_el_pool() {
        let (svc, pool, _store) = service();
        let node = svc.add(record(NodeKind::Slave, NodeStatus::Active)).unwrap();
        assert!(pool.get_node_by_id(node.id).is_some());

        svc.toggle(node.id, NodeStatus::Suspended).unwrap();
        assert!(pool.get_node_by_id(node.id).is_none());

        svc.toggle(node.id, NodeStatus::Active).unwrap();
        assert!(pool.get_node_by_id(node.id).is_some());

        svc.delete(node.id).unwrap();
        assert!(pool.get_node_by_id(node.id).is_none());
        assert!(svc.list().is_empty());
        pool.shutdown();
    }
}
