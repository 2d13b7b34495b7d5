use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock, Weak,
    },
};
use tracing::{info, warn};

use super::node::{HeartbeatPolicy, MasterNode, Node, SiteInfo, SlaveNode, StatusCallback};
use crate::store::{NodeKind, NodeRecord, NodeStatus, NodeStore};

/// Crea la instancia de un nodo sin inicializarla.
pub type NodeFactory = Arc<dyn Fn(NodeRecord) -> Arc<dyn Node> + Send + Sync>;

#[derive(Default)]
struct Maps {
    active: HashMap<u64, Arc<dyn Node>>,
    inactive: HashMap<u64, Arc<dyn Node>>,
}

struct PoolInner {
    maps: RwLock<Maps>,
    listeners: RwLock<Vec<StatusCallback>>,
    rr_cursor: AtomicUsize,
    factory: NodeFactory,
}

/// Registro de nodos del master: activos e inactivos.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

impl NodePool {
    pub fn new(policy: HeartbeatPolicy, site: SiteInfo) -> Self {
        let transport = SlaveNode::rpc_factory(policy.clone(), site.clone());
        let factory: NodeFactory = Arc::new(move |record: NodeRecord| match record.kind {
            NodeKind::Master => Arc::new(MasterNode::new(record)) as Arc<dyn Node>,
            NodeKind::Slave => Arc::new(SlaveNode::new(
                record,
                policy.clone(),
                site.clone(),
                Arc::clone(&transport),
            )),
        });
        Self::with_factory(factory)
    }

    pub fn with_factory(factory: NodeFactory) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                maps: RwLock::new(Maps::default()),
                listeners: RwLock::new(Vec::new()),
                rr_cursor: AtomicUsize::new(0),
                factory,
            }),
        }
    }

    /// Carga todos los nodos activos del almacén.
    pub fn init(&self, store: &dyn NodeStore) {
        for record in store.list_nodes() {
            if record.status == NodeStatus::Active {
                self.add(record);
            }
        }
    }

    /// Alta de un nodo, o reinicialización si ya existe.
    pub fn add(&self, record: NodeRecord) {
        if let Some(node) = self.get_node_by_id(record.id) {
            node.init(record);
            return;
        }

        let id = record.id;
        let node = (self.inner.factory)(record.clone());
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        node.subscribe_status_change(Arc::new(move |active, id| {
            if let Some(inner) = weak.upgrade() {
                inner.node_status_change(active, id);
            }
        }));

        {
            let mut maps = self.inner.write();
            if record.status == NodeStatus::Active && node.is_active() {
                maps.active.insert(id, Arc::clone(&node));
            } else {
                maps.inactive.insert(id, Arc::clone(&node));
            }
        }
        info!(node = id, name = %record.name, "nodo añadido");
        node.init(record);
    }

    /// Detiene y elimina un nodo.
    pub fn delete(&self, id: u64) {
        let removed = {
            let mut maps = self.inner.write();
            maps.active.remove(&id).or_else(|| maps.inactive.remove(&id))
        };
        if let Some(node) = removed {
            node.kill();
            info!(node = id, "nodo eliminado");
        }
    }

    pub fn get_node_by_id(&self, id: u64) -> Option<Arc<dyn Node>> {
        let maps = self.inner.read();
        maps.active
            .get(&id)
            .or_else(|| maps.inactive.get(&id))
            .cloned()
    }

    pub fn active_nodes(&self) -> Vec<Arc<dyn Node>> {
        let mut nodes: Vec<_> = self.inner.read().active.values().cloned().collect();
        nodes.sort_by_key(|n| n.id());
        nodes
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.inner.read().active.contains_key(&id)
    }

    /// Round-robin entre los nodos activos que tienen `feature`.
    pub fn select_by_feature(&self, feature: &str) -> Option<Arc<dyn Node>> {
        let candidates: Vec<_> = self
            .active_nodes()
            .into_iter()
            .filter(|n| n.is_feature_enabled(feature))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.inner.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[idx]))
    }

    pub fn subscribe_status_change(&self, callback: StatusCallback) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub fn shutdown(&self) {
        let maps = std::mem::take(&mut *self.inner.write());
        for node in maps.active.values().chain(maps.inactive.values()) {
            node.kill();
        }
    }
}

impl PoolInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(|e| e.into_inner())
    }

    fn node_status_change(&self, active: bool, id: u64) {
        {
            let mut guard = self.write();
            let maps = &mut *guard;
            let (from, to) = if active {
                (&mut maps.inactive, &mut maps.active)
            } else {
                (&mut maps.active, &mut maps.inactive)
            };
            match from.remove(&id) {
                Some(node) => {
                    to.insert(id, node);
                }
                None => {
                    warn!(node = id, active, "cambio de estado de un nodo desconocido");
                    return;
                }
            }
        }
        info!(node = id, active, "estado del nodo cambiado");

        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for cb in listeners {
            cb(active, id);
        }
    }
}
