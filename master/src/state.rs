// master/src/state.rs

use anyhow::Context;
use common::{
    auth::HmacAuth,
    cluster::{NodePool, NodeService, SiteInfo},
    fs::MemoryCatalog,
    mq::NotificationBus,
    store::{
        MemoryStore, NodeKind, NodeRecord, NodeStatus, NodeStore, Owner, OwnerStore, Policy,
        PolicyKind, PolicyStore,
    },
    task::{JobEnv, JobRegistry, TaskPool, TaskService},
    thumb::Pipeline,
    Settings,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Capacidad del propietario creado en el primer arranque.
const DEFAULT_CAPACITY: u64 = 1 << 30;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<MemoryStore>,
    pub nodes: NodePool,
    pub node_service: NodeService,
    pub tasks: TaskService,
    pub bus: NotificationBus,
    pub thumbs: Arc<Pipeline>,
}

impl AppState {
    pub fn build(mut settings: Settings) -> anyhow::Result<Self> {
        if settings.system.secret.is_empty() {
            settings.system.secret = uuid::Uuid::new_v4().simple().to_string();
            warn!("system.secret vacío, se genera uno aleatorio para esta ejecución");
        }

        let store = Arc::new(match &settings.system.data_path {
            Some(path) => MemoryStore::open(path)
                .with_context(|| format!("no se pudo abrir {}", path.display()))?,
            None => MemoryStore::new(),
        });
        if settings.system.site_id.is_empty() {
            settings.system.site_id = store.site_id(|| uuid::Uuid::new_v4().to_string())?;
        }
        let catalog = Arc::new(match &settings.system.data_path {
            Some(path) => {
                let path = path.with_extension("catalog.json");
                MemoryCatalog::open(&path)
                    .with_context(|| format!("no se pudo abrir {}", path.display()))?
            }
            None => MemoryCatalog::new(),
        });
        let settings = Arc::new(settings);
        seed(&store, &settings)?;

        let site = SiteInfo {
            site_id: settings.system.site_id.clone(),
            site_url: settings.system.site_url.clone(),
        };
        let nodes = NodePool::new(settings.cluster.heartbeat_policy(), site);
        nodes.init(store.as_ref());
        nodes.subscribe_status_change(Arc::new(|active, id| {
            info!(node = id, active, "estado de nodo");
        }));

        let thumbs = Arc::new(Pipeline::from_config(&settings.thumb, &settings.system.temp_path));
        info!(generadores = thumbs.len(), "cadena de miniaturas lista");

        let bus = NotificationBus::new();
        let env = JobEnv {
            owners: store.clone(),
            policies: store.clone(),
            catalog,
            nodes: Some(nodes.clone()),
            bus: bus.clone(),
            settings: Arc::clone(&settings),
            auth: Arc::new(HmacAuth::new(&settings.system.secret)),
        };
        let tasks = TaskService::new(
            store.clone(),
            TaskPool::new(settings.task.max_worker_num),
            JobRegistry::with_defaults(),
            env,
        );

        Ok(Self {
            node_service: NodeService::new(store.clone(), nodes.clone()),
            settings,
            store,
            nodes,
            tasks,
            bus,
            thumbs,
        })
    }
}

/// Nodo integrado, política y propietario por defecto si no existen.
fn seed(store: &MemoryStore, settings: &Settings) -> anyhow::Result<()> {
    if store.get_node(1).is_err() {
        store.save_node(NodeRecord {
            id: 1,
            name: "master".into(),
            kind: NodeKind::Master,
            status: NodeStatus::Active,
            server: settings.system.site_url.clone(),
            slave_key: String::new(),
            master_key: String::new(),
            features: Default::default(),
            aria2: Default::default(),
            rank: 0,
        })?;
    }
    if store.get_policy(1).is_err() {
        let root = settings
            .system
            .data_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(|dir| dir.join("uploads"))
            .unwrap_or_else(|| "uploads".into());
        store.save_policy(Policy {
            id: 1,
            name: "default".into(),
            kind: PolicyKind::Local,
            root: root.to_string_lossy().into_owned(),
            ..Policy::default()
        })?;
    }
    if store.get_owner(1).is_err() {
        store.save_owner(Owner {
            id: 1,
            name: "admin".into(),
            capacity: DEFAULT_CAPACITY,
            used: 0,
            policy_id: 1,
        })?;
        info!("creados política y propietario por defecto");
    }
    Ok(())
}
