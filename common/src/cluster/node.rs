use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::downloader::{Aria2Client, DisabledDownloader, Downloader, RemoteDownloader};
use super::ClusterError;
use crate::auth::{Auth, HmacAuth};
use crate::rpc::{self, into_data};
use crate::serializer::{NodePingReq, NodePingResp};
use crate::store::{NodeRecord, NodeStatus, FEATURE_ARIA2};

/// Se invoca con `(activo, id)` sólo cuando el estado cambia de verdad.
pub type StatusCallback = Arc<dyn Fn(bool, u64) + Send + Sync>;

/// Construye el transporte de heartbeat de un esclavo a partir de su registro.
pub type TransportFactory =
    Arc<dyn Fn(&NodeRecord) -> Result<Arc<dyn HeartbeatTransport>, ClusterError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    pub ping_interval: Duration,
    pub recover_interval: Duration,
    /// Fallos consecutivos antes de marcar el nodo como inactivo.
    pub retry: u32,
    pub credential_ttl: i64,
    pub api_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SiteInfo {
    pub site_id: String,
    pub site_url: String,
}

#[async_trait]
pub trait Node: Send + Sync {
    /// (Re)inicializa el nodo con un registro nuevo; reinicia su heartbeat.
    fn init(&self, record: NodeRecord);
    fn id(&self) -> u64;
    fn record(&self) -> NodeRecord;
    fn is_active(&self) -> bool;
    fn is_master(&self) -> bool;
    fn is_feature_enabled(&self, feature: &str) -> bool;
    fn subscribe_status_change(&self, callback: StatusCallback);
    /// Autenticador que verifica las llamadas que el esclavo hace al master.
    fn master_auth(&self) -> Arc<dyn Auth>;
    fn downloader(&self) -> Arc<dyn Downloader>;
    async fn ping(&self, req: &NodePingReq) -> Result<NodePingResp, ClusterError>;
    /// Detiene el heartbeat.
    fn kill(&self);
}

#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn heartbeat(&self, req: &NodePingReq) -> Result<NodePingResp, ClusterError>;
}

/// Cliente firmado con la clave del esclavo, apuntando a `/api/v1/slave/`.
pub fn slave_client(
    record: &NodeRecord,
    policy: &HeartbeatPolicy,
    site: &SiteInfo,
) -> Result<rpc::Client, ClusterError> {
    let client = rpc::Client::builder(format!(
        "{}/api/v1/slave/",
        record.server.trim_end_matches('/')
    ))
    .timeout(policy.api_timeout)
    .credential(Arc::new(HmacAuth::new(&record.slave_key)), policy.credential_ttl)
    .master_meta(&site.site_id, &site.site_url)
    .build()?;
    Ok(client)
}

pub struct RpcTransport {
    client: rpc::Client,
}

impl RpcTransport {
    pub fn new(client: rpc::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HeartbeatTransport for RpcTransport {
    async fn heartbeat(&self, req: &NodePingReq) -> Result<NodePingResp, ClusterError> {
        let resp = self.client.post("heartbeat", req).await?;
        Ok(into_data(resp)?)
    }
}

fn hostname() -> String {
    hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/* ---------------- nodo esclavo ---------------- */

pub struct SlaveNode {
    shared: Arc<SlaveShared>,
}

struct SlaveShared {
    policy: HeartbeatPolicy,
    site: SiteInfo,
    factory: TransportFactory,
    state: Mutex<SlaveState>,
}

struct SlaveState {
    record: NodeRecord,
    transport: Option<Arc<dyn HeartbeatTransport>>,
    downloader: Arc<dyn Downloader>,
    cancel: Option<CancellationToken>,
    callback: Option<StatusCallback>,
    active: bool,
}

impl SlaveNode {
    /// Crea el nodo sin arrancar el heartbeat; eso lo hace `init`.
    pub fn new(
        record: NodeRecord,
        policy: HeartbeatPolicy,
        site: SiteInfo,
        factory: TransportFactory,
    ) -> Self {
        let active = record.status == NodeStatus::Active;
        Self {
            shared: Arc::new(SlaveShared {
                policy,
                site,
                factory,
                state: Mutex::new(SlaveState {
                    record,
                    transport: None,
                    downloader: Arc::new(DisabledDownloader),
                    cancel: None,
                    callback: None,
                    active,
                }),
            }),
        }
    }

    /// Transporte RPC real contra el esclavo.
    pub fn rpc_factory(policy: HeartbeatPolicy, site: SiteInfo) -> TransportFactory {
        Arc::new(move |record: &NodeRecord| {
            let client = slave_client(record, &policy, &site)?;
            Ok(Arc::new(RpcTransport::new(client)) as Arc<dyn HeartbeatTransport>)
        })
    }
}

impl SlaveShared {
    fn lock(&self) -> MutexGuard<'_, SlaveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn heartbeat_content(&self, is_update: bool) -> NodePingReq {
        NodePingReq {
            site_url: self.site.site_url.clone(),
            site_id: self.site.site_id.clone(),
            is_update,
            credential_ttl: self.policy.credential_ttl,
            node: self.lock().record.clone(),
        }
    }

    async fn ping(&self, req: &NodePingReq) -> Result<NodePingResp, ClusterError> {
        let transport = self.lock().transport.clone();
        match transport {
            Some(t) => t.heartbeat(req).await,
            None => Err(ClusterError::Unreachable(format!(
                "no transport for node {}",
                req.node.id
            ))),
        }
    }

    fn change_status(&self, active: bool) {
        let (callback, id) = {
            let mut st = self.lock();
            if st.active == active {
                return;
            }
            st.active = active;
            (st.callback.clone(), st.record.id)
        };

        if let Some(cb) = callback {
            cb(active, id);
        }
    }
}

/// Bucle de heartbeat: primer ping inmediato, luego cada `ping_interval`;
/// tras `retry` fallos seguidos pasa a `recover_interval` hasta recuperarse.
async fn ping_loop(shared: Arc<SlaveShared>, token: CancellationToken) {
    let policy = shared.policy.clone();
    let id = shared.lock().record.id;
    let mut tick = Duration::ZERO;
    let mut first = true;
    let mut recovering = false;
    let mut retry = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(node = id, "heartbeat detenido");
                return;
            }
            _ = tokio::time::sleep(tick) => {}
        }

        tick = if recovering {
            policy.recover_interval
        } else {
            policy.ping_interval
        };

        let req = shared.heartbeat_content(first);
        first = false;

        let res = tokio::select! {
            _ = token.cancelled() => return,
            res = shared.ping(&req) => res,
        };

        match res {
            Err(e) => {
                retry += 1;
                warn!(node = id, retry, error = %e, "heartbeat fallido");
                if retry >= policy.retry {
                    shared.change_status(false);
                    if !recovering {
                        info!(node = id, "nodo inactivo, entrando en modo recuperación");
                        recovering = true;
                        tick = policy.recover_interval;
                    }
                }
            }
            Ok(_) => {
                if recovering {
                    info!(node = id, "nodo recuperado");
                    recovering = false;
                    first = true;
                    tick = policy.ping_interval;
                }
                shared.change_status(true);
                retry = 0;
            }
        }
    }
}

#[async_trait]
impl Node for SlaveNode {
    fn init(&self, record: NodeRecord) {
        let start = record.status == NodeStatus::Active;
        let transport = match (self.shared.factory)(&record) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(node = record.id, error = %e, "no se pudo crear el cliente del esclavo");
                None
            }
        };
        let downloader: Arc<dyn Downloader> = if record.has_feature(FEATURE_ARIA2) {
            match slave_client(&record, &self.shared.policy, &self.shared.site) {
                Ok(client) => Arc::new(RemoteDownloader::new(client)),
                Err(e) => {
                    warn!(node = record.id, error = %e, "descargas remotas no disponibles");
                    Arc::new(DisabledDownloader)
                }
            }
        } else {
            Arc::new(DisabledDownloader)
        };

        let token = CancellationToken::new();
        {
            let mut st = self.shared.lock();
            if let Some(old) = st.cancel.take() {
                old.cancel();
            }
            st.record = record;
            st.transport = transport;
            st.downloader = downloader;
            if start {
                st.cancel = Some(token.clone());
            }
        }

        if start {
            tokio::spawn(ping_loop(Arc::clone(&self.shared), token));
        }
    }

    fn id(&self) -> u64 {
        self.shared.lock().record.id
    }

    fn record(&self) -> NodeRecord {
        self.shared.lock().record.clone()
    }

    fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    fn is_master(&self) -> bool {
        false
    }

    fn is_feature_enabled(&self, feature: &str) -> bool {
        self.shared.lock().record.has_feature(feature)
    }

    fn subscribe_status_change(&self, callback: StatusCallback) {
        self.shared.lock().callback = Some(callback);
    }

    fn master_auth(&self) -> Arc<dyn Auth> {
        Arc::new(HmacAuth::new(&self.shared.lock().record.master_key))
    }

    fn downloader(&self) -> Arc<dyn Downloader> {
        Arc::clone(&self.shared.lock().downloader)
    }

    async fn ping(&self, req: &NodePingReq) -> Result<NodePingResp, ClusterError> {
        self.shared.ping(req).await
    }

    fn kill(&self) {
        if let Some(token) = self.shared.lock().cancel.take() {
            token.cancel();
        }
    }
}

/* ---------------- nodo master ---------------- */

/// El propio master (o, en un esclavo, la vista local del master que lo
/// controla). Siempre activo; no hace heartbeat.
pub struct MasterNode {
    state: RwLock<MasterState>,
}

struct MasterState {
    record: NodeRecord,
    downloader: Arc<dyn Downloader>,
}

impl MasterNode {
    pub fn new(record: NodeRecord) -> Self {
        let downloader = Self::build_downloader(&record);
        Self {
            state: RwLock::new(MasterState { record, downloader }),
        }
    }

    fn build_downloader(record: &NodeRecord) -> Arc<dyn Downloader> {
        if !record.has_feature(FEATURE_ARIA2) {
            return Arc::new(DisabledDownloader);
        }
        match Aria2Client::new(&record.aria2) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!(node = record.id, error = %e, "aria2 mal configurado");
                Arc::new(DisabledDownloader)
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MasterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Node for MasterNode {
    fn init(&self, record: NodeRecord) {
        let downloader = Self::build_downloader(&record);
        let mut st = self.state.write().unwrap_or_else(|e| e.into_inner());
        st.record = record;
        st.downloader = downloader;
    }

    fn id(&self) -> u64 {
        self.read().record.id
    }

    fn record(&self) -> NodeRecord {
        self.read().record.clone()
    }

    fn is_active(&self) -> bool {
        true
    }

    fn is_master(&self) -> bool {
        true
    }

    fn is_feature_enabled(&self, feature: &str) -> bool {
        self.read().record.has_feature(feature)
    }

    fn subscribe_status_change(&self, _callback: StatusCallback) {}

    fn master_auth(&self) -> Arc<dyn Auth> {
        Arc::new(HmacAuth::new(&self.read().record.master_key))
    }

    fn downloader(&self) -> Arc<dyn Downloader> {
        Arc::clone(&self.read().downloader)
    }

    async fn ping(&self, _req: &NodePingReq) -> Result<NodePingResp, ClusterError> {
        Ok(NodePingResp {
            hostname: hostname(),
        })
    }

    fn kill(&self) {}
}
