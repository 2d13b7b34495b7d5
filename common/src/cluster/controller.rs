use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tracing::{debug, info};

use super::downloader::Downloader;
use super::node::{MasterNode, Node};
use super::ClusterError;
use crate::auth::HmacAuth;
use crate::mq::Message;
use crate::rpc::{self, into_data, RpcError};
use crate::serializer::{NodePingReq, NodePingResp};
use crate::store::FEATURE_ARIA2;

/// Lo que un esclavo sabe de un master que lo controla.
pub struct MasterInfo {
    pub id: String,
    pub ttl: i64,
    pub url: String,
    /// Cliente firmado con la `master_key` del nodo.
    pub client: rpc::Client,
    pub instance: Arc<MasterNode>,
    job_tracker: Mutex<HashSet<String>>,
}

impl MasterInfo {
    /// Registra `hash`; `false` si ya se envió antes. Las claves no se
    /// borran mientras viva este `MasterInfo`.
    pub fn track(&self, hash: &str) -> bool {
        self.job_tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash.to_string())
    }
}

/// Controlador del esclavo: los masters que le han hecho heartbeat.
pub struct SlaveController {
    masters: RwLock<HashMap<String, Arc<MasterInfo>>>,
    api_timeout: Duration,
}

impl SlaveController {
    pub fn new(api_timeout: Duration) -> Self {
        Self {
            masters: RwLock::new(HashMap::new()),
            api_timeout,
        }
    }

    /// Registra (o renueva si `is_update`) al master que envía el heartbeat.
    pub fn handle_heartbeat(&self, req: &NodePingReq) -> Result<NodePingResp, ClusterError> {
        let mut masters = self.masters.write().unwrap_or_else(|e| e.into_inner());

        if req.is_update || !masters.contains_key(&req.site_id) {
            if let Some(old) = masters.get(&req.site_id) {
                old.instance.kill();
            }

            let url = req.site_url.trim_end_matches('/').to_string();
            let client = rpc::Client::builder(format!("{url}/api/v1/"))
                .timeout(self.api_timeout)
                .credential(Arc::new(HmacAuth::new(&req.node.master_key)), req.credential_ttl)
                .slave_meta(req.node.id)
                .build()?;

            info!(site = %req.site_id, url = %url, update = req.is_update, "master registrado");
            masters.insert(
                req.site_id.clone(),
                Arc::new(MasterInfo {
                    id: req.site_id.clone(),
                    ttl: req.credential_ttl,
                    url,
                    client,
                    instance: Arc::new(MasterNode::new(req.node.clone())),
                    job_tracker: Mutex::new(HashSet::new()),
                }),
            );
        }

        Ok(NodePingResp {
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
        })
    }

    pub fn get_master_info(&self, id: &str) -> Result<Arc<MasterInfo>, ClusterError> {
        self.masters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or(ClusterError::MasterNotFound)
    }

    pub fn get_aria2_instance(&self, id: &str) -> Result<Arc<dyn Downloader>, ClusterError> {
        let master = self.get_master_info(id)?;
        if !master.instance.is_feature_enabled(FEATURE_ARIA2) {
            return Err(ClusterError::FeatureDisabled(FEATURE_ARIA2.to_string()));
        }
        Ok(master.instance.downloader())
    }

    pub async fn send_notification(
        &self,
        id: &str,
        subject: &str,
        msg: &Message,
    ) -> Result<(), ClusterError> {
        let master = self.get_master_info(id)?;
        let resp = master
            .client
            .put(&format!("slave/notification/{subject}"), msg)
            .await?;
        if !resp.is_ok() {
            return Err(RpcError::from_response(&resp).into());
        }
        Ok(())
    }

    pub async fn get_policy_oauth_token(
        &self,
        id: &str,
        policy_id: u64,
    ) -> Result<String, ClusterError> {
        let master = self.get_master_info(id)?;
        let resp = master
            .client
            .get(&format!("slave/credential/{policy_id}"))
            .await?;
        Ok(into_data(resp)?)
    }

    /// Envía el trabajo a `submit` salvo que `hash` ya esté en curso para ese
    /// master. Devuelve si se envió.
    pub fn submit_task<F>(&self, master_id: &str, hash: &str, submit: F) -> Result<bool, ClusterError>
    where
        F: FnOnce(Arc<MasterInfo>),
    {
        let master = self.get_master_info(master_id)?;
        if !master.track(hash) {
            debug!(master = master_id, hash, "tarea ya en curso, se ignora");
            return Ok(false);
        }
        submit(master);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{verify_request, AuthSource};
    use crate::serializer::Response;
    use crate::store::{NodeKind, NodeRecord, NodeStatus};
    use axum::{
        extract::Path,
        middleware,
        routing::{get, put},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ping(site_id: &str, site_url: &str, is_update: bool) -> NodePingReq {
        NodePingReq {
            site_url: site_url.into(),
            site_id: site_id.into(),
            is_update,
            credential_ttl: 60,
            node: NodeRecord {
                id: 2,
                name: "slave".into(),
                kind: NodeKind::Slave,
                status: NodeStatus::Active,
                server: "http://slave".into(),
                slave_key: "slave-key".into(),
                master_key: "master-key".into(),
                features: Default::default(),
                aria2: Default::default(),
                rank: 0,
            },
        }
    }

    #[test]
    fn master_desconocido() {
        let c = SlaveController::new(Duration::from_secs(5));
        assert!(matches!(c.get_master_info("nadie"), Err(ClusterError::MasterNotFound)));
        assert!(matches!(
            c.submit_task("nadie", "h", |_| {}),
            Err(ClusterError::MasterNotFound)
        ));
    }

    #[test]
    fn heartbeat_solo_reemplaza_si_es_actualizacion() {
        let c = SlaveController::new(Duration::from_secs(5));
        c.handle_heartbeat(&ping("site", "http://m", true)).unwrap();
        let first = c.get_master_info("site").unwrap();

        c.handle_heartbeat(&ping("site", "http://otro", false)).unwrap();
        assert!(Arc::ptr_eq(&first, &c.get_master_info("site").unwrap()));

        c.handle_heartbeat(&ping("site", "http://otro", true)).unwrap();
        let replaced = c.get_master_info("site").unwrap();
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert_eq!(replaced.url, "http://otro");
    }

    #[test]
    fn aria2_deshabilitado_en_el_nodo() {
        let c = SlaveController::new(Duration::from_secs(5));
        c.handle_heartbeat(&ping("site", "http://m", true)).unwrap();
        assert!(matches!(
            c.get_aria2_instance("site"),
            Err(ClusterError::FeatureDisabled(_))
        ));
    }

    #[tokio::test]
    async fn envio_idempotente_ejecuta_una_vez() {
        let c = Arc::new(SlaveController::new(Duration::from_secs(5)));
        c.handle_heartbeat(&ping("site", "http://m", true)).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = Arc::clone(&c);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                c.submit_task("site", "hash-1", |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            }));
        }
        let mut submitted = 0;
        for h in handles {
            if h.await.unwrap() {
                submitted += 1;
            }
        }
        assert_eq!(submitted, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // la clave sigue registrada aunque el trabajo haya terminado
        assert!(!c.submit_task("site", "hash-1", |_| {}).unwrap());

        // un heartbeat con credenciales nuevas trae un tracker vacío
        c.handle_heartbeat(&ping("site", "http://m", true)).unwrap();
        assert!(c.submit_task("site", "hash-1", |_| {}).unwrap());
    }

    async fn fake_master() -> String {
        let source: Arc<dyn AuthSource> = Arc::new(HmacAuth::new("master-key"));
        let app = Router::new()
            .route(
                "/api/v1/slave/notification/:subject",
                put(|Path(subject): Path<String>, Json(msg): Json<Message>| async move {
                    if subject == "t1" && msg.event == "success" {
                        Response::empty()
                    } else {
                        Response::err(404, "unexpected", None)
                    }
                }),
            )
            .route(
                "/api/v1/slave/credential/:policy",
                get(|Path(policy): Path<u64>| async move { Response::ok(format!("token-{policy}")) }),
            )
            .route_layer(middleware::from_fn_with_state(source, verify_request));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn llamadas_al_master_van_firmadas() {
        let url = fake_master().await;
        let c = SlaveController::new(Duration::from_secs(5));
        c.handle_heartbeat(&ping("site", &url, true)).unwrap();

        let msg = Message {
            triggered_by: "slave".into(),
            event: "success".into(),
            content: json!({}),
        };
        c.send_notification("site", "t1", &msg).await.unwrap();
        assert!(c.send_notification("site", "t2", &msg).await.is_err());

        let token = c.get_policy_oauth_token("site", 9).await.unwrap();
        assert_eq!(token, "token-9");
    }
}
