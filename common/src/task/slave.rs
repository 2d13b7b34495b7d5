use async_trait::async_trait;
use serde_json::json;
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

use super::{Job, JobError, TaskHandle, TaskType};
use crate::auth::Auth;
use crate::cluster::{MasterInfo, SlaveController};
use crate::driver::{handler_for_policy, FileStream};
use crate::mq::Message;
use crate::serializer::{SlaveTransferReq, SLAVE_TRANSFER_FAILED, SLAVE_TRANSFER_SUCCESS};
use crate::store::TaskRecord;

/// Transferencia que el master delega en este esclavo. No se persiste: el
/// resultado vuelve al master como notificación con el hash como tema. La
/// clave de idempotencia queda registrada en el `MasterInfo`.
pub struct SlaveTransferJob {
    req: SlaveTransferReq,
    hash: String,
    master: Arc<MasterInfo>,
    controller: Arc<SlaveController>,
    auth: Arc<dyn Auth>,
}

impl SlaveTransferJob {
    pub fn new(
        req: SlaveTransferReq,
        hash: String,
        master: Arc<MasterInfo>,
        controller: Arc<SlaveController>,
        auth: Arc<dyn Auth>,
    ) -> Self {
        Self {
            req,
            hash,
            master,
            controller,
            auth,
        }
    }

    /// Registro sin persistir con el que corre en el pool del esclavo.
    pub fn record(&self) -> TaskRecord {
        TaskRecord::new(
            TaskType::Transfer,
            0,
            serde_json::to_string(&self.req).unwrap_or_default(),
        )
    }

    async fn transfer(&self) -> Result<(), JobError> {
        let handler = handler_for_policy(&self.req.policy, Arc::clone(&self.auth), &self.master.url)
            .map_err(|e| JobError::with("Failed to create handler.", e))?;
        let size = tokio::fs::metadata(&self.req.src)
            .await
            .map_err(|e| JobError::with("Failed to open source file.", e))?
            .len();
        let name = Path::new(&self.req.dst)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut file = FileStream::from_src(self.req.src.as_str(), size, name);
        file.save_path = self.req.dst.clone();
        handler
            .put(file)
            .await
            .map_err(|e| JobError::with("Failed to upload file.", e))
    }
}

#[async_trait]
impl Job for SlaveTransferJob {
    async fn run(&self, _handle: &TaskHandle) -> Result<(), JobError> {
        let res = self.transfer().await;
        let msg = match &res {
            Ok(()) => Message {
                triggered_by: self.master.id.clone(),
                event: SLAVE_TRANSFER_SUCCESS.to_string(),
                content: json!({ "error": "" }),
            },
            Err(e) => Message {
                triggered_by: self.master.id.clone(),
                event: SLAVE_TRANSFER_FAILED.to_string(),
                content: json!({ "error": e.to_string() }),
            },
        };

        if let Err(e) = self
            .controller
            .send_notification(&self.master.id, &self.hash, &msg)
            .await
        {
            warn!(hash = %self.hash, error = %e, "no se pudo avisar al master");
        }
        info!(hash = %self.hash, ok = res.is_ok(), "transferencia delegada terminada");
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacAuth;
    use crate::serializer::{NodePingReq, Response};
    use crate::store::{NodeKind, NodeRecord, NodeStatus, Policy, PolicyKind};
    use crate::task::TaskPool;
    use axum::{extract::Path as UrlPath, routing::put, Json, Router};
    use std::{
        env, fs,
        path::PathBuf,
        sync::Mutex,
        time::Duration,
    };

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("slave_job_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    type Received = Arc<Mutex<Vec<(String, Message)>>>;

    async fn fake_master(received: Received) -> String {
        let app = Router::new().route(
            "/api/v1/slave/notification/:subject",
            put(move |UrlPath(subject): UrlPath<String>, Json(msg): Json<Message>| {
                let received = received.clone();
                async move {
                    received.lock().unwrap().push((subject, msg));
                    Response::empty()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn controller(url: &str) -> Arc<SlaveController> {
        let c = Arc::new(SlaveController::new(Duration::from_secs(5)));
        c.handle_heartbeat(&NodePingReq {
            site_url: url.into(),
            site_id: "site".into(),
            is_update: true,
            credential_ttl: 60,
            node: NodeRecord {
                id: 2,
                name: "slave".into(),
                kind: NodeKind::Slave,
                status: NodeStatus::Active,
                server: "http://slave".into(),
                slave_key: "s".into(),
                master_key: "m".into(),
                features: Default::default(),
                aria2: Default::default(),
                rank: 0,
            },
        })
        .unwrap();
        c
    }

    async fn run(dir: &std::path::Path, src: PathBuf) -> (Received, Arc<SlaveController>, String) {
        let received: Received = Arc::default();
        let url = fake_master(received.clone()).await;
        let c = controller(&url);

        let req = SlaveTransferReq {
            src: src.to_string_lossy().into_owned(),
            dst: "u1/copia.bin".into(),
            policy: Policy {
                id: 4,
                kind: PolicyKind::Local,
                root: dir.join("root").to_string_lossy().into_owned(),
                ..Policy::default()
            },
        };
        let hash = req.hash("site");
        let mut submitted = None;
        let accepted = c
            .submit_task("site", &hash, |master| {
                submitted = Some(master);
            })
            .unwrap();
        assert!(accepted);

        let job = SlaveTransferJob::new(req, hash.clone(), submitted.unwrap(), c.clone(), Arc::new(HmacAuth::new("x")));
        let handle = TaskHandle::detached(job.record());
        TaskPool::new(1).submit(Arc::new(job), handle).await.unwrap();
        (received, c, hash)
    }

    #[tokio::test]
    async fn avisa_exito_y_conserva_la_clave() {
        let dir = temp_dir("ok");
        let src = dir.join("origen.bin");
        fs::write(&src, b"datos").unwrap();

        let (received, c, hash) = run(&dir, src).await;
        assert_eq!(fs::read(dir.join("root/u1/copia.bin")).unwrap(), b"datos");

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, hash);
        assert_eq!(received[0].1.event, SLAVE_TRANSFER_SUCCESS);

        // un reintento del master con el mismo hash no se vuelve a ejecutar
        assert!(!c.submit_task("site", &hash, |_| {}).unwrap());
    }

    #[tokio::test]
    async fn avisa_fallo_con_el_error() {
        let dir = temp_dir("fail");
        let (received, c, hash) = run(&dir, dir.join("no-existe.bin")).await;

        let received = received.lock().unwrap();
        assert_eq!(received[0].1.event, SLAVE_TRANSFER_FAILED);
        let error = received[0].1.content["error"].as_str().unwrap();
        assert!(error.starts_with("Failed to open source file."));
        assert!(!c.submit_task("site", &hash, |_| {}).unwrap());
    }
}
