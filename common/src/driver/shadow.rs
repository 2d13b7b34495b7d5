use async_trait::async_trait;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use super::{ContentResponse, DriverError, FileStream, Handler, ObjectInfo, ObjectReader, UploadCredential};
use crate::cluster::Node;
use crate::mq::{MqError, NotificationBus};
use crate::rpc;
use crate::serializer::{SlaveTransferReq, SlaveTransferResult, SLAVE_TRANSFER_SUCCESS};
use crate::store::Policy;

/// Driver "sombra" del master: las subidas se ejecutan en un esclavo y el
/// resultado llega por el bus de notificaciones.
pub struct ShadowDriver {
    node: Arc<dyn Node>,
    handler: Arc<dyn Handler>,
    policy: Policy,
    client: rpc::Client,
    bus: NotificationBus,
    site_id: String,
    wait_timeout: Duration,
}

impl ShadowDriver {
    pub fn new(
        node: Arc<dyn Node>,
        handler: Arc<dyn Handler>,
        policy: Policy,
        client: rpc::Client,
        bus: NotificationBus,
        site_id: &str,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            node,
            handler,
            policy,
            client,
            bus,
            site_id: site_id.to_string(),
            wait_timeout,
        }
    }
}

fn remote_error(content: &Value) -> String {
    serde_json::from_value::<SlaveTransferResult>(content.clone())
        .map(|r| r.error)
        .unwrap_or_else(|_| content.to_string())
}

#[async_trait]
impl Handler for ShadowDriver {
    async fn put(&self, file: FileStream) -> Result<(), DriverError> {
        let req = SlaveTransferReq {
            src: file.src,
            dst: file.save_path,
            policy: self.policy.clone(),
        };
        let hash = req.hash(&self.site_id);

        // suscribirse antes de enviar para no perder el aviso
        let mut sub = self.bus.subscribe(&hash);

        let resp = self.client.put("task/transfer", &req).await?;
        if !resp.is_ok() {
            return Err(DriverError::Remote(resp.error_text()));
        }
        debug!(node = self.node.id(), hash = %hash, "transferencia delegada, esperando resultado");

        match sub.recv_timeout(self.wait_timeout).await {
            Ok(msg) if msg.event == SLAVE_TRANSFER_SUCCESS => Ok(()),
            Ok(msg) => Err(DriverError::Remote(remote_error(&msg.content))),
            Err(MqError::Timeout) => {
                warn!(node = self.node.id(), hash = %hash, "sin respuesta del esclavo");
                Err(DriverError::WaitResultTimeout)
            }
            Err(MqError::Closed) => Err(DriverError::Remote("notification bus closed".into())),
        }
    }

    async fn delete(&self, paths: &[String]) -> Result<Vec<String>, DriverError> {
        self.handler.delete(paths).await
    }

    async fn get(&self, _path: &str) -> Result<ObjectReader, DriverError> {
        Err(DriverError::NotImplemented)
    }

    async fn thumb(&self, _path: &str) -> Result<ContentResponse, DriverError> {
        Err(DriverError::NotImplemented)
    }

    async fn source(
        &self,
        _path: &str,
        _ttl: Duration,
        _is_download: bool,
        _speed_limit: u64,
    ) -> Result<String, DriverError> {
        Err(DriverError::NotImplemented)
    }

    async fn token(
        &self,
        _ttl: Duration,
        _session_id: &str,
        _file: &FileStream,
    ) -> Result<UploadCredential, DriverError> {
        Err(DriverError::NotImplemented)
    }

    async fn cancel_token(&self, _session_id: &str) -> Result<(), DriverError> {
        Err(DriverError::NotImplemented)
    }

    async fn list(&self, _base: &str, _recursive: bool) -> Result<Vec<ObjectInfo>, DriverError> {
        Err(DriverError::NotImplemented)
    }
}
