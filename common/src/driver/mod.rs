//! Contrato de los drivers de almacenamiento.

mod local;
mod shadow;

pub use local::LocalHandler;
pub use shadow::ShadowDriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::auth::{Auth, AuthError};
use crate::rpc::RpcError;
use crate::serializer::{CODE_INTERNAL, CODE_NOT_FOUND, CODE_NOT_IMPLEMENTED};
use crate::store::{Policy, PolicyKind};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("not implemented")]
    NotImplemented,

    #[error("timed out waiting for slave transfer result")]
    WaitResultTimeout,

    #[error("{0}")]
    Remote(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("unsupported policy type {0:?}")]
    UnsupportedPolicy(PolicyKind),

    #[error("no content to upload")]
    EmptyStream,

    #[error("file size exceeds the policy limit")]
    FileSizeTooBig,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl DriverError {
    pub fn code(&self) -> i32 {
        match self {
            DriverError::NotImplemented => CODE_NOT_IMPLEMENTED,
            DriverError::NotFound(_) => CODE_NOT_FOUND,
            _ => CODE_INTERNAL,
        }
    }
}

/// Fichero a subir. `reader` manda; si no hay, se copia desde `src`, una
/// ruta local del nodo que ejecuta la subida.
pub struct FileStream {
    pub reader: Option<Box<dyn AsyncRead + Send + Sync + Unpin>>,
    pub src: String,
    pub size: u64,
    pub name: String,
    /// Directorio lógico de destino.
    pub virtual_path: String,
    /// Ruta física de destino dentro de la política.
    pub save_path: String,
}

impl FileStream {
    pub fn from_src(src: impl Into<String>, size: u64, name: impl Into<String>) -> Self {
        Self {
            reader: None,
            src: src.into(),
            size,
            name: name.into(),
            virtual_path: String::new(),
            save_path: String::new(),
        }
    }
}

/// Contenido de un objeto; se lee por trozos.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub relative_path: String,
    pub source: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadCredential {
    pub session_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub upload_urls: Vec<String>,
    pub expires: i64,
}

#[derive(Debug, Clone)]
pub struct ContentResponse {
    pub redirect: bool,
    pub url: Option<String>,
    pub content: Option<Vec<u8>>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn put(&self, file: FileStream) -> Result<(), DriverError>;
    /// Devuelve las rutas que no se pudieron borrar.
    async fn delete(&self, paths: &[String]) -> Result<Vec<String>, DriverError>;
    async fn get(&self, path: &str) -> Result<ObjectReader, DriverError>;
    async fn thumb(&self, path: &str) -> Result<ContentResponse, DriverError>;
    /// URL de descarga; `speed_limit` en bytes/s, 0 sin límite.
    async fn source(
        &self,
        path: &str,
        ttl: Duration,
        is_download: bool,
        speed_limit: u64,
    ) -> Result<String, DriverError>;
    /// Credencial de subida para `file` dentro de la sesión.
    async fn token(
        &self,
        ttl: Duration,
        session_id: &str,
        file: &FileStream,
    ) -> Result<UploadCredential, DriverError>;
    async fn cancel_token(&self, session_id: &str) -> Result<(), DriverError>;
    async fn list(&self, base: &str, recursive: bool) -> Result<Vec<ObjectInfo>, DriverError>;
}

/// Elige el driver de una política.
pub fn handler_for_policy(
    policy: &Policy,
    auth: Arc<dyn Auth>,
    site_url: &str,
) -> Result<Arc<dyn Handler>, DriverError> {
    match policy.kind {
        PolicyKind::Local => Ok(Arc::new(LocalHandler::new(policy.clone(), auth, site_url))),
        other => Err(DriverError::UnsupportedPolicy(other)),
    }
}
