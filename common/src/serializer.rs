use axum::response::{IntoResponse, Json};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::store::{NodeRecord, Policy};

/* --------- Códigos de respuesta --------- */

pub const CODE_OK: i32 = 0;
pub const CODE_NOT_FULLY_SUCCESS: i32 = 203;
pub const CODE_CHECK_LOGIN: i32 = 401;
pub const CODE_NO_PERMISSION: i32 = 403;
pub const CODE_NOT_FOUND: i32 = 404;
pub const CODE_CONFLICT: i32 = 409;
pub const CODE_PARAM_ERR: i32 = 40001;
pub const CODE_SIGN_EXPIRED: i32 = 40005;
pub const CODE_INVALID_SIGN: i32 = 40006;
pub const CODE_CREATE_TASK_ERROR: i32 = 40026;
pub const CODE_MASTER_NOT_FOUND: i32 = 40054;
pub const CODE_FEATURE_DISABLED: i32 = 40056;
pub const CODE_INVALID_ACTION_ON_SYSTEM_NODE: i32 = 40063;
pub const CODE_INTERNAL: i32 = 50000;
pub const CODE_NOT_IMPLEMENTED: i32 = 50002;
pub const CODE_NOT_SET: i32 = -1;

/// Sobre uniforme de todas las respuestas entre nodos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(data: T) -> Self {
        Self {
            code: CODE_OK,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            msg: String::new(),
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self::ok(Value::Null)
    }

    pub fn err(code: i32, msg: impl Into<String>, error: Option<String>) -> Self {
        Self {
            code,
            data: Value::Null,
            msg: msg.into(),
            error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Texto de error a mostrar: la causa si existe, si no el mensaje.
    pub fn error_text(&self) -> String {
        match &self.error {
            Some(e) if !e.is_empty() => e.clone(),
            _ => self.msg.clone(),
        }
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

impl IntoResponse for Response {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Contenido que se firma en las peticiones complejas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSignString {
    pub path: String,
    pub header: String,
    pub body: String,
}

impl RequestSignString {
    pub fn encode(path: &str, header: &str, body: &str) -> String {
        let raw = RequestSignString {
            path: path.to_string(),
            header: header.to_string(),
            body: body.to_string(),
        };
        serde_json::to_string(&raw).unwrap_or_default()
    }
}

/* --------- Heartbeat master -> esclavo --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePingReq {
    pub site_url: String,
    pub site_id: String,
    pub is_update: bool,
    pub credential_ttl: i64,
    pub node: NodeRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePingResp {
    #[serde(default)]
    pub hostname: String,
}

/* --------- Transferencias delegadas --------- */

pub const SLAVE_TRANSFER_SUCCESS: &str = "success";
pub const SLAVE_TRANSFER_FAILED: &str = "failed";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveTransferReq {
    pub src: String,
    pub dst: String,
    pub policy: Policy,
}

impl SlaveTransferReq {
    /// Clave de idempotencia y tema de notificación de la transferencia.
    pub fn hash(&self, site_id: &str) -> String {
        let raw = format!(
            "transfer-{}-{}-{}-{}",
            site_id, self.src, self.dst, self.policy.id
        );
        hex::encode(Sha256::digest(raw.as_bytes()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveTransferResult {
    #[serde(default)]
    pub error: String,
}
