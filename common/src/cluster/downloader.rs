use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::ClusterError;
use crate::rpc::{self, into_data};
use crate::store::{Aria2Options, FEATURE_ARIA2};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadStatus {
    pub gid: String,
    pub status: String,
    pub total_length: u64,
    pub completed_length: u64,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GidRequest {
    pub gid: String,
}

/// Capacidad de descarga remota de un nodo.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn create_task(&self, req: &DownloadRequest) -> Result<String, ClusterError>;
    async fn status(&self, gid: &str) -> Result<DownloadStatus, ClusterError>;
    async fn cancel(&self, gid: &str) -> Result<(), ClusterError>;
}

pub struct DisabledDownloader;

#[async_trait]
impl Downloader for DisabledDownloader {
    async fn create_task(&self, _req: &DownloadRequest) -> Result<String, ClusterError> {
        Err(ClusterError::FeatureDisabled(FEATURE_ARIA2.to_string()))
    }

    async fn status(&self, _gid: &str) -> Result<DownloadStatus, ClusterError> {
        Err(ClusterError::FeatureDisabled(FEATURE_ARIA2.to_string()))
    }

    async fn cancel(&self, _gid: &str) -> Result<(), ClusterError> {
        Err(ClusterError::FeatureDisabled(FEATURE_ARIA2.to_string()))
    }
}

/* --------- aria2 local vía JSON-RPC --------- */

pub struct Aria2Client {
    http: reqwest::Client,
    server: Url,
    token: String,
    temp_path: String,
}

impl Aria2Client {
    pub fn new(opts: &Aria2Options) -> Result<Self, ClusterError> {
        let server = Url::parse(&opts.server).map_err(|e| ClusterError::Aria2(e.to_string()))?;
        let timeout = match opts.timeout_secs {
            0 => Duration::from_secs(10),
            s => Duration::from_secs(s),
        };
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            server,
            token: opts.token.clone(),
            temp_path: opts.temp_path.clone(),
        })
    }

    async fn call(&self, method: &str, mut params: Vec<Value>) -> Result<Value, ClusterError> {
        if !self.token.is_empty() {
            params.insert(0, json!(format!("token:{}", self.token)));
        }
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        let resp: Value = self
            .http
            .post(self.server.clone())
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = resp.get("error") {
            let msg = err["message"].as_str().unwrap_or("unknown error");
            return Err(ClusterError::Aria2(msg.to_string()));
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn as_u64(v: &Value) -> u64 {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_u64())
        .unwrap_or(0)
}

#[async_trait]
impl Downloader for Aria2Client {
    async fn create_task(&self, req: &DownloadRequest) -> Result<String, ClusterError> {
        let mut options = req.options.clone();
        if !self.temp_path.is_empty() {
            let dir = format!(
                "{}/{}",
                self.temp_path.trim_end_matches('/'),
                uuid::Uuid::new_v4()
            );
            options.insert("dir".to_string(), json!(dir));
        }

        let gid = self
            .call("aria2.addUri", vec![json!([req.url]), Value::Object(options)])
            .await?;
        gid.as_str()
            .map(str::to_string)
            .ok_or_else(|| ClusterError::Aria2("missing gid in response".to_string()))
    }

    async fn status(&self, gid: &str) -> Result<DownloadStatus, ClusterError> {
        let res = self.call("aria2.tellStatus", vec![json!(gid)]).await?;
        Ok(DownloadStatus {
            gid: res["gid"].as_str().unwrap_or(gid).to_string(),
            status: res["status"].as_str().unwrap_or_default().to_string(),
            total_length: as_u64(&res["totalLength"]),
            completed_length: as_u64(&res["completedLength"]),
            error_message: res["errorMessage"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn cancel(&self, gid: &str) -> Result<(), ClusterError> {
        self.call("aria2.forceRemove", vec![json!(gid)]).await?;
        Ok(())
    }
}

/* --------- descargas delegadas en un esclavo --------- */

pub struct RemoteDownloader {
    client: rpc::Client,
}

impl RemoteDownloader {
    pub fn new(client: rpc::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Downloader for RemoteDownloader {
    async fn create_task(&self, req: &DownloadRequest) -> Result<String, ClusterError> {
        Ok(into_data(self.client.post("aria2/task", req).await?)?)
    }

    async fn status(&self, gid: &str) -> Result<DownloadStatus, ClusterError> {
        let req = GidRequest { gid: gid.to_string() };
        Ok(into_data(self.client.post("aria2/status", &req).await?)?)
    }

    async fn cancel(&self, gid: &str) -> Result<(), ClusterError> {
        let req = GidRequest { gid: gid.to_string() };
        let resp = self.client.post("aria2/cancel", &req).await?;
        if !resp.is_ok() {
            return Err(rpc::RpcError::from_response(&resp).into());
        }
        Ok(())
    }
}
