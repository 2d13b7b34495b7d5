//! Cliente HTTP entre nodos: firma cada petición y decodifica el sobre
//! `{code, data, msg, error}`.

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, Url,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

use crate::auth::{sign_request, Auth};
use crate::serializer::Response;

pub const SITE_ID_HEADER: &str = "X-Stratus-Site-Id";
pub const SITE_URL_HEADER: &str = "X-Stratus-Site-Url";
pub const NODE_ID_HEADER: &str = "X-Stratus-Node-Id";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    Status(u16),

    #[error("invalid endpoint {0}")]
    Endpoint(String),

    #[error("invalid header {0}")]
    Header(String),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{msg}")]
    Business {
        code: i32,
        msg: String,
        error: Option<String>,
    },
}

impl RpcError {
    pub fn from_response(resp: &Response) -> Self {
        RpcError::Business {
            code: resp.code,
            msg: resp.msg.clone(),
            error: resp.error.clone(),
        }
    }
}

#[derive(Clone)]
struct Credential {
    auth: Arc<dyn Auth>,
    ttl: i64,
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    endpoint: Url,
    credential: Option<Credential>,
    headers: HeaderMap,
}

pub struct ClientBuilder {
    endpoint: String,
    timeout: Duration,
    credential: Option<Credential>,
    headers: Vec<(String, String)>,
}

impl ClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Firma todas las peticiones con `auth`; `ttl` en segundos (0 = sin caducidad).
    pub fn credential(mut self, auth: Arc<dyn Auth>, ttl: i64) -> Self {
        self.credential = Some(Credential { auth, ttl });
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Cabeceras que identifican al master ante el esclavo.
    pub fn master_meta(self, site_id: &str, site_url: &str) -> Self {
        self.header(SITE_ID_HEADER, site_id)
            .header(SITE_URL_HEADER, site_url)
    }

    /// Cabecera que identifica al esclavo ante el master.
    pub fn slave_meta(self, node_id: u64) -> Self {
        self.header(NODE_ID_HEADER, node_id.to_string())
    }

    pub fn build(self) -> Result<Client, RpcError> {
        let mut raw = self.endpoint.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let endpoint = Url::parse(&raw).map_err(|e| RpcError::Endpoint(format!("{raw}: {e}")))?;

        let mut headers = HeaderMap::new();
        for (k, v) in self.headers {
            let name = HeaderName::from_bytes(k.as_bytes()).map_err(|_| RpcError::Header(k.clone()))?;
            let value = HeaderValue::from_str(&v).map_err(|_| RpcError::Header(k.clone()))?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder().timeout(self.timeout).build()?;
        Ok(Client {
            http,
            endpoint,
            credential: self.credential,
            headers,
        })
    }
}

impl Client {
    pub fn builder(endpoint: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            credential: None,
            headers: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn url(&self, path: &str) -> Result<Url, RpcError> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| RpcError::Endpoint(format!("{path}: {e}")))
    }

    /// Envía la petición y devuelve el sobre tal cual (código incluido).
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<Response, RpcError> {
        let url = self.url(path)?;
        let mut builder = self
            .http
            .request(method.clone(), url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let mut req = builder.build()?;

        if let Some(cred) = &self.credential {
            sign_request(cred.auth.as_ref(), &mut req, cred.ttl);
        }

        debug!(%method, url = %req.url(), "rpc");
        let resp = self.http.execute(req).await?;
        if !resp.status().is_success() {
            return Err(RpcError::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<Response>().await?)
    }

    pub async fn get(&self, path: &str) -> Result<Response, RpcError> {
        self.request::<()>(Method::GET, path, None).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Response, RpcError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Response, RpcError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Response, RpcError> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response, RpcError> {
        self.request::<()>(Method::DELETE, path, None).await
    }
}

/// Extrae `data` si el código es 0; si no, error de negocio.
pub fn into_data<T: DeserializeOwned>(resp: Response) -> Result<T, RpcError> {
    if !resp.is_ok() {
        return Err(RpcError::from_response(&resp));
    }
    Ok(resp.decode_data()?)
}
