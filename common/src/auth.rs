//! Firma y verificación de las llamadas entre nodos.
//!
//! Una firma tiene la forma `base64url(HMAC-SHA256(k, contenido:expira)):expira`.
//! `expira = 0` significa que nunca caduca.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response as HttpResponse},
};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::serializer::{
    RequestSignString, Response, CODE_CHECK_LOGIN, CODE_INVALID_SIGN, CODE_NO_PERMISSION,
    CODE_PARAM_ERR, CODE_SIGN_EXPIRED,
};

type HmacSha256 = Hmac<Sha256>;

/// Las cabeceras con este prefijo entran en la firma.
pub const HEADER_PREFIX: &str = "X-Stratus-";
pub const FILENAME_HEADER: &str = "X-Stratus-Filename";
/// En las subidas al esclavo el cuerpo no se firma.
pub const SLAVE_UPLOAD_PATH: &str = "/api/v1/slave/upload/";
/// Tamaño máximo de cuerpo que el middleware lee para verificar.
pub const MAX_SIGNED_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid sign")]
    InvalidSign,

    #[error("authorization header is missing")]
    HeaderMissing,

    #[error("expire timestamp is missing")]
    ExpiresMissing,

    #[error("signature expired")]
    Expired,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),
}

impl AuthError {
    pub fn code(&self) -> i32 {
        match self {
            AuthError::InvalidSign => CODE_INVALID_SIGN,
            AuthError::Expired => CODE_SIGN_EXPIRED,
            AuthError::HeaderMissing | AuthError::ExpiresMissing => CODE_NO_PERMISSION,
            AuthError::UnknownNode(_) => CODE_CHECK_LOGIN,
            AuthError::InvalidUri(_) => CODE_PARAM_ERR,
        }
    }
}

pub trait Auth: Send + Sync {
    /// Firma `content`; `expires` es un timestamp unix absoluto (0 = nunca).
    fn sign(&self, content: &str, expires: i64) -> String;
    fn check(&self, content: &str, sign: &str) -> Result<(), AuthError>;
}

#[derive(Clone)]
pub struct HmacAuth {
    secret: Vec<u8>,
}

impl HmacAuth {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, content: &str, expires: i64) -> Result<HmacSha256, AuthError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidSign)?;
        mac.update(format!("{content}:{expires}").as_bytes());
        Ok(mac)
    }
}

impl Auth for HmacAuth {
    /// Si la clave no sirve la firma sale vacía y nunca verifica.
    fn sign(&self, content: &str, expires: i64) -> String {
        let sig = self
            .mac(content, expires)
            .map(|mac| URL_SAFE.encode(mac.finalize().into_bytes()))
            .unwrap_or_default();
        format!("{sig}:{expires}")
    }

    fn check(&self, content: &str, sign: &str) -> Result<(), AuthError> {
        let (sig, expires) = sign.rsplit_once(':').ok_or(AuthError::ExpiresMissing)?;
        let expires: i64 = expires.parse().map_err(|_| AuthError::ExpiresMissing)?;

        if expires != 0 && expires < now() {
            return Err(AuthError::Expired);
        }

        let raw = URL_SAFE.decode(sig).map_err(|_| AuthError::InvalidSign)?;
        self.mac(content, expires)?
            .verify_slice(&raw)
            .map_err(|_| AuthError::InvalidSign)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn expires_at(ttl: i64) -> i64 {
    if ttl > 0 {
        now() + ttl
    } else {
        0
    }
}

/* --------- Peticiones complejas --------- */

/// Cadena a firmar: ruta, cabeceras `X-Stratus-*` ordenadas y cuerpo.
pub fn sign_content(path: &str, headers: &HeaderMap, body: &[u8]) -> String {
    let prefix = HEADER_PREFIX.to_ascii_lowercase();
    let filename = FILENAME_HEADER.to_ascii_lowercase();

    let mut signed: Vec<String> = headers
        .keys()
        .filter(|k| k.as_str().starts_with(&prefix) && k.as_str() != filename)
        .map(|k| {
            let value = headers
                .get(k)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            format!("{}={}", k.as_str(), value)
        })
        .collect();
    signed.sort();

    let body = if path.contains(SLAVE_UPLOAD_PATH) {
        String::new()
    } else {
        String::from_utf8_lossy(body).into_owned()
    };

    RequestSignString::encode(path, &signed.join("&"), &body)
}

/// Firma una petición saliente y añade `Authorization: Bearer <firma>`.
pub fn sign_request(auth: &dyn Auth, req: &mut reqwest::Request, ttl: i64) {
    let body = req
        .body()
        .and_then(|b| b.as_bytes())
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let content = sign_content(req.url().path(), req.headers(), &body);
    let sign = auth.sign(&content, expires_at(ttl));

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {sign}")) {
        req.headers_mut().insert(AUTHORIZATION, value);
    }
}

/// Verifica una petición entrante ya leída.
pub fn check_request(
    auth: &dyn Auth,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AuthError> {
    let sign = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::HeaderMissing)?;
    let sign = sign.strip_prefix("Bearer ").unwrap_or(sign);

    auth.check(&sign_content(path, headers, body), sign)
}

/* --------- URIs firmadas --------- */

/// Firma sólo la ruta y añade el parámetro `sign`.
pub fn sign_uri(auth: &dyn Auth, uri: &str, ttl: i64) -> Result<Url, AuthError> {
    let mut url = Url::parse(uri).map_err(|e| AuthError::InvalidUri(e.to_string()))?;
    let sign = auth.sign(url.path(), expires_at(ttl));

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "sign")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair("sign", &sign);

    Ok(url)
}

pub fn check_uri(auth: &dyn Auth, url: &Url) -> Result<(), AuthError> {
    let sign = url
        .query_pairs()
        .find(|(k, _)| k == "sign")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default();
    auth.check(url.path(), &sign)
}

/* --------- Middleware axum --------- */

/// Decide qué clave verifica una petición entrante.
pub trait AuthSource: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Result<Arc<dyn Auth>, AuthError>;
}

impl AuthSource for HmacAuth {
    fn resolve(&self, _headers: &HeaderMap) -> Result<Arc<dyn Auth>, AuthError> {
        Ok(Arc::new(self.clone()))
    }
}

/// Rechaza con el sobre estándar cualquier petición mal firmada.
///
/// En las subidas al esclavo el cuerpo no se firma, así que pasa sin leerse.
pub async fn verify_request(
    State(source): State<Arc<dyn AuthSource>>,
    req: Request,
    next: Next,
) -> HttpResponse {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path();

    let (bytes, body) = if path.contains(SLAVE_UPLOAD_PATH) {
        (Bytes::new(), body)
    } else {
        match axum::body::to_bytes(body, MAX_SIGNED_BODY).await {
            Ok(b) => (b.clone(), Body::from(b)),
            Err(e) => {
                return Response::err(CODE_PARAM_ERR, "failed to read request body", Some(e.to_string()))
                    .into_response()
            }
        }
    };

    let checked = source
        .resolve(&parts.headers)
        .and_then(|auth| check_request(auth.as_ref(), path, &parts.headers, &bytes));
    if let Err(e) = checked {
        debug!(path = %path, error = %e, "firma rechazada");
        return Response::err(e.code(), e.to_string(), None).into_response();
    }

    next.run(Request::from_parts(parts, body)).await
}
