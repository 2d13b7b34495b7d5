use axum::{
    extract::State,
    http::HeaderMap,
    middleware,
    routing::{post, put},
    Json, Router,
};
use common::{
    auth::{verify_request, AuthSource},
    cluster::{ClusterError, DownloadRequest, GidRequest},
    rpc::SITE_ID_HEADER,
    serializer::{NodePingReq, SlaveTransferReq},
    task::{SlaveTransferJob, TaskHandle},
    Response,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let auth: Arc<dyn AuthSource> = state.auth.clone();

    let slave = Router::new()
        .route("/api/v1/slave/heartbeat", post(heartbeat))
        .route("/api/v1/slave/task/transfer", put(create_transfer))
        .route("/api/v1/slave/aria2/task", post(aria2_create))
        .route("/api/v1/slave/aria2/status", post(aria2_status))
        .route("/api/v1/slave/aria2/cancel", post(aria2_cancel))
        .route_layer(middleware::from_fn_with_state(auth, verify_request));

    Router::new()
        .route("/health", axum::routing::get(health))
        .merge(slave)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn site_id(headers: &HeaderMap) -> String {
    headers
        .get(SITE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn fail(e: ClusterError) -> Response {
    Response::err(e.code(), e.to_string(), None)
}

/* ---------------- handlers HTTP ---------------- */

async fn heartbeat(State(state): State<AppState>, Json(req): Json<NodePingReq>) -> Response {
    match state.controller.handle_heartbeat(&req) {
        Ok(resp) => Response::ok(resp),
        Err(e) => fail(e),
    }
}

/// Acepta una transferencia del master; si ya está en curso no hace nada.
async fn create_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SlaveTransferReq>,
) -> Response {
    let site = site_id(&headers);
    let hash = req.hash(&site);

    let controller = Arc::clone(&state.controller);
    let pool = state.pool.clone();
    let auth = state.auth.clone();
    let job_hash = hash.clone();
    let submitted = state.controller.submit_task(&site, &hash, move |master| {
        let job = SlaveTransferJob::new(req, job_hash, master, controller, auth);
        let handle = TaskHandle::detached(job.record());
        pool.submit(Arc::new(job), handle);
    });

    match submitted {
        Ok(true) => {
            info!(site = %site, hash = %hash, "transferencia encolada");
            Response::empty()
        }
        Ok(false) => {
            debug!(site = %site, hash = %hash, "transferencia repetida");
            Response::empty()
        }
        Err(e) => fail(e),
    }
}

/* --------- aria2 --------- */

async fn aria2_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DownloadRequest>,
) -> Response {
    let downloader = match state.controller.get_aria2_instance(&site_id(&headers)) {
        Ok(d) => d,
        Err(e) => return fail(e),
    };
    match downloader.create_task(&req).await {
        Ok(gid) => Response::ok(gid),
        Err(e) => fail(e),
    }
}

async fn aria2_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GidRequest>,
) -> Response {
    let downloader = match state.controller.get_aria2_instance(&site_id(&headers)) {
        Ok(d) => d,
        Err(e) => return fail(e),
    };
    match downloader.status(&req.gid).await {
        Ok(status) => Response::ok(status),
        Err(e) => fail(e),
    }
}

async fn aria2_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GidRequest>,
) -> Response {
    let downloader = match state.controller.get_aria2_instance(&site_id(&headers)) {
        Ok(d) => d,
        Err(e) => return fail(e),
    };
    match downloader.cancel(&req.gid).await {
        Ok(()) => Response::empty(),
        Err(e) => fail(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, extract::Path, http::header};
    use common::{
        auth::{sign_content, Auth, HmacAuth},
        config::Settings,
        mq::Message,
        serializer::{CODE_FEATURE_DISABLED, CODE_MASTER_NOT_FOUND, CODE_OK, SLAVE_TRANSFER_SUCCESS},
        store::{NodeKind, NodeRecord, NodeStatus, Policy, PolicyKind},
    };
    use std::{
        env, fs,
        path::PathBuf,
        sync::Mutex,
        time::Duration,
    };
    use tower::ServiceExt;

    const SECRET: &str = "clave-esclavo";

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("slave_handler_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn app() -> Router {
        let mut settings = Settings::default();
        settings.system.secret = SECRET.into();
        build_router(AppState::new(settings).unwrap())
    }

    fn signed(method: &str, path: &str, body: &str, site: &str) -> axum::http::Request<Body> {
        let mut headers = HeaderMap::new();
        headers.insert(SITE_ID_HEADER, site.parse().unwrap());
        let sign = HmacAuth::new(SECRET).sign(&sign_content(path, &headers, body.as_bytes()), 0);
        axum::http::Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {sign}"))
            .header(SITE_ID_HEADER, site)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn envelope(app: &Router, req: axum::http::Request<Body>) -> Response {
        let resp = app.clone().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn ping(master_url: &str, aria2: bool) -> String {
        let features = if aria2 {
            ["aria2".to_string()].into_iter().collect()
        } else {
            Default::default()
        };
        serde_json::to_string(&NodePingReq {
            site_url: master_url.into(),
            site_id: "site".into(),
            is_update: false,
            credential_ttl: 60,
            node: NodeRecord {
                id: 2,
                name: "esclavo".into(),
                kind: NodeKind::Slave,
                status: NodeStatus::Active,
                server: "http://esclavo".into(),
                slave_key: SECRET.into(),
                master_key: "clave-master".into(),
                features,
                aria2: Default::default(),
                rank: 0,
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn firma_con_clave_vacia_es_rechazada() {
        let app = app();
        let path = "/api/v1/slave/heartbeat";
        let body = ping("http://master", false);
        let mut headers = HeaderMap::new();
        headers.insert(SITE_ID_HEADER, "site".parse().unwrap());
        let sign = HmacAuth::new("").sign(&sign_content(path, &headers, body.as_bytes()), 0);
        let req = axum::http::Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {sign}"))
            .header(SITE_ID_HEADER, "site")
            .body(Body::from(body))
            .unwrap();
        assert_ne!(envelope(&app, req).await.code, CODE_OK);
    }

    #[tokio::test]
    async fn aria2_sin_heartbeat_es_master_desconocido() {
        let app = app();
        let req = signed("POST", "/api/v1/slave/aria2/status", r#"{"gid":"1"}"#, "site");
        assert_eq!(envelope(&app, req).await.code, CODE_MASTER_NOT_FOUND);
    }

    #[tokio::test]
    async fn aria2_deshabilitado_en_el_nodo() {
        let app = app();
        let req = signed("POST", "/api/v1/slave/heartbeat", &ping("http://master", false), "site");
        assert_eq!(envelope(&app, req).await.code, CODE_OK);

        let req = signed("POST", "/api/v1/slave/aria2/cancel", r#"{"gid":"1"}"#, "site");
        assert_eq!(envelope(&app, req).await.code, CODE_FEATURE_DISABLED);
    }

    type Received = Arc<Mutex<Vec<(String, Message)>>>;

    async fn fake_master(received: Received) -> String {
        let app = Router::new().route(
            "/api/v1/slave/notification/:subject",
            put(move |Path(subject): Path<String>, Json(msg): Json<Message>| {
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

    #[tokio::test]
    async fn transferencia_se_ejecuta_y_avisa_al_master() {
        let dir = temp_dir("transfer");
        let src = dir.join("origen.txt");
        fs::write(&src, b"hola").unwrap();

        let received: Received = Arc::default();
        let url = fake_master(received.clone()).await;
        let app = app();
        let req = signed("POST", "/api/v1/slave/heartbeat", &ping(&url, false), "site");
        assert_eq!(envelope(&app, req).await.code, CODE_OK);

        let transfer = SlaveTransferReq {
            src: src.to_string_lossy().into_owned(),
            dst: "u1/destino.txt".into(),
            policy: Policy {
                id: 3,
                kind: PolicyKind::Local,
                root: dir.join("root").to_string_lossy().into_owned(),
                ..Policy::default()
            },
        };
        let body = serde_json::to_string(&transfer).unwrap();
        let req = signed("PUT", "/api/v1/slave/task/transfer", &body, "site");
        assert_eq!(envelope(&app, req).await.code, CODE_OK);

        for _ in 0..100 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, transfer.hash("site"));
        assert_eq!(received[0].1.event, SLAVE_TRANSFER_SUCCESS);
        assert_eq!(fs::read(dir.join("root/u1/destino.txt")).unwrap(), b"hola");
    }
}
