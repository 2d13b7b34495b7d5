use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    middleware,
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use common::{
    auth::{verify_request, Auth, AuthError, AuthSource, HmacAuth},
    cluster::{ClusterError, DownloadRequest},
    mq::Message,
    rpc::NODE_ID_HEADER,
    serializer::{CODE_FEATURE_DISABLED, CODE_NOT_FOUND},
    store::{NodeKind, NodeRecord, NodeStatus, NodeStore, PolicyStore, FEATURE_ARIA2},
    task::TaskType,
    Response,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let admin_auth: Arc<dyn AuthSource> = Arc::new(HmacAuth::new(&state.settings.system.secret));
    let node_auth: Arc<dyn AuthSource> = Arc::new(NodeKeyResolver {
        store: state.store.clone(),
    });

    let admin = Router::new()
        .route("/api/v1/admin/nodes", get(list_nodes).post(add_node))
        .route("/api/v1/admin/nodes/:id", put(update_node).delete(delete_node))
        .route("/api/v1/admin/nodes/:id/status", patch(toggle_node))
        .route("/api/v1/admin/download", post(create_download))
        .route("/api/v1/tasks", get(list_tasks).post(create_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/files/thumb", get(file_thumb))
        .route_layer(middleware::from_fn_with_state(admin_auth, verify_request));

    let slave = Router::new()
        .route("/api/v1/slave/notification/:subject", put(slave_notification))
        .route("/api/v1/slave/credential/:policy", get(slave_credential))
        .route_layer(middleware::from_fn_with_state(node_auth, verify_request));

    Router::new()
        .route("/health", get(health))
        .merge(admin)
        .merge(slave)
        .with_state(state)
}

/* ---------------- firma de los esclavos ---------------- */

/// Verifica las llamadas de un esclavo con la `master_key` de su registro.
struct NodeKeyResolver {
    store: Arc<dyn NodeStore>,
}

impl AuthSource for NodeKeyResolver {
    fn resolve(&self, headers: &HeaderMap) -> Result<Arc<dyn Auth>, AuthError> {
        let raw = headers
            .get(NODE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let id: u64 = raw
            .parse()
            .map_err(|_| AuthError::UnknownNode(raw.to_string()))?;
        let record = self
            .store
            .get_node(id)
            .map_err(|_| AuthError::UnknownNode(raw.to_string()))?;
        if record.kind != NodeKind::Slave || record.master_key.is_empty() {
            return Err(AuthError::UnknownNode(raw.to_string()));
        }
        Ok(Arc::new(HmacAuth::new(&record.master_key)))
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

/* --------- Nodos --------- */

async fn list_nodes(State(state): State<AppState>) -> Response {
    let nodes: Vec<Value> = state
        .node_service
        .list()
        .into_iter()
        .map(|record| node_view(&state, record))
        .collect();
    Response::ok(nodes)
}

fn node_view(state: &AppState, record: NodeRecord) -> Value {
    let mut view = serde_json::to_value(&record).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut view {
        map.insert("online".into(), Value::Bool(state.nodes.is_active(record.id)));
    }
    view
}

async fn add_node(State(state): State<AppState>, Json(record): Json<NodeRecord>) -> Response {
    result(state.node_service.add(record), ClusterError::code)
}

async fn update_node(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(mut record): Json<NodeRecord>,
) -> Response {
    record.id = id;
    result(state.node_service.update(record), ClusterError::code)
}

#[derive(Debug, Deserialize)]
struct ToggleReq {
    status: NodeStatus,
}

async fn toggle_node(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<ToggleReq>,
) -> Response {
    result(state.node_service.toggle(id, req.status), ClusterError::code)
}

async fn delete_node(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.node_service.delete(id) {
        Ok(()) => Response::empty(),
        Err(e) => Response::err(e.code(), e.to_string(), None),
    }
}

/// Envía una descarga al primer nodo activo con aria2.
async fn create_download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Response {
    let Some(node) = state.nodes.select_by_feature(FEATURE_ARIA2) else {
        return Response::err(CODE_FEATURE_DISABLED, "no node can handle this download", None);
    };
    match node.downloader().create_task(&req).await {
        Ok(gid) => {
            info!(node = node.id(), gid = %gid, "descarga creada");
            Response::ok(serde_json::json!({ "node": node.id(), "gid": gid }))
        }
        Err(e) => Response::err(e.code(), "failed to create download", Some(e.to_string())),
    }
}

/* --------- Tareas --------- */

async fn list_tasks(State(state): State<AppState>) -> Response {
    Response::ok(state.tasks.list())
}

async fn get_task(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.tasks.get(id) {
        Ok(task) => Response::ok(task),
        Err(e) => Response::err(e.code(), e.to_string(), None),
    }
}

#[derive(Debug, Deserialize)]
struct CreateTaskReq {
    kind: TaskType,
    #[serde(default = "default_owner")]
    owner: u64,
    props: Value,
}

fn default_owner() -> u64 {
    1
}

async fn create_task(State(state): State<AppState>, Json(req): Json<CreateTaskReq>) -> Response {
    match state.tasks.submit(req.kind, req.owner, &req.props) {
        Ok(task) => Response::ok(task),
        Err(e) => Response::err(e.code(), "failed to create task", Some(e.to_string())),
    }
}

/* --------- Miniaturas --------- */

#[derive(Debug, Deserialize)]
struct ThumbQuery {
    path: String,
    #[serde(default = "default_owner")]
    owner: u64,
}

async fn file_thumb(
    State(state): State<AppState>,
    Query(q): Query<ThumbQuery>,
) -> axum::response::Response {
    let res = match state.tasks.env().filesystem(q.owner) {
        Ok(fs) => fs.thumbnail(&q.path, &state.thumbs, &state.settings.thumb).await,
        Err(e) => Err(e),
    };
    match res {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(e) => {
            debug!(path = %q.path, error = %e, "miniatura no disponible");
            Response::err(e.code(), "thumbnail not available", Some(e.to_string())).into_response()
        }
    }
}

/* --------- Llamadas de los esclavos --------- */

async fn slave_notification(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Json(msg): Json<Message>,
) -> Response {
    let delivered = state.bus.publish(&subject, msg);
    debug!(subject = %subject, delivered, "notificación de esclavo");
    Response::empty()
}

async fn slave_credential(State(state): State<AppState>, Path(policy): Path<u64>) -> Response {
    match state.store.get_policy(policy) {
        Ok(p) if !p.access_token.is_empty() => Response::ok(p.access_token),
        Ok(_) => Response::err(CODE_NOT_FOUND, "policy has no credential", None),
        Err(e) => Response::err(CODE_NOT_FOUND, "Policy not exist.", Some(e.to_string())),
    }
}

fn result<T: serde::Serialize, E: std::fmt::Display>(
    res: Result<T, E>,
    code: impl Fn(&E) -> i32,
) -> Response {
    match res {
        Ok(data) => Response::ok(data),
        Err(e) => Response::err(code(&e), e.to_string(), None),
    }
}
