mod handlers;
mod state;

use anyhow::Context;
use common::{logging, Settings};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ruta del fichero de configuración: primer argumento o STRATUS_CONFIG
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STRATUS_CONFIG").ok());
    let settings = Settings::load(path.as_deref()).context("configuración inválida")?;
    settings.validate()?;
    logging::init(&settings.log);

    let listen = settings.system.listen.clone();
    let state = AppState::build(settings)?;
    let resumed = state.tasks.resume();
    if resumed > 0 {
        info!(resumed, "tareas pendientes reanudadas");
    }

    let app = handlers::build_router(state.clone()).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {listen}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.nodes.shutdown();
    info!("master detenido");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "no se pudo escuchar ctrl-c");
    }
}
