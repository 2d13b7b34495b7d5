mod handlers;
mod state;

use anyhow::Context;
use common::{config::Mode, logging, Settings};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STRATUS_CONFIG").ok());
    let mut settings = Settings::load(path.as_deref()).context("configuración inválida")?;
    settings.system.mode = Mode::Slave;
    // un esclavo sin secreto no puede verificar a ningún master
    settings.validate()?;
    logging::init(&settings.log);

    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let listen = settings.system.listen.clone();
    let state = AppState::new(settings)?;
    let app = handlers::build_router(state.clone()).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {listen}"))?;
    info!(
        host = %host,
        workers = state.pool.size(),
        "esclavo escuchando en {}",
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "no se pudo escuchar ctrl-c");
            }
        })
        .await?;

    info!("esclavo detenido");
    Ok(())
}
