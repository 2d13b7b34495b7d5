use common::{
    auth::HmacAuth,
    cluster::SlaveController,
    config::{Mode, SettingsError},
    task::TaskPool,
    Settings,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub controller: Arc<SlaveController>,
    pub pool: TaskPool,
    /// Clave compartida con los masters (`system.secret`).
    pub auth: Arc<HmacAuth>,
}

impl AppState {
    /// Este binario siempre es esclavo: sin secreto no arranca.
    pub fn new(mut settings: Settings) -> Result<Self, SettingsError> {
        settings.system.mode = Mode::Slave;
        settings.validate()?;

        let controller = SlaveController::new(settings.cluster.api_timeout());
        Ok(Self {
            controller: Arc::new(controller),
            pool: TaskPool::new(settings.task.max_worker_num),
            auth: Arc::new(HmacAuth::new(&settings.system.secret)),
            settings: Arc::new(settings),
        })
    }
}
