//! Motor de tareas en segundo plano.
//!
//! Una tarea persistida pasa por `queued → processing → finished | error`.
//! El `TaskService` la registra, construye el trabajo a partir del tipo con
//! el `JobRegistry` y lo entrega al `TaskPool`, que limita cuántas corren a
//! la vez. Al arrancar, `resume` vuelve a encolar lo que quedó pendiente.

mod compress;
mod decompress;
mod import;
mod pool;
mod slave;
mod transfer;

pub use compress::{CompressJob, CompressProps};
pub use decompress::{DecompressJob, DecompressProps};
pub use import::{ImportJob, ImportProps};
pub use pool::TaskPool;
pub use slave::SlaveTransferJob;
pub use transfer::{TransferJob, TransferProps};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::Auth;
use crate::cluster::{NodePool, SiteInfo};
use crate::config::Settings;
use crate::driver::handler_for_policy;
use crate::fs::{Catalog, FileSystem, FsError};
use crate::mq::NotificationBus;
use crate::serializer::{CODE_CREATE_TASK_ERROR, CODE_NOT_FOUND};
use crate::store::{Owner, OwnerStore, Policy, PolicyStore, StoreError, TaskRecord, TaskStore};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Compress,
    Decompress,
    Transfer,
    Import,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Finished,
    Error,
}

/* --------- Progreso --------- */

pub const PROGRESS_PENDING: u64 = 0;
pub const PROGRESS_COMPRESSING: u64 = 2;
pub const PROGRESS_TRANSFERRING: u64 = 3;
pub const PROGRESS_DECOMPRESSING: u64 = 4;
pub const PROGRESS_LISTING: u64 = 5;
pub const PROGRESS_INSERTING: u64 = 6;

pub const FATAL_ERROR: &str = "Fatal error.";

/// Error de un trabajo tal como queda guardado en la tarea.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub msg: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobError {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            error: None,
        }
    }

    pub fn with(msg: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            msg: msg.into(),
            error: Some(cause.to_string()),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(e) if !e.is_empty() => write!(f, "{}: {}", self.msg, e),
            _ => f.write_str(&self.msg),
        }
    }
}

impl std::error::Error for JobError {}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to encode task props: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to create task: {0}")]
    Create(JobError),
}

impl TaskError {
    pub fn code(&self) -> i32 {
        match self {
            TaskError::Store(StoreError::NotFound { .. }) => CODE_NOT_FOUND,
            _ => CODE_CREATE_TASK_ERROR,
        }
    }
}

/* --------- Trabajos --------- */

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, handle: &TaskHandle) -> Result<(), JobError>;
}

pub fn parse_props<T: DeserializeOwned>(record: &TaskRecord) -> Result<T, JobError> {
    serde_json::from_str(&record.props).map_err(|e| JobError::with("Invalid task props.", e))
}

struct HandleInner {
    record: Mutex<TaskRecord>,
    store: Option<Arc<dyn TaskStore>>,
}

/// Acceso del trabajo a su tarea. Los cambios se guardan en el almacén
/// salvo que la tarea no esté persistida (trabajos del esclavo).
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    pub fn persisted(record: TaskRecord, store: Arc<dyn TaskStore>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                record: Mutex::new(record),
                store: Some(store),
            }),
        }
    }

    pub fn detached(record: TaskRecord) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                record: Mutex::new(record),
                store: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.lock().id
    }

    pub fn snapshot(&self) -> TaskRecord {
        self.lock().clone()
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.update(|r| r.status = status);
    }

    pub fn set_progress(&self, progress: u64) {
        self.update(|r| r.progress = progress);
    }

    /// Guarda el error y deja la tarea en `error`.
    pub fn set_error(&self, err: JobError) {
        self.update(|r| {
            r.status = TaskStatus::Error;
            r.error = Some(err);
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskRecord> {
        self.inner.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut TaskRecord)) {
        let snapshot = {
            let mut record = self.lock();
            f(&mut record);
            record.updated_at = chrono::Utc::now();
            record.clone()
        };
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.update_task(&snapshot) {
                warn!(task = snapshot.id, error = %e, "no se pudo guardar la tarea");
            }
        }
    }
}

/* --------- Entorno de los trabajos --------- */

/// Dependencias compartidas que reciben los trabajos al construirse.
#[derive(Clone)]
pub struct JobEnv {
    pub owners: Arc<dyn OwnerStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub catalog: Arc<dyn Catalog>,
    /// Sólo en el master.
    pub nodes: Option<NodePool>,
    pub bus: NotificationBus,
    pub settings: Arc<Settings>,
    pub auth: Arc<dyn Auth>,
}

impl JobEnv {
    pub fn site(&self) -> SiteInfo {
        SiteInfo {
            site_id: self.settings.system.site_id.clone(),
            site_url: self.settings.system.site_url.clone(),
        }
    }

    pub fn filesystem(&self, owner: u64) -> Result<FileSystem, FsError> {
        let owner = self.owners.get_owner(owner)?;
        let policy = self.policies.get_policy(owner.policy_id)?;
        self.filesystem_with_policy(owner, policy)
    }

    pub fn filesystem_with_policy(&self, owner: Owner, policy: Policy) -> Result<FileSystem, FsError> {
        let handler = handler_for_policy(&policy, Arc::clone(&self.auth), &self.settings.system.site_url)?;
        Ok(FileSystem::new(
            owner,
            policy,
            handler,
            Arc::clone(&self.catalog),
            Arc::clone(&self.owners),
            self.settings.system.temp_path.clone(),
        ))
    }
}

/* --------- Registro de tipos --------- */

pub type JobCtor = Arc<dyn Fn(&TaskRecord, &JobEnv) -> Result<Arc<dyn Job>, JobError> + Send + Sync>;

/// Adapta el constructor de un trabajo concreto al registro.
pub fn ctor<J, F>(build: F) -> JobCtor
where
    J: Job + 'static,
    F: Fn(&TaskRecord, &JobEnv) -> Result<J, JobError> + Send + Sync + 'static,
{
    Arc::new(move |rec: &TaskRecord, env: &JobEnv| Ok(Arc::new(build(rec, env)?) as Arc<dyn Job>))
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    ctors: HashMap<TaskType, JobCtor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(TaskType::Compress, ctor(CompressJob::from_record));
        r.register(TaskType::Decompress, ctor(DecompressJob::from_record));
        r.register(TaskType::Transfer, ctor(TransferJob::from_record));
        r.register(TaskType::Import, ctor(ImportJob::from_record));
        r
    }

    pub fn register(&mut self, kind: TaskType, ctor: JobCtor) {
        self.ctors.insert(kind, ctor);
    }

    pub fn build(&self, record: &TaskRecord, env: &JobEnv) -> Result<Arc<dyn Job>, JobError> {
        match self.ctors.get(&record.kind) {
            Some(ctor) => ctor(record, env),
            None => Err(JobError::msg(format!("Unknown task type {:?}.", record.kind))),
        }
    }
}

/* --------- Servicio --------- */

#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    pool: TaskPool,
    registry: Arc<JobRegistry>,
    env: JobEnv,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, pool: TaskPool, registry: JobRegistry, env: JobEnv) -> Self {
        Self {
            store,
            pool,
            registry: Arc::new(registry),
            env,
        }
    }

    pub fn env(&self) -> &JobEnv {
        &self.env
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        self.store.list_tasks()
    }

    pub fn get(&self, id: u64) -> Result<TaskRecord, TaskError> {
        Ok(self.store.get_task(id)?)
    }

    /// Registra una tarea nueva y la encola.
    pub fn submit<P: Serialize>(&self, kind: TaskType, owner: u64, props: &P) -> Result<TaskRecord, TaskError> {
        let record = self
            .store
            .create_task(TaskRecord::new(kind, owner, serde_json::to_string(props)?))?;

        let job = match self.registry.build(&record, &self.env) {
            Ok(job) => job,
            Err(e) => {
                TaskHandle::persisted(record, Arc::clone(&self.store)).set_error(e.clone());
                return Err(TaskError::Create(e));
            }
        };

        info!(task = record.id, kind = ?kind, owner, "tarea encolada");
        self.pool
            .submit(job, TaskHandle::persisted(record.clone(), Arc::clone(&self.store)));
        Ok(record)
    }

    /// Reencola las tareas `queued` y `processing` que quedaron de una
    /// ejecución anterior. Devuelve cuántas se reanudaron.
    pub fn resume(&self) -> usize {
        let pending = self
            .store
            .tasks_by_status(&[TaskStatus::Queued, TaskStatus::Processing]);
        let mut resumed = 0;

        for record in pending {
            let handle = TaskHandle::persisted(record.clone(), Arc::clone(&self.store));
            match self.registry.build(&record, &self.env) {
                Ok(job) => {
                    handle.set_status(TaskStatus::Queued);
                    self.pool.submit(job, handle);
                    resumed += 1;
                }
                Err(e) => {
                    warn!(task = record.id, error = %e, "no se pudo reanudar la tarea");
                    handle.set_error(e);
                }
            }
        }

        if resumed > 0 {
            info!(count = resumed, "tareas reanudadas");
        }
        resumed
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::store::MemoryStore;
    use std::{env, fs, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("task_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    struct Ok2;

    #[async_trait]
    impl Job for Ok2 {
        async fn run(&self, handle: &TaskHandle) -> Result<(), JobError> {
            handle.set_progress(2);
            Ok(())
        }
    }

    fn service(store: Arc<MemoryStore>, env: JobEnv) -> TaskService {
        let mut registry = JobRegistry::with_defaults();
        registry.register(TaskType::Import, ctor(|_: &TaskRecord, _: &JobEnv| Ok(Ok2)));
        TaskService::new(store, TaskPool::new(2), registry, env)
    }

    #[test]
    fn error_de_trabajo_se_muestra_con_causa() {
        assert_eq!(JobError::msg("Fatal error.").to_string(), "Fatal error.");
        assert_eq!(JobError::with("Failed to list files.", "io").to_string(), "Failed to list files.: io");
    }

    #[test]
    fn estados_en_snake_case() {
        assert_eq!(serde_json::to_string(&TaskStatus::Processing).unwrap(), "\"processing\"");
        assert_eq!(serde_json::to_string(&TaskType::Decompress).unwrap(), "\"decompress\"");
    }

    #[tokio::test]
    async fn reanuda_pendientes_y_marca_las_irrecuperables() {
        let dir = temp_dir("resume");
        let f = fixture(&dir, 100);

        let mut processing = TaskRecord::new(TaskType::Import, f.owner.id, "{}".into());
        processing.status = TaskStatus::Processing;
        let processing = f.store.create_task(processing).unwrap();
        let broken = f
            .store
            .create_task(TaskRecord::new(TaskType::Compress, f.owner.id, "no es json".into()))
            .unwrap();
        let mut done = TaskRecord::new(TaskType::Import, f.owner.id, "{}".into());
        done.status = TaskStatus::Finished;
        f.store.create_task(done).unwrap();

        let svc = service(f.store.clone(), f.env.clone());
        assert_eq!(svc.resume(), 1);

        let t = wait_done(&f.store, processing.id).await;
        assert_eq!(t.status, TaskStatus::Finished);
        assert_eq!(t.progress, 2);

        let b = f.store.get_task(broken.id).unwrap();
        assert_eq!(b.status, TaskStatus::Error);
        assert_eq!(b.error.unwrap().msg, "Invalid task props.");
    }

    #[tokio::test]
    async fn submit_con_props_invalidas_falla_al_crear() {
        let dir = temp_dir("submit");
        let f = fixture(&dir, 100);
        let svc = service(f.store.clone(), f.env.clone());

        let err = svc
            .submit(TaskType::Decompress, f.owner.id, &serde_json::json!({"x": 1}))
            .err()
            .unwrap();
        assert_eq!(err.code(), CODE_CREATE_TASK_ERROR);
        assert_eq!(svc.list()[0].status, TaskStatus::Error);

        let ok = svc.submit(TaskType::Import, f.owner.id, &serde_json::json!({})).unwrap();
        assert_eq!(wait_done(&f.store, ok.id).await.status, TaskStatus::Finished);
    }
}
