//! Registros persistentes y los almacenes que los guardan.
//!
//! Los servicios del clúster sólo ven los traits; `MemoryStore` es la
//! implementación de referencia y puede volcar su contenido a un JSON para
//! que un master reiniciado recupere sus tareas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};
use thiserror::Error;
use tracing::warn;

use crate::task::{JobError, TaskStatus, TaskType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

/* --------- Nodos --------- */

pub const FEATURE_ARIA2: &str = "aria2";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Aria2Options {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub temp_path: String,
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: u64,
    pub name: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// URL base del nodo, p.ej. `http://slave-1:5212`.
    pub server: String,
    /// Secreto con el que el master firma sus llamadas al esclavo.
    pub slave_key: String,
    /// Secreto con el que el esclavo firma sus llamadas al master.
    pub master_key: String,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub aria2: Aria2Options,
    #[serde(default)]
    pub rank: i32,
}

impl NodeRecord {
    /// Los ids 0 y 1 son del nodo integrado (el propio master).
    pub fn is_system(&self) -> bool {
        self.id <= 1
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/* --------- Políticas de almacenamiento y propietarios --------- */

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub id: u64,
    pub name: String,
    pub kind: PolicyKind,
    /// Directorio raíz de los objetos (local) o servidor remoto.
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub access_token: String,
    /// 0 = sin límite.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub allowed_exts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Owner {
    pub id: u64,
    pub name: String,
    pub capacity: u64,
    pub used: u64,
    pub policy_id: u64,
}

/* --------- Tareas --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: u64,
    pub kind: TaskType,
    pub status: TaskStatus,
    pub progress: u64,
    pub owner: u64,
    /// Propiedades específicas del tipo, en JSON.
    pub props: String,
    #[serde(default)]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(kind: TaskType, owner: u64, props: String) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            kind,
            status: TaskStatus::Queued,
            progress: 0,
            owner,
            props,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/* --------- Traits de almacenamiento --------- */

pub trait TaskStore: Send + Sync {
    /// Inserta el registro y le asigna id.
    fn create_task(&self, record: TaskRecord) -> Result<TaskRecord, StoreError>;
    fn update_task(&self, record: &TaskRecord) -> Result<(), StoreError>;
    fn get_task(&self, id: u64) -> Result<TaskRecord, StoreError>;
    fn list_tasks(&self) -> Vec<TaskRecord>;
    fn tasks_by_status(&self, statuses: &[TaskStatus]) -> Vec<TaskRecord>;
}

pub trait NodeStore: Send + Sync {
    /// Inserta (id 0) o reemplaza un nodo; devuelve el registro guardado.
    fn save_node(&self, record: NodeRecord) -> Result<NodeRecord, StoreError>;
    fn get_node(&self, id: u64) -> Result<NodeRecord, StoreError>;
    fn delete_node(&self, id: u64) -> Result<(), StoreError>;
    fn list_nodes(&self) -> Vec<NodeRecord>;
}

pub trait PolicyStore: Send + Sync {
    fn save_policy(&self, policy: Policy) -> Result<Policy, StoreError>;
    fn get_policy(&self, id: u64) -> Result<Policy, StoreError>;
}

pub trait OwnerStore: Send + Sync {
    fn save_owner(&self, owner: Owner) -> Result<Owner, StoreError>;
    fn get_owner(&self, id: u64) -> Result<Owner, StoreError>;
    /// Suma (o resta) bytes al uso del propietario.
    fn add_usage(&self, id: u64, delta: i64) -> Result<Owner, StoreError>;
}

/* --------- Implementación en memoria --------- */

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    site_id: String,
    next_id: u64,
    tasks: BTreeMap<u64, TaskRecord>,
    nodes: BTreeMap<u64, NodeRecord>,
    policies: BTreeMap<u64, Policy>,
    owners: BTreeMap<u64, Owner>,
}

impl Snapshot {
    fn next_id(&mut self) -> u64 {
        // los ids 0 y 1 quedan reservados
        self.next_id = self.next_id.max(1) + 1;
        self.next_id
    }
}

pub struct MemoryStore {
    data: RwLock<Snapshot>,
    snapshot_path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Snapshot::default()),
            snapshot_path: None,
        }
    }

    /// Abre (o crea) un almacén respaldado por un fichero JSON.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            Snapshot::default()
        };
        Ok(Self {
            data: RwLock::new(data),
            snapshot_path: Some(path),
        })
    }

    /// Identificador del sitio; se genera y guarda la primera vez.
    pub fn site_id(&self, generate: impl FnOnce() -> String) -> Result<String, StoreError> {
        let current = self.read().site_id.clone();
        if !current.is_empty() {
            return Ok(current);
        }
        self.write(|d| {
            if d.site_id.is_empty() {
                d.site_id = generate();
            }
            Ok(d.site_id.clone())
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write<R>(&self, f: impl FnOnce(&mut Snapshot) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let out = f(&mut data)?;
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = persist(path, &data) {
                warn!(path = %path.display(), error = %e, "no se pudo guardar el snapshot");
            }
        }
        Ok(out)
    }
}

fn persist(path: &Path, data: &Snapshot) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl TaskStore for MemoryStore {
    fn create_task(&self, mut record: TaskRecord) -> Result<TaskRecord, StoreError> {
        self.write(|d| {
            record.id = d.next_id();
            d.tasks.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn update_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.write(|d| match d.tasks.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                slot.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound { kind: "task", id: record.id }),
        })
    }

    fn get_task(&self, id: u64) -> Result<TaskRecord, StoreError> {
        self.read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "task", id })
    }

    fn list_tasks(&self) -> Vec<TaskRecord> {
        self.read().tasks.values().cloned().collect()
    }

    fn tasks_by_status(&self, statuses: &[TaskStatus]) -> Vec<TaskRecord> {
        self.read()
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect()
    }
}

impl NodeStore for MemoryStore {
    fn save_node(&self, mut record: NodeRecord) -> Result<NodeRecord, StoreError> {
        self.write(|d| {
            if record.id == 0 && record.kind == NodeKind::Slave {
                record.id = d.next_id();
            }
            d.nodes.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn get_node(&self, id: u64) -> Result<NodeRecord, StoreError> {
        self.read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "node", id })
    }

    fn delete_node(&self, id: u64) -> Result<(), StoreError> {
        self.write(|d| {
            d.nodes
                .remove(&id)
                .map(|_| ())
                .ok_or(StoreError::NotFound { kind: "node", id })
        })
    }

    fn list_nodes(&self) -> Vec<NodeRecord> {
        self.read().nodes.values().cloned().collect()
    }
}

impl PolicyStore for MemoryStore {
    fn save_policy(&self, mut policy: Policy) -> Result<Policy, StoreError> {
        self.write(|d| {
            if policy.id == 0 {
                policy.id = d.next_id();
            }
            d.policies.insert(policy.id, policy.clone());
            Ok(policy)
        })
    }

    fn get_policy(&self, id: u64) -> Result<Policy, StoreError> {
        self.read()
            .policies
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "policy", id })
    }
}

impl OwnerStore for MemoryStore {
    fn save_owner(&self, mut owner: Owner) -> Result<Owner, StoreError> {
        self.write(|d| {
            if owner.id == 0 {
                owner.id = d.next_id();
            }
            d.owners.insert(owner.id, owner.clone());
            Ok(owner)
        })
    }

    fn get_owner(&self, id: u64) -> Result<Owner, StoreError> {
        self.read()
            .owners
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "owner", id })
    }

    fn add_usage(&self, id: u64, delta: i64) -> Result<Owner, StoreError> {
        self.write(|d| match d.owners.get_mut(&id) {
            Some(owner) => {
                owner.used = if delta >= 0 {
                    owner.used.saturating_add(delta as u64)
                } else {
                    owner.used.saturating_sub(delta.unsigned_abs())
                };
                Ok(owner.clone())
            }
            None => Err(StoreError::NotFound { kind: "owner", id }),
        })
    }
}
