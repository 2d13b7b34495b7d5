use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockWriteGuard},
};
use tracing::warn;

use super::{clean_path, FsError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: u64,
    pub owner: u64,
    /// Ruta lógica normalizada, `/` para la raíz.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: u64,
    pub owner: u64,
    /// Carpeta lógica que lo contiene.
    pub dir: String,
    pub name: String,
    pub size: u64,
    /// Ruta física dentro de la política.
    pub source: String,
    pub policy_id: u64,
}

impl FileRecord {
    pub fn path(&self) -> String {
        clean_path(&format!("{}/{}", self.dir, self.name))
    }
}

/// Árbol lógico de carpetas y ficheros de cada propietario.
pub trait Catalog: Send + Sync {
    /// Crea la carpeta y sus padres; si ya existe la devuelve.
    fn create_folder(&self, owner: u64, path: &str) -> Result<Folder, FsError>;
    fn folder(&self, owner: u64, path: &str) -> Option<Folder>;
    /// `Conflict` si ya hay un fichero en esa ruta.
    fn insert_file(&self, file: FileRecord) -> Result<FileRecord, FsError>;
    fn file(&self, owner: u64, path: &str) -> Option<FileRecord>;
    /// Ficheros bajo `dir` a cualquier profundidad.
    fn files_under(&self, owner: u64, dir: &str) -> Vec<FileRecord>;
}

#[derive(Default)]
struct Tree {
    next_id: u64,
    folders: BTreeMap<(u64, String), Folder>,
    files: BTreeMap<(u64, String), FileRecord>,
}

impl Tree {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn from_snapshot(snap: TreeSnapshot) -> Self {
        Self {
            next_id: snap.next_id,
            folders: snap
                .folders
                .into_iter()
                .map(|f| ((f.owner, f.path.clone()), f))
                .collect(),
            files: snap
                .files
                .into_iter()
                .map(|f| ((f.owner, f.path()), f))
                .collect(),
        }
    }

    fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            next_id: self.next_id,
            folders: self.folders.values().cloned().collect(),
            files: self.files.values().cloned().collect(),
        }
    }
}

/// Forma en disco: JSON no admite claves compuestas.
#[derive(Default, Serialize, Deserialize)]
struct TreeSnapshot {
    next_id: u64,
    folders: Vec<Folder>,
    files: Vec<FileRecord>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    tree: RwLock<Tree>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abre (o crea) un catálogo respaldado por un fichero JSON.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FsError> {
        let path = path.as_ref().to_path_buf();
        let tree = if path.exists() {
            let snap: TreeSnapshot = serde_json::from_slice(&fs::read(&path)?)
                .map_err(|e| FsError::Io(e.into()))?;
            Tree::from_snapshot(snap)
        } else {
            Tree::default()
        };
        Ok(Self {
            tree: RwLock::new(tree),
            snapshot_path: Some(path),
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, tree: &Tree) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = save(path, &tree.snapshot()) {
            warn!(path = %path.display(), error = %e, "no se pudo guardar el catálogo");
        }
    }
}

fn save(path: &Path, snap: &TreeSnapshot) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(snap)?)?;
    fs::rename(&tmp, path)
}

impl Catalog for MemoryCatalog {
    fn create_folder(&self, owner: u64, path: &str) -> Result<Folder, FsError> {
        let path = clean_path(path);
        let mut tree = self.write();

        let mut current = String::from("/");
        let mut parts = vec![current.clone()];
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            current = clean_path(&format!("{current}/{seg}"));
            parts.push(current.clone());
        }

        if let Some(p) = parts.iter().find(|p| tree.files.contains_key(&(owner, p.to_string()))) {
            return Err(FsError::Conflict(p.clone()));
        }

        let mut created = false;
        for p in parts {
            if !tree.folders.contains_key(&(owner, p.clone())) {
                let id = tree.next_id();
                tree.folders.insert((owner, p.clone()), Folder { id, owner, path: p });
                created = true;
            }
        }
        if created {
            self.persist(&tree);
        }

        Ok(tree.folders[&(owner, path)].clone())
    }

    fn folder(&self, owner: u64, path: &str) -> Option<Folder> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.folders.get(&(owner, clean_path(path))).cloned()
    }

    fn insert_file(&self, mut file: FileRecord) -> Result<FileRecord, FsError> {
        let mut tree = self.write();
        file.dir = clean_path(&file.dir);
        let path = file.path();

        if !tree.folders.contains_key(&(file.owner, file.dir.clone())) {
            return Err(FsError::ParentNotExist(file.dir.clone()));
        }
        if tree.files.contains_key(&(file.owner, path.clone()))
            || tree.folders.contains_key(&(file.owner, path.clone()))
        {
            return Err(FsError::Conflict(path));
        }

        file.id = tree.next_id();
        tree.files.insert((file.owner, path), file.clone());
        self.persist(&tree);
        Ok(file)
    }

    fn file(&self, owner: u64, path: &str) -> Option<FileRecord> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.files.get(&(owner, clean_path(path))).cloned()
    }

    fn files_under(&self, owner: u64, dir: &str) -> Vec<FileRecord> {
        let dir = clean_path(dir);
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.files
            .values()
            .filter(|f| f.owner == owner && is_within(&f.dir, &dir))
            .cloned()
            .collect()
    }
}

pub(super) fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return true;
    }
    path == dir || path.starts_with(&format!("{dir}/"))
}
