use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use super::{parse_props, Job, JobEnv, JobError, TaskHandle, PROGRESS_INSERTING, PROGRESS_LISTING};
use crate::driver::FileStream;
use crate::fs::{clean_path, split_path, Folder, FsError};
use crate::store::TaskRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportProps {
    pub policy_id: u64,
    /// Ruta de origen dentro de la política.
    pub src: String,
    #[serde(default)]
    pub recursive: bool,
    /// Carpeta lógica de destino.
    pub dst: String,
}

/// Da de alta en el catálogo objetos que ya existen en una política.
pub struct ImportJob {
    owner: u64,
    props: ImportProps,
    env: JobEnv,
}

impl ImportJob {
    pub fn from_record(record: &TaskRecord, env: &JobEnv) -> Result<Self, JobError> {
        Ok(Self {
            owner: record.owner,
            props: parse_props(record)?,
            env: env.clone(),
        })
    }
}

#[async_trait]
impl Job for ImportJob {
    async fn run(&self, handle: &TaskHandle) -> Result<(), JobError> {
        let policy = self
            .env
            .policies
            .get_policy(self.props.policy_id)
            .map_err(|e| JobError::with("Policy not exist.", e))?;
        let owner = self
            .env
            .owners
            .get_owner(self.owner)
            .map_err(|e| JobError::with("Failed to create filesystem.", e))?;
        let fs = self
            .env
            .filesystem_with_policy(owner, policy)
            .map_err(|e| JobError::with("Failed to create filesystem.", e))?;

        handle.set_progress(PROGRESS_LISTING);
        let mut objects = fs
            .handler()
            .list(&self.props.src, self.props.recursive)
            .await
            .map_err(|e| JobError::with("Failed to list files.", e))?;

        handle.set_progress(PROGRESS_INSERTING);
        // carpetas primero, así los ficheros ya encuentran a su padre
        objects.sort_by_key(|o| !o.is_dir);

        let dst = clean_path(&self.props.dst);
        let mut folders: HashMap<String, Folder> = HashMap::new();
        let mut imported = 0usize;

        for object in objects.iter().filter(|o| o.is_dir) {
            let path = clean_path(&format!("{dst}/{}", object.relative_path));
            match fs.create_directory(&path) {
                Ok(folder) => {
                    folders.insert(path, folder);
                }
                Err(e) => warn!(task = handle.id(), path = %path, error = %e, "no se pudo crear la carpeta"),
            }
        }

        for object in objects.iter().filter(|o| !o.is_dir) {
            let (dir, name) = split_path(&format!("{dst}/{}", object.relative_path));
            let parent = match folders.get(&dir) {
                Some(folder) => folder.clone(),
                None => match fs.create_directory(&dir) {
                    Ok(folder) => {
                        folders.insert(dir.clone(), folder.clone());
                        folder
                    }
                    Err(e) => {
                        warn!(task = handle.id(), path = %dir, error = %e, "no se pudo crear la carpeta");
                        continue;
                    }
                },
            };

            let mut file = FileStream::from_src("", object.size, name);
            file.save_path = object.source.clone();
            file.virtual_path = dir;

            match fs.add_file(&parent, &file) {
                Ok(_) => imported += 1,
                Err(FsError::InsufficientCapacity) => {
                    return Err(JobError::msg("Insufficient storage capacity."));
                }
                Err(e) => {
                    warn!(task = handle.id(), source = %object.source, error = %e, "fichero no importado");
                }
            }
        }

        info!(task = handle.id(), imported, "importación terminada");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{OwnerStore, Policy, PolicyKind, PolicyStore};
    use crate::task::testutil::{fixture, wait_done};
    use crate::task::{JobRegistry, TaskPool, TaskService, TaskStatus, TaskType, PROGRESS_INSERTING};
    use std::{
        env, fs,
        path::{Path, PathBuf},
    };

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("import_job_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn external_policy(dir: &Path, store: &dyn PolicyStore) -> Policy {
        let root = dir.join("externo");
        fs::create_dir_all(root.join("fotos/2024")).unwrap();
        fs::write(root.join("fotos/a.jpg"), b"aaaa").unwrap();
        fs::write(root.join("fotos/2024/b.jpg"), b"bbbbbb").unwrap();
        store
            .save_policy(Policy {
                id: 0,
                name: "externo".into(),
                kind: PolicyKind::Local,
                root: root.to_string_lossy().into_owned(),
                ..Policy::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn importa_carpetas_y_ficheros() {
        let dir = temp_dir("ok");
        let f = fixture(&dir, 1 << 20);
        let policy = external_policy(&dir, f.store.as_ref());

        let svc = TaskService::new(f.store.clone(), TaskPool::new(1), JobRegistry::with_defaults(), f.env.clone());
        let props = ImportProps { policy_id: policy.id, src: "fotos".into(), recursive: true, dst: "/importado".into() };
        let t = svc.submit(TaskType::Import, f.owner.id, &props).unwrap();
        let t = wait_done(&f.store, t.id).await;

        assert_eq!(t.status, TaskStatus::Finished, "{:?}", t.error);
        assert_eq!(t.progress, PROGRESS_INSERTING);
        let filesystem = f.env.filesystem(f.owner.id).unwrap();
        let b = filesystem.file("/importado/2024/b.jpg").unwrap();
        assert_eq!(b.source, "fotos/2024/b.jpg");
        assert_eq!(b.policy_id, policy.id);
        assert_eq!(f.store.get_owner(f.owner.id).unwrap().used, 10);
    }

    #[tokio::test]
    async fn sin_capacidad_es_fatal() {
        let dir = temp_dir("capacity");
        let f = fixture(&dir, 5);
        let policy = external_policy(&dir, f.store.as_ref());

        let svc = TaskService::new(f.store.clone(), TaskPool::new(1), JobRegistry::with_defaults(), f.env.clone());
        let props = ImportProps { policy_id: policy.id, src: "fotos".into(), recursive: true, dst: "/".into() };
        let t = svc.submit(TaskType::Import, f.owner.id, &props).unwrap();
        let t = wait_done(&f.store, t.id).await;

        assert_eq!(t.status, TaskStatus::Error);
        assert_eq!(t.error.unwrap().msg, "Insufficient storage capacity.");
    }

    #[tokio::test]
    async fn politica_inexistente() {
        let dir = temp_dir("policy");
        let f = fixture(&dir, 100);
        let svc = TaskService::new(f.store.clone(), TaskPool::new(1), JobRegistry::with_defaults(), f.env.clone());
        let props = ImportProps { policy_id: 999, src: "/".into(), recursive: false, dst: "/".into() };
        let t = svc.submit(TaskType::Import, f.owner.id, &props).unwrap();
        let t = wait_done(&f.store, t.id).await;
        assert_eq!(t.error.unwrap().msg, "Policy not exist.");
    }
}
