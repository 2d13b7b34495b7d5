use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{parse_props, Job, JobEnv, JobError, TaskHandle, PROGRESS_COMPRESSING, PROGRESS_TRANSFERRING};
use crate::store::TaskRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressProps {
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    /// Ruta lógica del zip resultante.
    pub dst: String,
    /// Carpeta que limita qué se puede comprimir; vacío sin límite.
    #[serde(default)]
    pub parent: String,
}

/// Empaqueta ficheros y carpetas en un zip y lo sube como fichero nuevo.
pub struct CompressJob {
    owner: u64,
    props: CompressProps,
    env: JobEnv,
}

impl CompressJob {
    pub fn from_record(record: &TaskRecord, env: &JobEnv) -> Result<Self, JobError> {
        Ok(Self {
            owner: record.owner,
            props: parse_props(record)?,
            env: env.clone(),
        })
    }
}

#[async_trait]
impl Job for CompressJob {
    async fn run(&self, handle: &TaskHandle) -> Result<(), JobError> {
        let fs = self
            .env
            .filesystem(self.owner)
            .map_err(|e| JobError::with("Failed to create filesystem.", e))?;

        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let zip_path = self
            .env
            .settings
            .system
            .temp_path
            .join("compress")
            .join(format!("archive_{nanos}.zip"));

        handle.set_progress(PROGRESS_COMPRESSING);
        let res = async {
            let scope = Some(self.props.parent.as_str()).filter(|p| !p.is_empty());
            fs.compress(&self.props.dirs, &self.props.files, scope, &zip_path)
                .await
                .map_err(|e| JobError::with("Failed to compress file.", e))?;

            handle.set_progress(PROGRESS_TRANSFERRING);
            fs.upload_from_path(&zip_path, &self.props.dst)
                .await
                .map_err(|e| JobError::with("Failed to upload file.", e))?;
            Ok(())
        }
        .await;

        // el zip temporal se borra pase lo que pase
        if let Err(e) = tokio::fs::remove_file(&zip_path).await {
            debug!(path = %zip_path.display(), error = %e, "zip temporal no borrado");
        }
        res
    }
}
