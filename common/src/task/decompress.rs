use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{parse_props, Job, JobEnv, JobError, TaskHandle, PROGRESS_DECOMPRESSING};
use crate::store::TaskRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompressProps {
    /// Ruta lógica del zip.
    pub src: String,
    /// Carpeta lógica de destino.
    pub dst: String,
    /// Codificación de los nombres; vacío usa la del propio zip.
    #[serde(default)]
    pub encoding: String,
}

pub struct DecompressJob {
    owner: u64,
    props: DecompressProps,
    env: JobEnv,
}

impl DecompressJob {
    pub fn from_record(record: &TaskRecord, env: &JobEnv) -> Result<Self, JobError> {
        Ok(Self {
            owner: record.owner,
            props: parse_props(record)?,
            env: env.clone(),
        })
    }
}

#[async_trait]
impl Job for DecompressJob {
    async fn run(&self, handle: &TaskHandle) -> Result<(), JobError> {
        let fs = self
            .env
            .filesystem(self.owner)
            .map_err(|e| JobError::with("Failed to create filesystem.", e))?;

        let encoding = self.props.encoding.to_ascii_lowercase();
        if !matches!(encoding.as_str(), "" | "utf-8" | "utf8" | "cp437") {
            warn!(task = handle.id(), encoding = %self.props.encoding, "codificación no soportada, se usan los nombres del zip");
        }

        handle.set_progress(PROGRESS_DECOMPRESSING);
        fs.decompress(&self.props.src, &self.props.dst)
            .await
            .map_err(|e| JobError::with("Failed to decompress file.", e))
    }
}
