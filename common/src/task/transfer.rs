use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tracing::{info, warn};

use super::{parse_props, Job, JobEnv, JobError, TaskHandle};
use crate::driver::FileStream;
use crate::fs::{clean_path, split_path};
use crate::store::TaskRecord;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferProps {
    /// Rutas de origen en el nodo que ejecuta la subida.
    pub src: Vec<String>,
    #[serde(default)]
    pub src_sizes: HashMap<String, u64>,
    /// Prefijo común de los orígenes; con `trim_path` se conserva lo que
    /// cuelga de él.
    #[serde(default)]
    pub parent: String,
    pub dst: String,
    #[serde(default)]
    pub trim_path: bool,
    /// Nodo donde están los orígenes; 0 o 1 es el propio master.
    #[serde(default)]
    pub node_id: u64,
}

impl TransferProps {
    fn destination(&self, src: &str) -> String {
        if self.trim_path {
            let trim = self.parent.replace('\\', "/");
            let src = src.replace('\\', "/");
            clean_path(&format!("{}/{}", self.dst, src.strip_prefix(trim.as_str()).unwrap_or(&src)))
        } else {
            let name = Path::new(src)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            clean_path(&format!("{}/{}", self.dst, name))
        }
    }
}

/// Mueve ficheros de un nodo al almacenamiento del propietario.
pub struct TransferJob {
    owner: u64,
    props: TransferProps,
    env: JobEnv,
}

impl TransferJob {
    pub fn from_record(record: &TaskRecord, env: &JobEnv) -> Result<Self, JobError> {
        Ok(Self {
            owner: record.owner,
            props: parse_props(record)?,
            env: env.clone(),
        })
    }
}

#[async_trait]
impl Job for TransferJob {
    async fn run(&self, handle: &TaskHandle) -> Result<(), JobError> {
        let mut fs = self
            .env
            .filesystem(self.owner)
            .map_err(|e| JobError::with("Failed to create filesystem.", e))?;

        let remote = self.props.node_id > 1;
        if remote {
            let node = self
                .env
                .nodes
                .as_ref()
                .and_then(|pool| pool.get_node_by_id(self.props.node_id))
                .ok_or_else(|| JobError::msg("Invalid slave node."))?;
            let cluster = &self.env.settings.cluster;
            fs.switch_to_shadow(
                node,
                self.env.bus.clone(),
                &self.env.site(),
                &cluster.heartbeat_policy(),
                cluster.transfer_timeout(),
            )
            .map_err(|e| JobError::with("Invalid slave node.", e))?;
        }

        let mut failures = Vec::new();
        let mut success = 0u64;
        for (index, src) in self.props.src.iter().enumerate() {
            handle.set_progress(index as u64);
            let dst = self.props.destination(src);

            let res = if remote {
                let (dir, name) = split_path(&dst);
                let size = self.props.src_sizes.get(src).copied().unwrap_or_default();
                let mut file = FileStream::from_src(src.as_str(), size, name);
                file.virtual_path = dir;
                fs.upload_from_stream(file).await
            } else {
                fs.upload_from_path(Path::new(src), &dst).await
            };

            match res {
                Ok(_) => {
                    success += 1;
                    handle.set_progress(success);
                }
                Err(e) => {
                    warn!(task = handle.id(), src = %src, error = %e, "no se pudo transferir");
                    failures.push(format!("{src}: {e}"));
                }
            }
        }

        info!(task = handle.id(), success, failed = failures.len(), "transferencia terminada");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(JobError::with("Failed to transfer one or more file(s).", failures.join("\n")))
        }
    }
}
