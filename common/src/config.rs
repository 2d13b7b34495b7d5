//! Configuración de los nodos.
//!
//! Se carga con el crate `config`: primero los valores por defecto, luego el
//! fichero opcional y por último las variables `STRATUS__SECCION__CLAVE`.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::cluster::HeartbeatPolicy;
use crate::logging::LogConfig;

pub const ENV_PREFIX: &str = "STRATUS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("slave secret is not set, please specify it in config file")]
    MissingSecret,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Master,
    Slave,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub system: SystemConfig,
    pub cluster: ClusterConfig,
    pub task: TaskConfig,
    pub thumb: ThumbConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub mode: Mode,
    pub listen: String,
    /// Identificador del sitio (master).
    pub site_id: String,
    /// URL pública del master; los esclavos la usan para devolver llamadas.
    pub site_url: String,
    /// En el master firma las llamadas de administración; en el esclavo
    /// verifica las llamadas del master.
    pub secret: String,
    pub temp_path: PathBuf,
    /// Fichero JSON donde el master guarda nodos, tareas y políticas.
    pub data_path: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Master,
            listen: "0.0.0.0:5212".to_string(),
            site_id: String::new(),
            site_url: "http://localhost:5212".to_string(),
            secret: String::new(),
            temp_path: PathBuf::from("temp"),
            data_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub ping_interval_secs: u64,
    pub node_retry: u32,
    pub recover_interval_secs: u64,
    /// Timeout de las llamadas RPC y TTL de las credenciales que se firman.
    pub api_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 60,
            node_retry: 3,
            recover_interval_secs: 120,
            api_timeout_secs: 60,
            transfer_timeout_secs: 172_800,
        }
    }
}

impl ClusterConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn credential_ttl(&self) -> i64 {
        self.api_timeout_secs as i64
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            recover_interval: Duration::from_secs(self.recover_interval_secs),
            retry: self.node_retry,
            credential_ttl: self.credential_ttl(),
            api_timeout: self.api_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub max_worker_num: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { max_worker_num: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbConfig {
    pub width: u32,
    pub height: u32,
    pub max_src_size: u64,
    pub vips_enabled: bool,
    pub vips_path: String,
    pub vips_exts: Vec<String>,
    pub ffmpeg_enabled: bool,
    pub ffmpeg_path: String,
    pub ffmpeg_exts: Vec<String>,
    pub libreoffice_enabled: bool,
    pub libreoffice_path: String,
    pub libreoffice_exts: Vec<String>,
}

impl Default for ThumbConfig {
    fn default() -> Self {
        let exts = |list: &str| list.split(',').map(str::to_string).collect::<Vec<_>>();
        Self {
            width: 400,
            height: 300,
            max_src_size: 31_457_280,
            vips_enabled: false,
            vips_path: "vips".to_string(),
            vips_exts: exts("csv,mat,img,hdr,pbm,pgm,ppm,pfm,pnm,svg,svgz,j2k,jp2,jpt,j2c,jpc,gif,png,jpg,jpeg,jpe,webp,tif,tiff,fits,fit,fts,exr,jxl,pdf,heic,heif,avif,svs,vms,vmu,ndpi,scn,mrxs,svslide,bif,raw"),
            ffmpeg_enabled: false,
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_exts: exts("3g2,3gp,asf,asx,avi,divx,flv,m2ts,m2v,m4v,mkv,mov,mp4,mpeg,mpg,mts,mxf,ogv,rm,swf,webm,wmv"),
            libreoffice_enabled: false,
            libreoffice_path: "soffice".to_string(),
            libreoffice_exts: exts("md,ods,ots,fods,uos,xlsx,xml,xls,xlt,dif,dbf,html,slk,csv,xlsm,docx,dotx,doc,dot,rtf,xlsm,xlst,xls,xlw,xlc,xlt,pptx,ppsx,potx,pomx,ppt,pps,ppm,pot,pom"),
        }
    }
}

impl ThumbConfig {
    /// Opciones planas que recibe cada generador de miniaturas.
    pub fn options(&self) -> HashMap<String, String> {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        HashMap::from([
            ("thumb_width".to_string(), self.width.to_string()),
            ("thumb_height".to_string(), self.height.to_string()),
            ("thumb_vips_enabled".to_string(), flag(self.vips_enabled)),
            ("thumb_ffmpeg_enabled".to_string(), flag(self.ffmpeg_enabled)),
            ("thumb_libreoffice_enabled".to_string(), flag(self.libreoffice_enabled)),
        ])
    }
}

impl Settings {
    /// Carga la configuración; `path` es opcional (sin extensión también vale).
    pub fn load(path: Option<&str>) -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.system.mode == Mode::Slave && self.system.secret.is_empty() {
            return Err(SettingsError::MissingSecret);
        }
        Ok(())
    }
}
