use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::{thumb_size, Cleanup, Generator, ThumbError, ThumbOptions, ThumbResult, ThumbSource};
use crate::config::ThumbConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Vips,
    Ffmpeg,
    LibreOffice,
}

/// Generador que delega en un binario externo.
pub struct CommandGenerator {
    kind: CommandKind,
    bin: String,
    exts: Vec<String>,
    temp_dir: PathBuf,
}

impl CommandGenerator {
    pub fn new(kind: CommandKind, bin: &str, exts: &[String], temp_path: &Path) -> Self {
        Self {
            kind,
            bin: bin.to_string(),
            exts: exts.iter().map(|e| e.trim().to_lowercase()).collect(),
            temp_dir: temp_path.join("thumb"),
        }
    }

    pub fn vips(cfg: &ThumbConfig, temp_path: &Path) -> Self {
        Self::new(CommandKind::Vips, &cfg.vips_path, &cfg.vips_exts, temp_path)
    }

    pub fn ffmpeg(cfg: &ThumbConfig, temp_path: &Path) -> Self {
        Self::new(CommandKind::Ffmpeg, &cfg.ffmpeg_path, &cfg.ffmpeg_exts, temp_path)
    }

    pub fn libreoffice(cfg: &ThumbConfig, temp_path: &Path) -> Self {
        Self::new(CommandKind::LibreOffice, &cfg.libreoffice_path, &cfg.libreoffice_exts, temp_path)
    }

    fn supports(&self, name: &str) -> bool {
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        !ext.is_empty() && self.exts.iter().any(|e| *e == ext)
    }

    /// El original tiene que estar en disco; si sólo hay bytes se vuelcan.
    async fn input_path(&self, input: &ThumbSource, cleanup: &mut Vec<Cleanup>) -> Result<PathBuf, ThumbError> {
        if let Some(src) = &input.src {
            return Ok(src.clone());
        }
        let path = self
            .temp_dir
            .join(format!("{}_{}", uuid::Uuid::new_v4(), input.name));
        tokio::fs::write(&path, &input.bytes).await?;
        cleanup.push(remove_file(path.clone()));
        Ok(path)
    }

    fn command(&self, input: &Path, output_dir: &Path, output: &Path, options: &ThumbOptions) -> Command {
        let (w, h) = thumb_size(options);
        let mut cmd = Command::new(&self.bin);
        match self.kind {
            CommandKind::Vips => {
                cmd.arg("thumbnail")
                    .arg(input)
                    .arg(output)
                    .arg(w.to_string())
                    .arg("--height")
                    .arg(h.to_string());
            }
            CommandKind::Ffmpeg => {
                cmd.args(["-ss", "00:00:01.00", "-i"])
                    .arg(input)
                    .arg("-vf")
                    .arg(format!("scale={w}:{h}:force_original_aspect_ratio=decrease"))
                    .args(["-vframes", "1", "-y"])
                    .arg(output);
            }
            CommandKind::LibreOffice => {
                cmd.args([
                    "--headless",
                    "--nologo",
                    "--nofirststartwizard",
                    "--invisible",
                    "--norestore",
                    "--convert-to",
                    "png",
                    "--outdir",
                ])
                .arg(output_dir)
                .arg(input);
            }
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

fn remove_file(path: PathBuf) -> Cleanup {
    Box::new(move || {
        let _ = std::fs::remove_file(path);
    })
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, input: &ThumbSource, options: &ThumbOptions) -> Result<ThumbResult, ThumbError> {
        if !self.supports(&input.name) {
            return Err(ThumbError::PassThrough(format!(
                "unsupported file extension for {}: {}",
                self.name(),
                input.name
            )));
        }

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let mut cleanup = Vec::new();
        let input_path = self.input_path(input, &mut cleanup).await?;

        // soffice elige el nombre de salida a partir del de entrada
        let output_dir = self.temp_dir.join(uuid::Uuid::new_v4().to_string());
        let output = match self.kind {
            CommandKind::Vips => self.temp_dir.join(format!("{}.jpg", uuid::Uuid::new_v4())),
            CommandKind::Ffmpeg => self.temp_dir.join(format!("{}.png", uuid::Uuid::new_v4())),
            CommandKind::LibreOffice => {
                tokio::fs::create_dir_all(&output_dir).await?;
                let stem = input_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "thumb".to_string());
                let dir = output_dir.clone();
                cleanup.push(Box::new(move || {
                    let _ = std::fs::remove_dir_all(dir);
                }));
                output_dir.join(format!("{stem}.png"))
            }
        };

        debug!(generator = self.name(), input = %input_path.display(), "generando miniatura");
        let failure = match self
            .command(&input_path, &output_dir, &output, options)
            .output()
            .await
        {
            Err(e) => Some(format!("failed to start {}: {e}", self.bin)),
            Ok(out) if !out.status.success() => Some(format!(
                "{} exited with {}: {}",
                self.name(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Ok(_) => None,
        };

        if let Some(msg) = failure {
            for f in cleanup {
                f();
            }
            return Err(ThumbError::Command(msg));
        }

        if self.kind != CommandKind::LibreOffice {
            cleanup.push(remove_file(output.clone()));
        }

        Ok(ThumbResult {
            path: output,
            // el png de soffice sale a tamaño completo y se reescala después
            continues: self.kind == CommandKind::LibreOffice,
            cleanup,
        })
    }

    fn priority(&self) -> i32 {
        match self.kind {
            CommandKind::LibreOffice => 50,
            CommandKind::Vips => 100,
            CommandKind::Ffmpeg => 200,
        }
    }

    fn enable_flag(&self) -> &str {
        match self.kind {
            CommandKind::Vips => "thumb_vips_enabled",
            CommandKind::Ffmpeg => "thumb_ffmpeg_enabled",
            CommandKind::LibreOffice => "thumb_libreoffice_enabled",
        }
    }

    fn name(&self) -> &str {
        match self.kind {
            CommandKind::Vips => "vips",
            CommandKind::Ffmpeg => "ffmpeg",
            CommandKind::LibreOffice => "libreoffice",
        }
    }
}
