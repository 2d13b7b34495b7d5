//! Cadena de generadores de miniaturas.
//!
//! Los generadores se prueban en orden de prioridad (menor primero). Uno
//! puede pasar el turno (`PassThrough`) o devolver un resultado intermedio
//! con `continues`, que se convierte en la entrada del siguiente.

mod command;

pub use command::{CommandGenerator, CommandKind};

use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;

use crate::config::ThumbConfig;

pub type ThumbOptions = HashMap<String, String>;
pub type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Debug, Error)]
pub enum ThumbError {
    #[error("pass through: {0}")]
    PassThrough(String),

    #[error("thumbnail not available")]
    NotAvailable,

    #[error("failed to open intermediate thumb file: {0}")]
    Intermediate(std::io::Error),

    #[error("thumb command failed: {0}")]
    Command(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThumbError {
    /// `NotAvailable` también cuenta como pasar el turno.
    pub fn is_pass_through(&self) -> bool {
        matches!(self, ThumbError::PassThrough(_) | ThumbError::NotAvailable)
    }
}

/// Entrada de un generador. `src` sólo existe si el original está en disco.
#[derive(Debug, Clone)]
pub struct ThumbSource {
    pub bytes: Vec<u8>,
    pub src: Option<PathBuf>,
    pub name: String,
}

pub struct ThumbResult {
    pub path: PathBuf,
    pub continues: bool,
    pub cleanup: Vec<Cleanup>,
}

impl ThumbResult {
    pub fn done(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            continues: false,
            cleanup: Vec::new(),
        }
    }

    /// Ejecuta los cleanups de un resultado final.
    pub fn finish(self) {
        for f in self.cleanup {
            f();
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, input: &ThumbSource, options: &ThumbOptions) -> Result<ThumbResult, ThumbError>;
    /// Menor valor, antes se ejecuta.
    fn priority(&self) -> i32;
    /// Opción que habilita este generador.
    fn enable_flag(&self) -> &str;
    fn name(&self) -> &str;
}

pub fn is_true_val(v: Option<&String>) -> bool {
    matches!(v.map(String::as_str), Some("1") | Some("true"))
}

pub fn thumb_size(options: &ThumbOptions) -> (u32, u32) {
    let w = options.get("thumb_width").and_then(|v| v.parse().ok()).unwrap_or(400);
    let h = options.get("thumb_height").and_then(|v| v.parse().ok()).unwrap_or(300);
    (w, h)
}

/// Cleanups pendientes; se ejecutan una vez al salir de `generate`.
#[derive(Default)]
struct Deferred(Vec<Cleanup>);

impl Drop for Deferred {
    fn drop(&mut self) {
        for f in self.0.drain(..) {
            f();
        }
    }
}

#[derive(Default, Clone)]
pub struct Pipeline {
    generators: Vec<Arc<dyn Generator>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generadores externos según la configuración.
    pub fn from_config(cfg: &ThumbConfig, temp_path: &Path) -> Self {
        let mut p = Self::new();
        p.register(Arc::new(CommandGenerator::vips(cfg, temp_path)));
        p.register(Arc::new(CommandGenerator::ffmpeg(cfg, temp_path)));
        p.register(Arc::new(CommandGenerator::libreoffice(cfg, temp_path)));
        p
    }

    /// Inserta manteniendo el orden por prioridad (estable).
    pub fn register(&mut self, generator: Arc<dyn Generator>) {
        self.generators.push(generator);
        self.generators.sort_by_key(|g| g.priority());
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    pub async fn generate(&self, input: ThumbSource, options: &ThumbOptions) -> Result<ThumbResult, ThumbError> {
        let mut deferred = Deferred::default();
        let mut current = input;

        for g in &self.generators {
            if !is_true_val(options.get(g.enable_flag())) {
                continue;
            }

            match g.generate(&current, options).await {
                Err(e) if e.is_pass_through() => {
                    debug!(generator = g.name(), file = %current.name, error = %e, "generador pasa el turno");
                }
                Ok(res) if res.continues => {
                    debug!(generator = g.name(), file = %current.name, "resultado intermedio, sigue la cadena");
                    deferred.0.extend(res.cleanup);
                    let bytes = tokio::fs::read(&res.path)
                        .await
                        .map_err(ThumbError::Intermediate)?;
                    let name = res
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    current = ThumbSource {
                        bytes,
                        src: Some(res.path),
                        name,
                    };
                }
                other => return other,
            }
        }

        Err(ThumbError::NotAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env, fs,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("thumb_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    enum Behaviour {
        Continue(PathBuf, Arc<AtomicUsize>),
        Finish(PathBuf),
        Pass,
    }

    struct Fake {
        name: String,
        priority: i32,
        flag: String,
        behaviour: Behaviour,
        seen: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl Generator for Fake {
        async fn generate(&self, input: &ThumbSource, _o: &ThumbOptions) -> Result<ThumbResult, ThumbError> {
            self.seen
                .lock()
                .unwrap()
                .push((self.name.clone(), input.bytes.clone()));
            match &self.behaviour {
                Behaviour::Pass => Err(ThumbError::PassThrough("no soportado".into())),
                Behaviour::Finish(path) => Ok(ThumbResult::done(path.clone())),
                Behaviour::Continue(path, counter) => {
                    fs::write(path, b"intermedio").unwrap();
                    let counter = Arc::clone(counter);
                    Ok(ThumbResult {
                        path: path.clone(),
                        continues: true,
                        cleanup: vec![Box::new(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })],
                    })
                }
            }
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn enable_flag(&self) -> &str {
            &self.flag
        }
        fn name(&self) -> &str {
            &self.name
        }
    }

    type Seen = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    fn fake(name: &str, priority: i32, flag: &str, behaviour: Behaviour, seen: &Seen) -> Arc<dyn Generator> {
        Arc::new(Fake {
            name: name.into(),
            priority,
            flag: flag.into(),
            behaviour,
            seen: Arc::clone(seen),
        })
    }

    fn input() -> ThumbSource {
        ThumbSource {
            bytes: b"original".to_vec(),
            src: None,
            name: "doc.docx".into(),
        }
    }

    fn options(enabled: &[&str]) -> ThumbOptions {
        enabled.iter().map(|f| (f.to_string(), "1".to_string())).collect()
    }

    #[tokio::test]
    async fn intermedio_llega_al_siguiente_habilitado_y_limpia_una_vez() {
        let dir = temp_dir("continue");
        let seen: Seen = Arc::default();
        let cleanups = Arc::new(AtomicUsize::new(0));

        let mut p = Pipeline::new();
        // registrados fuera de orden a propósito
        p.register(fake("tercero", 3, "f3", Behaviour::Finish(dir.join("final.jpg")), &seen));
        p.register(fake("primero", 1, "f1", Behaviour::Continue(dir.join("mid.png"), cleanups.clone()), &seen));
        p.register(fake("segundo", 2, "f2", Behaviour::Finish(dir.join("nunca.jpg")), &seen));

        let res = p.generate(input(), &options(&["f1", "f3"])).await.unwrap();
        assert_eq!(res.path, dir.join("final.jpg"));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        let seen = seen.lock().unwrap();
        let names: Vec<_> = seen.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["primero", "tercero"]);
        assert_eq!(seen[1].1, b"intermedio");
    }

    #[tokio::test]
    async fn pass_through_entrega_la_entrada_original() {
        let dir = temp_dir("pass");
        let seen: Seen = Arc::default();
        let mut p = Pipeline::new();
        p.register(fake("a", 1, "fa", Behaviour::Pass, &seen));
        p.register(fake("b", 2, "fb", Behaviour::Finish(dir.join("out.jpg")), &seen));

        p.generate(input(), &options(&["fa", "fb"])).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].1, b"original");
    }

    #[tokio::test]
    async fn sin_resultado_no_disponible_y_limpia() {
        let dir = temp_dir("none");
        let seen: Seen = Arc::default();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut p = Pipeline::new();
        p.register(fake("a", 1, "fa", Behaviour::Continue(dir.join("mid.png"), cleanups.clone()), &seen));
        p.register(fake("b", 2, "fb", Behaviour::Pass, &seen));

        let err = p.generate(input(), &options(&["fa", "fb"])).await.err().unwrap();
        assert!(matches!(err, ThumbError::NotAvailable));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn orden_estable_con_igual_prioridad() {
        let seen: Seen = Arc::default();
        let mut p = Pipeline::new();
        p.register(fake("x", 5, "f", Behaviour::Pass, &seen));
        p.register(fake("y", 5, "f", Behaviour::Pass, &seen));
        p.register(fake("z", 1, "f", Behaviour::Pass, &seen));
        let names: Vec<_> = p.generators.iter().map(|g| g.name().to_string()).collect();
        assert_eq!(names, vec!["z", "x", "y"]);
    }

    #[test]
    fn tamano_por_defecto() {
        assert_eq!(thumb_size(&ThumbOptions::new()), (400, 300));
        let o = HashMap::from([("thumb_width".to_string(), "128".to_string())]);
        assert_eq!(thumb_size(&o), (128, 300));
    }
}
