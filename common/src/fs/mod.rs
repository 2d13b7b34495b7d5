//! Sistema de ficheros lógico de un propietario sobre una política.
//!
//! Une el catálogo (árbol lógico), el driver de la política y la cuota del
//! propietario. Los trabajos de compresión, importación y transferencia
//! trabajan siempre a través de esta fachada.

mod catalog;

pub use catalog::{Catalog, FileRecord, Folder, MemoryCatalog};

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::cluster::{slave_client, ClusterError, HeartbeatPolicy, Node, SiteInfo};
use crate::config::ThumbConfig;
use crate::driver::{ContentResponse, DriverError, FileStream, Handler, ObjectReader, ShadowDriver};
use crate::mq::NotificationBus;
use crate::serializer::{CODE_CONFLICT, CODE_INTERNAL, CODE_NOT_FOUND, CODE_PARAM_ERR};
use crate::store::{Owner, OwnerStore, Policy, StoreError};
use crate::thumb::{Pipeline, ThumbError, ThumbSource};

/// Tamaño de cada trozo leído del driver al comprimir.
const CHUNK_SIZE: usize = 64 * 1024;
const ZIP_QUEUE: usize = 8;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("insufficient storage capacity")]
    InsufficientCapacity,

    #[error("file size exceeds the policy limit")]
    FileSizeTooBig,

    #[error("invalid object name: {0}")]
    IllegalObjectName(String),

    #[error("file extension not allowed: {0}")]
    FileExtensionNotAllowed(String),

    #[error("parent folder {0} does not exist")]
    ParentNotExist(String),

    #[error("object already exists: {0}")]
    Conflict(String),

    #[error("object not found: {0}")]
    ObjectNotExist(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Thumb(#[from] ThumbError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    pub fn code(&self) -> i32 {
        match self {
            FsError::Conflict(_) => CODE_CONFLICT,
            FsError::ObjectNotExist(_) | FsError::ParentNotExist(_) => CODE_NOT_FOUND,
            FsError::IllegalObjectName(_)
            | FsError::FileExtensionNotAllowed(_)
            | FsError::FileSizeTooBig => CODE_PARAM_ERR,
            FsError::Driver(e) => e.code(),
            _ => CODE_INTERNAL,
        }
    }
}

/* --------- Rutas lógicas --------- */

/// Normaliza una ruta lógica: siempre empieza por `/`, sin `.` ni `..`.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Separa una ruta en (carpeta, nombre).
pub fn split_path(path: &str) -> (String, String) {
    let path = clean_path(path);
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
        None => ("/".to_string(), path),
    }
}

/* --------- Hooks --------- */

/// Se ejecuta antes de dar de alta un fichero; un error lo cancela.
pub type Hook = Arc<dyn Fn(&FileSystem, &FileStream) -> Result<(), FsError> + Send + Sync>;

pub fn hook_validate_file(fs: &FileSystem, file: &FileStream) -> Result<(), FsError> {
    let name = file.name.as_str();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) || name.len() > 255 {
        return Err(FsError::IllegalObjectName(file.name.clone()));
    }
    if fs.policy.max_size > 0 && file.size > fs.policy.max_size {
        return Err(FsError::FileSizeTooBig);
    }
    if !fs.policy.allowed_exts.is_empty() {
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !fs.policy.allowed_exts.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
            return Err(FsError::FileExtensionNotAllowed(file.name.clone()));
        }
    }
    Ok(())
}

pub fn hook_validate_capacity(fs: &FileSystem, file: &FileStream) -> Result<(), FsError> {
    let owner = fs.owners.get_owner(fs.owner.id)?;
    if owner.used.saturating_add(file.size) > owner.capacity {
        return Err(FsError::InsufficientCapacity);
    }
    Ok(())
}

/* --------- FileSystem --------- */

pub struct FileSystem {
    pub owner: Owner,
    pub policy: Policy,
    handler: Arc<dyn Handler>,
    catalog: Arc<dyn Catalog>,
    owners: Arc<dyn OwnerStore>,
    hooks: Vec<Hook>,
    temp_path: PathBuf,
}

impl FileSystem {
    pub fn new(
        owner: Owner,
        policy: Policy,
        handler: Arc<dyn Handler>,
        catalog: Arc<dyn Catalog>,
        owners: Arc<dyn OwnerStore>,
        temp_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            owner,
            policy,
            handler,
            catalog,
            owners,
            hooks: vec![
                Arc::new(hook_validate_file) as Hook,
                Arc::new(hook_validate_capacity) as Hook,
            ],
            temp_path: temp_path.into(),
        }
    }

    pub fn use_hook(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    /// A partir de aquí las subidas se ejecutan en el esclavo `node`.
    pub fn switch_to_shadow(
        &mut self,
        node: Arc<dyn Node>,
        bus: NotificationBus,
        site: &SiteInfo,
        heartbeat: &HeartbeatPolicy,
        wait_timeout: Duration,
    ) -> Result<(), FsError> {
        let client = slave_client(&node.record(), heartbeat, site)?;
        debug!(node = node.id(), owner = self.owner.id, "subidas delegadas al esclavo");
        self.handler = Arc::new(ShadowDriver::new(
            node,
            Arc::clone(&self.handler),
            self.policy.clone(),
            client,
            bus,
            &site.site_id,
            wait_timeout,
        ));
        Ok(())
    }

    pub fn create_directory(&self, path: &str) -> Result<Folder, FsError> {
        self.catalog.create_folder(self.owner.id, path)
    }

    pub fn file(&self, path: &str) -> Result<FileRecord, FsError> {
        self.catalog
            .file(self.owner.id, path)
            .ok_or_else(|| FsError::ObjectNotExist(path.to_string()))
    }

    /// Ruta física nueva dentro de la política.
    fn save_path(&self, name: &str) -> String {
        format!("{}/{}_{}", self.owner.id, uuid::Uuid::new_v4().simple(), name)
    }

    fn run_hooks(&self, file: &FileStream) -> Result<(), FsError> {
        self.hooks.iter().try_for_each(|hook| hook(self, file))
    }

    fn insert_record(&self, parent: &Folder, name: String, size: u64, source: String) -> Result<FileRecord, FsError> {
        let record = self.catalog.insert_file(FileRecord {
            id: 0,
            owner: self.owner.id,
            dir: parent.path.clone(),
            name,
            size,
            source,
            policy_id: self.policy.id,
        })?;
        self.owners.add_usage(self.owner.id, size as i64)?;
        Ok(record)
    }

    /// Da de alta un objeto que ya existe en el almacenamiento
    /// (`file.save_path`), pasando por los hooks.
    pub fn add_file(&self, parent: &Folder, file: &FileStream) -> Result<FileRecord, FsError> {
        self.run_hooks(file)?;
        self.insert_record(parent, file.name.clone(), file.size, file.save_path.clone())
    }

    pub async fn upload_from_stream(&self, mut file: FileStream) -> Result<FileRecord, FsError> {
        file.virtual_path = clean_path(&file.virtual_path);
        self.run_hooks(&file)?;
        let parent = self.create_directory(&file.virtual_path)?;
        if file.save_path.is_empty() {
            file.save_path = self.save_path(&file.name);
        }

        let (name, size, source) = (file.name.clone(), file.size, file.save_path.clone());
        self.handler.put(file).await?;

        match self.insert_record(&parent, name, size, source.clone()) {
            Ok(record) => Ok(record),
            Err(e) => {
                // el objeto ya subido queda huérfano si no se borra
                if let Err(de) = self.handler.delete(std::slice::from_ref(&source)).await {
                    warn!(source = %source, error = %de, "no se pudo deshacer la subida");
                }
                Err(e)
            }
        }
    }

    /// Sube un fichero local del nodo a la ruta lógica `dst`.
    pub async fn upload_from_path(&self, src: &Path, dst: &str) -> Result<FileRecord, FsError> {
        let meta = tokio::fs::metadata(src).await?;
        let reader = tokio::fs::File::open(src).await?;
        let (dir, name) = split_path(dst);

        let mut file = FileStream::from_src(src.to_string_lossy(), meta.len(), name);
        file.reader = Some(Box::new(reader));
        file.virtual_path = dir;
        self.upload_from_stream(file).await
    }

    /// Empaqueta ficheros y carpetas lógicas en un zip local. Con `scope`
    /// sólo se aceptan objetos bajo esa carpeta.
    pub async fn compress(
        &self,
        dirs: &[String],
        files: &[String],
        scope: Option<&str>,
        zip_path: &Path,
    ) -> Result<(), FsError> {
        let scope = scope.map(clean_path);
        let in_scope = |path: &str| scope.as_deref().map_or(true, |s| catalog::is_within(path, s));

        let mut entries: Vec<(String, FileRecord)> = Vec::new();
        for path in files {
            let record = self.file(path)?;
            if !in_scope(&record.path()) {
                return Err(FsError::ObjectNotExist(record.path()));
            }
            entries.push((record.name.clone(), record));
        }
        for dir in dirs {
            let dir = clean_path(dir);
            if !in_scope(&dir) || self.catalog.folder(self.owner.id, &dir).is_none() {
                return Err(FsError::ObjectNotExist(dir));
            }
            let (parent, _) = split_path(&dir);
            for record in self.catalog.files_under(self.owner.id, &dir) {
                let inner = record.path();
                let rel = inner
                    .strip_prefix(parent.as_str())
                    .unwrap_or(&inner)
                    .trim_start_matches('/')
                    .to_string();
                entries.push((rel, record));
            }
        }

        if let Some(dir) = zip_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let (tx, rx) = mpsc::channel(ZIP_QUEUE);
        let path = zip_path.to_path_buf();
        let writer = tokio::task::spawn_blocking(move || write_zip(&path, rx));

        let fed = self.feed_zip(entries, &tx).await;
        drop(tx);
        writer.await.map_err(io::Error::other)??;
        fed
    }

    /// Pasa cada fichero al escritor del zip por trozos.
    async fn feed_zip(&self, entries: Vec<(String, FileRecord)>, tx: &mpsc::Sender<ZipChunk>) -> Result<(), FsError> {
        let closed = |_| FsError::Io(io::Error::other("zip writer closed"));
        for (name, record) in entries {
            let mut reader = self.handler.get(&record.source).await?;
            tx.send(ZipChunk::Start(name)).await.map_err(closed)?;
            loop {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                buf.truncate(n);
                tx.send(ZipChunk::Data(buf)).await.map_err(closed)?;
            }
        }
        Ok(())
    }

    /// Extrae el zip lógico `src` bajo la carpeta `dst`.
    pub async fn decompress(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let record = self.file(src)?;
        let mut reader = self.handler.get(&record.source).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let base = self.temp_path.join("decompress");
        let work = base.join(&id);
        let archive = base.join(format!("{id}.zip"));

        let res = self.extract_from(&mut reader, &archive, &work, dst).await;
        let _ = tokio::fs::remove_file(&archive).await;
        let _ = tokio::fs::remove_dir_all(&work).await;
        res
    }

    async fn extract_from(
        &self,
        reader: &mut ObjectReader,
        archive: &Path,
        work: &Path,
        dst: &str,
    ) -> Result<(), FsError> {
        if let Some(dir) = archive.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut out = tokio::fs::File::create(archive).await?;
        tokio::io::copy(reader, &mut out).await?;
        out.flush().await?;
        drop(out);

        let (archive_path, target) = (archive.to_path_buf(), work.to_path_buf());
        let entries = tokio::task::spawn_blocking(move || extract_zip(&archive_path, &target))
            .await
            .map_err(io::Error::other)??;
        self.upload_extracted(work, &entries, dst).await
    }

    async fn upload_extracted(&self, base: &Path, entries: &[(String, bool)], dst: &str) -> Result<(), FsError> {
        let dst = clean_path(dst);
        self.create_directory(&dst)?;
        for (rel, is_dir) in entries {
            let logical = clean_path(&format!("{dst}/{rel}"));
            if *is_dir {
                self.create_directory(&logical)?;
            } else {
                self.upload_from_path(&base.join(rel), &logical).await?;
            }
        }
        Ok(())
    }

    /// Miniatura de un fichero: primero la del driver, si no la cadena de
    /// generadores.
    pub async fn thumbnail(&self, path: &str, pipeline: &Pipeline, cfg: &ThumbConfig) -> Result<Vec<u8>, FsError> {
        let record = self.file(path)?;
        match self.handler.thumb(&record.source).await {
            Ok(ContentResponse { content: Some(content), .. }) => return Ok(content),
            Ok(_) | Err(DriverError::NotFound(_)) | Err(DriverError::NotImplemented) => {}
            Err(e) => return Err(e.into()),
        }

        if cfg.max_src_size > 0 && record.size > cfg.max_src_size {
            return Err(ThumbError::NotAvailable.into());
        }
        let mut bytes = Vec::with_capacity(record.size as usize);
        self.handler.get(&record.source).await?.read_to_end(&mut bytes).await?;
        let res = pipeline
            .generate(
                ThumbSource {
                    bytes,
                    src: None,
                    name: record.name.clone(),
                },
                &cfg.options(),
            )
            .await?;
        let out = tokio::fs::read(&res.path).await;
        res.finish();
        Ok(out?)
    }
}

/// Trozos que llegan al escritor del zip.
enum ZipChunk {
    /// Abre una entrada nueva.
    Start(String),
    Data(Vec<u8>),
}

fn write_zip(path: &Path, mut rx: mpsc::Receiver<ZipChunk>) -> Result<(), FsError> {
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(io::BufWriter::new(file));
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    while let Some(chunk) = rx.blocking_recv() {
        match chunk {
            ZipChunk::Start(name) => zip.start_file(name, options)?,
            ZipChunk::Data(bytes) => zip.write_all(&bytes)?,
        }
    }
    zip.finish()?.flush()?;
    Ok(())
}

/// Devuelve (ruta relativa, es carpeta) de cada entrada extraída.
fn extract_zip(archive: &Path, target: &Path) -> Result<Vec<(String, bool)>, FsError> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(archive)?)?;
    let mut entries = Vec::with_capacity(archive.len());
    std::fs::create_dir_all(target)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            warn!(name = entry.name(), "entrada de zip fuera del destino, se ignora");
            continue;
        };
        let out = target.join(&rel);
        let is_dir = entry.is_dir();
        if is_dir {
            std::fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = std::fs::File::create(&out)?;
            io::copy(&mut entry, &mut f)?;
        }
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        entries.push((rel, is_dir));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacAuth;
    use crate::driver::LocalHandler;
    use crate::store::{MemoryStore, PolicyKind};
    use std::{env, fs};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("fs_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn filesystem(dir: &Path, capacity: u64) -> (FileSystem, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let policy = Policy {
            id: 1,
            name: "local".into(),
            kind: PolicyKind::Local,
            root: dir.join("root").to_string_lossy().into_owned(),
            ..Policy::default()
        };
        let owner = store
            .save_owner(Owner { id: 0, name: "ana".into(), capacity, used: 0, policy_id: 1 })
            .unwrap();
        let handler = Arc::new(LocalHandler::new(policy.clone(), Arc::new(HmacAuth::new("k")), "http://m"));
        let fs = FileSystem::new(owner, policy, handler, Arc::new(MemoryCatalog::new()), store.clone(), dir.join("tmp"));
        (fs, store)
    }

    async fn read_object(fs: &FileSystem, source: &str) -> Vec<u8> {
        let mut out = Vec::new();
        fs.handler.get(source).await.unwrap().read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn normaliza_rutas() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("a//b/./c/../d/"), "/a/b/d");
        assert_eq!(split_path("/a/b.txt"), ("/a".to_string(), "b.txt".to_string()));
        assert_eq!(split_path("b.txt"), ("/".to_string(), "b.txt".to_string()));
    }

    #[tokio::test]
    async fn subida_registra_y_consume_cuota() {
        let dir = temp_dir("upload");
        let (fs, store) = filesystem(&dir, 100);
        let src = dir.join("a.txt");
        fs::write(&src, b"hola mundo").unwrap();

        let record = fs.upload_from_path(&src, "/docs/a.txt").await.unwrap();
        assert_eq!(record.path(), "/docs/a.txt");
        assert_eq!(store.get_owner(fs.owner.id).unwrap().used, 10);
        assert_eq!(read_object(&fs, &record.source).await, b"hola mundo");

        assert!(matches!(
            fs.upload_from_path(&src, "/docs/a.txt").await,
            Err(FsError::Conflict(_))
        ));
        // el conflicto no deja el objeto subido ni cambia el uso
        assert_eq!(store.get_owner(fs.owner.id).unwrap().used, 10);
    }

    #[tokio::test]
    async fn sin_capacidad_no_sube() {
        let dir = temp_dir("capacity");
        let (fs, _) = filesystem(&dir, 4);
        let src = dir.join("big.bin");
        fs::write(&src, b"12345").unwrap();
        assert!(matches!(
            fs.upload_from_path(&src, "/big.bin").await,
            Err(FsError::InsufficientCapacity)
        ));
        assert!(fs.file("/big.bin").is_err());
    }

    #[tokio::test]
    async fn hooks_validan_nombre_y_extension() {
        let dir = temp_dir("hooks");
        let (mut fs, _) = filesystem(&dir, 100);
        fs.policy.allowed_exts = vec!["txt".into()];
        let parent = fs.create_directory("/").unwrap();

        let bad = FileStream::from_src("", 1, "a.exe");
        assert!(matches!(fs.add_file(&parent, &bad), Err(FsError::FileExtensionNotAllowed(_))));
        let bad = FileStream::from_src("", 1, "..");
        assert!(matches!(fs.add_file(&parent, &bad), Err(FsError::IllegalObjectName(_))));

        let mut ok = FileStream::from_src("", 1, "b.TXT");
        ok.save_path = "ext/b.TXT".into();
        assert_eq!(fs.add_file(&parent, &ok).unwrap().source, "ext/b.TXT");
    }

    #[tokio::test]
    async fn comprime_y_descomprime() {
        let dir = temp_dir("zip");
        let (fs, _) = filesystem(&dir, 1 << 20);
        for (name, content) in [("a.txt", "aaa"), ("b.txt", "bbbb")] {
            let src = dir.join(name);
            fs::write(&src, content).unwrap();
            fs.upload_from_path(&src, &format!("/docs/{name}")).await.unwrap();
        }
        let suelto = dir.join("c.txt");
        fs::write(&suelto, "c").unwrap();
        fs.upload_from_path(&suelto, "/c.txt").await.unwrap();

        let zip_path = dir.join("out/archive.zip");
        fs.compress(&["/docs".into()], &["/c.txt".into()], None, &zip_path).await.unwrap();

        let src = fs.upload_from_path(&zip_path, "/archive.zip").await.unwrap();
        fs.decompress(&src.path(), "/extraido").await.unwrap();

        let b = fs.file("/extraido/docs/b.txt").unwrap();
        assert_eq!(read_object(&fs, &b.source).await, b"bbbb");
        assert!(fs.file("/extraido/c.txt").is_ok());
    }

    #[tokio::test]
    async fn comprime_por_trozos_ficheros_grandes() {
        let dir = temp_dir("zip_grande");
        let (fs, _) = filesystem(&dir, 1 << 24);
        let content: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let src = dir.join("grande.bin");
        fs::write(&src, &content).unwrap();
        fs.upload_from_path(&src, "/grande.bin").await.unwrap();
        fs::write(dir.join("vacio"), b"").unwrap();
        fs.upload_from_path(&dir.join("vacio"), "/vacio").await.unwrap();

        let zip_path = dir.join("out/grande.zip");
        fs.compress(&[], &["/grande.bin".into(), "/vacio".into()], None, &zip_path)
            .await
            .unwrap();

        let mut archive = zip::ZipArchive::new(fs::File::open(&zip_path).unwrap()).unwrap();
        let mut entry = archive.by_name("grande.bin").unwrap();
        let mut out = Vec::new();
        io::Read::read_to_end(&mut entry, &mut out).unwrap();
        assert_eq!(out, content);
        drop(entry);
        assert_eq!(archive.by_name("vacio").unwrap().size(), 0);

        let record = fs.upload_from_path(&zip_path, "/grande.zip").await.unwrap();
        fs.decompress(&record.path(), "/x").await.unwrap();
        let back = fs.file("/x/grande.bin").unwrap();
        assert_eq!(read_object(&fs, &back.source).await, content);
        // no quedan restos en el directorio temporal
        let restos = fs::read_dir(dir.join("tmp/decompress")).unwrap().count();
        assert_eq!(restos, 0);
    }

    #[tokio::test]
    async fn comprimir_fuera_del_ambito_falla() {
        let dir = temp_dir("zip_ambito");
        let (fs, _) = filesystem(&dir, 1 << 20);
        for path in ["/docs/a.txt", "/otros/b.txt"] {
            let src = dir.join("src.txt");
            fs::write(&src, b"x").unwrap();
            fs.upload_from_path(&src, path).await.unwrap();
        }
        let zip_path = dir.join("out/a.zip");

        fs.compress(&[], &["/docs/a.txt".into()], Some("/docs"), &zip_path)
            .await
            .unwrap();
        assert!(matches!(
            fs.compress(&[], &["/otros/b.txt".into()], Some("/docs"), &zip_path).await,
            Err(FsError::ObjectNotExist(_))
        ));
        assert!(matches!(
            fs.compress(&["/otros".into()], &[], Some("/docs/"), &zip_path).await,
            Err(FsError::ObjectNotExist(_))
        ));
    }

    #[tokio::test]
    async fn comprimir_un_fichero_sin_objeto_falla() {
        let dir = temp_dir("zip_sin_objeto");
        let (fs, _) = filesystem(&dir, 1 << 20);
        let src = dir.join("a.txt");
        fs::write(&src, b"a").unwrap();
        let record = fs.upload_from_path(&src, "/a.txt").await.unwrap();
        fs::remove_file(dir.join("root").join(&record.source)).unwrap();

        let err = fs
            .compress(&[], &["/a.txt".into()], None, &dir.join("out/a.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Driver(DriverError::NotFound(_))));
    }

    #[tokio::test]
    async fn descomprimir_algo_que_no_es_zip_falla() {
        let dir = temp_dir("notzip");
        let (fs, _) = filesystem(&dir, 1 << 20);
        let src = dir.join("x.zip");
        fs::write(&src, b"no soy un zip").unwrap();
        fs.upload_from_path(&src, "/x.zip").await.unwrap();
        assert!(fs.decompress("/x.zip", "/out").await.is_err());
    }

    #[tokio::test]
    async fn miniatura_del_driver_o_no_disponible() {
        let dir = temp_dir("thumb");
        let (fs, _) = filesystem(&dir, 1 << 20);
        let src = dir.join("foto.jpg");
        fs::write(&src, b"jpg").unwrap();
        let record = fs.upload_from_path(&src, "/foto.jpg").await.unwrap();

        let cfg = ThumbConfig::default();
        let err = fs.thumbnail("/foto.jpg", &Pipeline::new(), &cfg).await.err().unwrap();
        assert!(matches!(err, FsError::Thumb(ThumbError::NotAvailable)));

        let sidecar = dir.join("root").join(format!("{}._thumb", record.source));
        fs::write(sidecar, b"mini").unwrap();
        assert_eq!(fs.thumbnail("/foto.jpg", &Pipeline::new(), &cfg).await.unwrap(), b"mini");
    }
}
