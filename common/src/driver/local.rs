use async_trait::async_trait;
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs;
use tracing::{debug, warn};

use super::{ContentResponse, DriverError, FileStream, Handler, ObjectInfo, ObjectReader, UploadCredential};
use crate::auth::{sign_uri, Auth};
use crate::store::Policy;

const THUMB_SUFFIX: &str = "._thumb";

/// Driver sobre el disco local del nodo.
pub struct LocalHandler {
    policy: Policy,
    root: PathBuf,
    auth: Arc<dyn Auth>,
    site_url: String,
}

impl LocalHandler {
    pub fn new(policy: Policy, auth: Arc<dyn Auth>, site_url: &str) -> Self {
        let root = PathBuf::from(&policy.root);
        Self {
            policy,
            root,
            auth,
            site_url: site_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Ruta física dentro de la raíz; rechaza `..`.
    fn resolve(&self, path: &str) -> Result<PathBuf, DriverError> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path escapes policy root: {path}"),
            )));
        }
        Ok(self.root.join(rel))
    }
}

fn not_found(path: &str, e: io::Error) -> DriverError {
    if e.kind() == io::ErrorKind::NotFound {
        DriverError::NotFound(path.to_string())
    } else {
        DriverError::Io(e)
    }
}

fn slash(p: &Path) -> String {
    p.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl Handler for LocalHandler {
    async fn put(&self, file: FileStream) -> Result<(), DriverError> {
        let dst = self.resolve(&file.save_path)?;
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir).await?;
        }

        match file.reader {
            Some(mut reader) => {
                let mut out = fs::File::create(&dst).await?;
                tokio::io::copy(&mut reader, &mut out).await?;
            }
            None if !file.src.is_empty() => {
                fs::copy(&file.src, &dst).await.map_err(|e| not_found(&file.src, e))?;
            }
            None => return Err(DriverError::EmptyStream),
        }
        debug!(dst = %dst.display(), size = file.size, "fichero guardado");
        Ok(())
    }

    async fn delete(&self, paths: &[String]) -> Result<Vec<String>, DriverError> {
        let mut failed = Vec::new();
        for path in paths {
            let res = match self.resolve(path) {
                Ok(p) => fs::remove_file(p).await.map_err(DriverError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!(path, error = %e, "no se pudo borrar");
                failed.push(path.clone());
            }
        }
        Ok(failed)
    }

    async fn get(&self, path: &str) -> Result<ObjectReader, DriverError> {
        let file = fs::File::open(self.resolve(path)?)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(Box::new(file))
    }

    async fn thumb(&self, path: &str) -> Result<ContentResponse, DriverError> {
        let sidecar = format!("{path}{THUMB_SUFFIX}");
        let content = fs::read(self.resolve(&sidecar)?)
            .await
            .map_err(|e| not_found(&sidecar, e))?;
        Ok(ContentResponse {
            redirect: false,
            url: None,
            content: Some(content),
        })
    }

    async fn source(
        &self,
        path: &str,
        ttl: Duration,
        is_download: bool,
        speed_limit: u64,
    ) -> Result<String, DriverError> {
        let action = if is_download { "download" } else { "get" };
        let mut uri = format!(
            "{}/api/v1/file/{}/{}",
            self.site_url,
            action,
            path.trim_start_matches('/')
        );
        if speed_limit > 0 {
            uri.push_str(&format!("?speed={speed_limit}"));
        }
        Ok(sign_uri(self.auth.as_ref(), &uri, ttl.as_secs() as i64)?.to_string())
    }

    async fn token(
        &self,
        ttl: Duration,
        session_id: &str,
        file: &FileStream,
    ) -> Result<UploadCredential, DriverError> {
        if self.policy.max_size > 0 && file.size > self.policy.max_size {
            return Err(DriverError::FileSizeTooBig);
        }
        let ttl = ttl.as_secs() as i64;
        let uri = format!("{}/api/v1/file/upload/{session_id}", self.site_url);
        Ok(UploadCredential {
            session_id: session_id.to_string(),
            upload_urls: vec![sign_uri(self.auth.as_ref(), &uri, ttl)?.to_string()],
            expires: chrono::Utc::now().timestamp() + ttl,
            ..UploadCredential::default()
        })
    }

    async fn cancel_token(&self, _session_id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn list(&self, base: &str, recursive: bool) -> Result<Vec<ObjectInfo>, DriverError> {
        let base_dir = self.resolve(base)?;
        let mut objects = Vec::new();
        let mut pending = vec![base_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| not_found(base, e))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                let relative = path.strip_prefix(&base_dir).unwrap_or(&path);
                let source = path.strip_prefix(&self.root).unwrap_or(&path);

                objects.push(ObjectInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    relative_path: slash(relative),
                    source: slash(source),
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    is_dir: meta.is_dir(),
                });

                if recursive && meta.is_dir() {
                    pending.push(path);
                }
            }
        }

        objects.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{check_uri, HmacAuth};
    use crate::store::PolicyKind;
    use reqwest::Url;
    use std::{env, fs as stdfs};
    use tokio::io::AsyncReadExt;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("local_driver_tests").join(sub);
        let _ = stdfs::remove_dir_all(&base);
        stdfs::create_dir_all(&base).unwrap();
        base
    }

    fn handler(root: &Path) -> LocalHandler {
        let policy = Policy {
            id: 1,
            name: "local".into(),
            kind: PolicyKind::Local,
            root: root.to_string_lossy().into_owned(),
            ..Policy::default()
        };
        LocalHandler::new(policy, Arc::new(HmacAuth::new("k")), "http://master/")
    }

    async fn read_all(h: &LocalHandler, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        h.get(path).await.unwrap().read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn put_desde_reader_y_desde_ruta() {
        let dir = temp_dir("put");
        let h = handler(&dir.join("root"));

        let mut stream = FileStream::from_src("", 4, "a.txt");
        stream.reader = Some(Box::new(&b"hola"[..]));
        stream.save_path = "u1/a.txt".into();
        h.put(stream).await.unwrap();
        assert_eq!(read_all(&h, "u1/a.txt").await, b"hola");

        let src = dir.join("origen.bin");
        stdfs::write(&src, b"1234").unwrap();
        let mut stream = FileStream::from_src(src.to_string_lossy(), 4, "b.bin");
        stream.save_path = "/u1/sub/b.bin".into();
        h.put(stream).await.unwrap();
        assert_eq!(read_all(&h, "u1/sub/b.bin").await, b"1234");

        let empty = FileStream::from_src("", 0, "c");
        assert!(matches!(h.put(empty).await, Err(DriverError::EmptyStream)));
    }

    #[tokio::test]
    async fn rechaza_rutas_fuera_de_la_raiz() {
        let dir = temp_dir("escape");
        let h = handler(&dir);
        assert!(h.get("../secreto").await.is_err());
        assert!(matches!(h.get("no-existe").await, Err(DriverError::NotFound(_))));
    }

    #[tokio::test]
    async fn lista_recursiva_y_plana() {
        let dir = temp_dir("list");
        stdfs::create_dir_all(dir.join("import/sub")).unwrap();
        stdfs::write(dir.join("import/a.txt"), b"a").unwrap();
        stdfs::write(dir.join("import/sub/b.txt"), b"bb").unwrap();
        let h = handler(&dir);

        let flat = h.list("import", false).await.unwrap();
        let names: Vec<_> = flat.iter().map(|o| o.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);

        let all = h.list("import", true).await.unwrap();
        let b = all.iter().find(|o| o.name == "b.txt").unwrap();
        assert_eq!(b.relative_path, "sub/b.txt");
        assert_eq!(b.source, "import/sub/b.txt");
        assert_eq!(b.size, 2);
        assert!(all.iter().any(|o| o.is_dir && o.name == "sub"));
    }

    #[tokio::test]
    async fn delete_informa_fallos() {
        let dir = temp_dir("delete");
        stdfs::write(dir.join("x"), b"x").unwrap();
        let h = handler(&dir);
        let failed = h.delete(&["x".into(), "no-existe".into()]).await.unwrap();
        assert_eq!(failed, vec!["no-existe".to_string()]);
        assert!(!dir.join("x").exists());
    }

    #[tokio::test]
    async fn source_devuelve_uri_firmada() {
        let dir = temp_dir("source");
        let h = handler(&dir);
        let url = h.source("u1/a.txt", Duration::from_secs(60), true, 0).await.unwrap();
        let url = Url::parse(&url).unwrap();
        assert_eq!(url.path(), "/api/v1/file/download/u1/a.txt");
        assert!(check_uri(&HmacAuth::new("k"), &url).is_ok());
        assert!(url.query_pairs().all(|(k, _)| k != "speed"));

        let url = h.source("u1/a.txt", Duration::from_secs(60), false, 1024).await.unwrap();
        let url = Url::parse(&url).unwrap();
        assert!(url.query_pairs().any(|(k, v)| k == "speed" && v == "1024"));
        assert!(check_uri(&HmacAuth::new("k"), &url).is_ok());
    }

    #[tokio::test]
    async fn token_respeta_el_limite_de_la_politica() {
        let dir = temp_dir("token");
        let mut h = handler(&dir);
        h.policy.max_size = 10;

        let small = FileStream::from_src("", 4, "a.txt");
        let cred = h.token(Duration::from_secs(60), "sesion", &small).await.unwrap();
        assert_eq!(cred.session_id, "sesion");
        let url = Url::parse(&cred.upload_urls[0]).unwrap();
        assert_eq!(url.path(), "/api/v1/file/upload/sesion");
        assert!(check_uri(&HmacAuth::new("k"), &url).is_ok());

        let big = FileStream::from_src("", 11, "b.txt");
        assert!(matches!(
            h.token(Duration::from_secs(60), "sesion", &big).await,
            Err(DriverError::FileSizeTooBig)
        ));
    }
}
