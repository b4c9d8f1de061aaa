use super::S3Manager;
use common::{Error, Result};
use datafusion::prelude::SessionContext;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// A root directory on some object store, addressable both through
/// `object_store` paths and through URLs DataFusion can list.
#[derive(Clone)]
pub struct StorageLocation {
    url: Url,
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl std::fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLocation")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl StorageLocation {
    /// Accepts `s3://bucket/prefix`, `file:///abs/dir` or a plain local path.
    pub fn parse(root: &str, s3_manager: &S3Manager) -> Result<Self> {
        let url = if root.contains("://") {
            Url::parse(root)
                .map_err(|e| Error::Config(format!("Invalid location '{}': {}", root, e)))?
        } else {
            let path = std::path::absolute(root).map_err(|e| {
                Error::Config(format!("Invalid local location '{}': {}", root, e))
            })?;
            Url::from_directory_path(&path).map_err(|_| {
                Error::Config(format!("Invalid local location '{}'", path.display()))
            })?
        };

        match url.scheme() {
            "s3" | "s3a" => {
                let bucket = url
                    .host_str()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| Error::Config(format!("Location '{}' has no bucket", root)))?
                    .to_string();
                let store: Arc<dyn ObjectStore> = s3_manager.get_object_store(&bucket)?;
                Self::from_parts(url, store)
            }
            "file" => Self::from_parts(url, Arc::new(LocalFileSystem::new())),
            other => Err(Error::Config(format!(
                "Unsupported storage scheme '{}' in '{}'",
                other, root
            ))),
        }
    }

    /// A location on the local filesystem.
    pub fn local(dir: &std::path::Path) -> Result<Self> {
        let path = std::path::absolute(dir)?;
        let url = Url::from_directory_path(&path)
            .map_err(|_| Error::Config(format!("Invalid local location '{}'", path.display())))?;
        Self::from_parts(url, Arc::new(LocalFileSystem::new()))
    }

    /// A location backed by an already built store.
    pub(crate) fn from_parts(mut url: Url, store: Arc<dyn ObjectStore>) -> Result<Self> {
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let prefix = Path::from_url_path(url.path())
            .map_err(|e| Error::Config(format!("Invalid location '{}': {}", url, e)))?;
        Ok(Self { url, store, prefix })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn bucket(&self) -> Option<&str> {
        match self.url.scheme() {
            "s3" | "s3a" => self.url.host_str(),
            _ => None,
        }
    }

    /// Object path of `relative` (slash separated) under this root.
    pub fn child(&self, relative: &str) -> Path {
        relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.prefix.clone(), |path, segment| path.child(segment))
    }

    /// Object path built from whole segments; delimiters inside a segment are
    /// escaped rather than creating extra directory levels.
    pub fn child_segments<S: AsRef<str>>(&self, segments: &[S]) -> Path {
        segments
            .iter()
            .fold(self.prefix.clone(), |path, segment| path.child(segment.as_ref()))
    }

    /// Directory location of `relative` under this root.
    pub fn join(&self, relative: &str) -> Result<StorageLocation> {
        let relative = format!("{}/", relative.trim_matches('/'));
        let url = self.url.join(&relative)?;
        Self::from_parts(url, self.store.clone())
    }

    /// The path of `path` relative to this root, or `None` if outside it.
    pub fn relative(&self, path: &Path) -> Option<String> {
        path.prefix_match(&self.prefix)
            .map(|parts| parts.map(|p| p.as_ref().to_string()).collect::<Vec<_>>().join("/"))
    }

    /// Makes the store reachable from `ctx` under this location's scheme and host.
    pub fn register(&self, ctx: &SessionContext) -> Result<()> {
        let store_url = Url::parse(&format!(
            "{}://{}",
            self.url.scheme(),
            self.url.host_str().unwrap_or_default()
        ))?;
        debug!(store_url = %store_url, "Registering object store");
        ctx.register_object_store(&store_url, self.store.clone());
        Ok(())
    }

    /// Checks the location is usable before the run starts.
    pub async fn preflight(&self, s3_manager: &S3Manager, create: bool) -> Result<()> {
        if let Some(bucket) = self.bucket() {
            return s3_manager.verify_bucket_exists(bucket).await;
        }

        let dir = self
            .url
            .to_file_path()
            .map_err(|_| Error::Config(format!("Location '{}' is not a local path", self.url)))?;
        if create {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Config(format!("Cannot create '{}': {}", dir.display(), e))
            })?;
        }
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::Config(format!(
                "Location '{}' is not a directory",
                dir.display()
            ))),
            Err(e) => Err(Error::Config(format!(
                "Cannot access '{}': {}",
                dir.display(),
                e
            ))),
        }
    }
}
