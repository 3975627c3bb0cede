//! GGUF model files: download, import, list and delete

use super::download::{part_path, DownloadError, Downloader};
use super::ProvisionError;
use crate::engine::catalog;
use async_trait::async_trait;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// A model file present on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledModel {
    pub model_id: String,
    pub file_size_bytes: u64,
}

#[async_trait]
pub trait ModelProvisioner: Send + Sync {
    /// Ensures the model file is present; an already valid file is reused
    async fn install_model(
        &self,
        model_id: &str,
        source: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProvisionError>;

    async fn delete_model(&self, model_id: &str) -> Result<(), ProvisionError>;

    fn list_installed_models(&self) -> Result<Vec<InstalledModel>, ProvisionError>;

    /// Path of an installed model, `None` when missing
    fn model_path(&self, model_id: &str) -> Option<PathBuf>;

    fn cancel_active_download(&self);
}

/// Checks the four-byte GGUF header
pub fn is_gguf(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).is_ok() && &magic == GGUF_MAGIC
}

/// Copies `src` to `dest` through a temporary sibling, so a copy that fails
/// partway never leaves a truncated file under the final name
async fn copy_into_place(src: &Path, dest: &Path) -> Result<(), ProvisionError> {
    let part = part_path(dest, Uuid::new_v4());
    if let Err(e) = tokio::fs::copy(src, &part).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(ProvisionError::io(src, e));
    }
    if let Err(e) = tokio::fs::rename(&part, dest).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(ProvisionError::io(dest, e));
    }
    Ok(())
}

/// An id maps to a file that lists back as the same id
fn round_trips(model_id: &str) -> bool {
    catalog::model_id_for_file(&catalog::file_name_for(model_id)).as_deref() == Some(model_id)
}

/// Model files stored flat under the models directory
#[derive(Debug)]
pub struct LocalModelStore {
    dir: PathBuf,
    resource_dir: Option<PathBuf>,
    downloader: Arc<Downloader>,
    allow_download: bool,
}

impl LocalModelStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        resource_dir: Option<PathBuf>,
        downloader: Arc<Downloader>,
        allow_download: bool,
    ) -> Self {
        Self {
            dir: dir.into(),
            resource_dir,
            downloader,
            allow_download,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn target_path(&self, model_id: &str) -> PathBuf {
        self.dir.join(catalog::file_name_for(model_id))
    }

    /// Copies a local GGUF into the store and returns its new model id.
    ///
    /// Existing files are never overwritten; a `-N` suffix is added instead.
    /// The same happens when the name would be read back as a different id,
    /// such as a custom file named like a catalog file.
    pub async fn import_model(&self, path: &Path) -> Result<String, ProvisionError> {
        if !is_gguf(path) {
            return Err(ProvisionError::install(
                path.display().to_string(),
                "not a GGUF model file",
            ));
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let base = catalog::sanitize_model_id(stem);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ProvisionError::io(&self.dir, e))?;

        let mut model_id = base.clone();
        let mut n = 1;
        while self.target_path(&model_id).exists() || !round_trips(&model_id) {
            model_id = format!("{}-{}", base, n);
            n += 1;
        }
        let dest = self.target_path(&model_id);
        copy_into_place(path, &dest).await?;
        info!(model = %model_id, "Model imported");
        Ok(model_id)
    }

    fn bundled_file(&self, model_id: &str) -> Option<PathBuf> {
        let path = self
            .resource_dir
            .as_ref()?
            .join("models")
            .join(catalog::file_name_for(model_id));
        path.is_file().then_some(path)
    }

    async fn fetch(
        &self,
        model_id: &str,
        source: Option<&str>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        match source {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                self.downloader
                    .download_to_file(url, dest, model_id, cancel)
                    .await?;
            }
            Some(local) => {
                copy_into_place(Path::new(local), dest).await?;
            }
            None => {
                if let Some(bundled) = self.bundled_file(model_id) {
                    info!(model = %model_id, "Installing bundled model");
                    return copy_into_place(&bundled, dest).await;
                }
                let descriptor = catalog::find(model_id).ok_or_else(|| {
                    ProvisionError::install(model_id, "unknown model id and no source given")
                })?;
                if !self.allow_download {
                    return Err(DownloadError::Disabled(model_id.to_string()).into());
                }
                let urls: Vec<String> =
                    descriptor.mirrors.iter().map(|u| u.to_string()).collect();
                self.downloader
                    .download_from_mirrors(&urls, dest, descriptor.title, cancel)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ModelProvisioner for LocalModelStore {
    async fn install_model(
        &self,
        model_id: &str,
        source: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProvisionError> {
        let dest = self.target_path(model_id);
        if source.is_none() && is_gguf(&dest) {
            debug!(model = %model_id, "Model already installed");
            return Ok(dest);
        }
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ProvisionError::io(&self.dir, e))?;

        self.fetch(model_id, source, &dest, cancel).await?;

        if !is_gguf(&dest) {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(ProvisionError::install(model_id, "file is not a GGUF model"));
        }
        info!(model = %model_id, path = %dest.display(), "Model installed");
        Ok(dest)
    }

    async fn delete_model(&self, model_id: &str) -> Result<(), ProvisionError> {
        let path = self.target_path(model_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(model = %model_id, "Model deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProvisionError::NotFound(model_id.to_string()))
            }
            Err(e) => Err(ProvisionError::io(&path, e)),
        }
    }

    fn list_installed_models(&self) -> Result<Vec<InstalledModel>, ProvisionError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProvisionError::io(&self.dir, e)),
        };

        let mut models: Vec<InstalledModel> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let model_id = catalog::model_id_for_file(&name)?;
                let meta = entry.metadata().ok()?;
                meta.is_file().then_some(InstalledModel {
                    model_id,
                    file_size_bytes: meta.len(),
                })
            })
            .collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    fn model_path(&self, model_id: &str) -> Option<PathBuf> {
        let path = self.target_path(model_id);
        path.is_file().then_some(path)
    }

    fn cancel_active_download(&self) {
        self.downloader.cancel_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::REFERENCE_MODEL_ID;
    use crate::progress::ProgressSlot;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(root: &Path, resources: Option<PathBuf>) -> LocalModelStore {
        let downloader = Arc::new(Downloader::new(
            Arc::new(ProgressSlot::new()),
            Duration::from_secs(1),
        ));
        LocalModelStore::new(root.join("models"), resources, downloader, false)
    }

    fn write_gguf(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"GGUF\x03\x00\x00\x00rest").unwrap();
    }

    #[test]
    fn test_gguf_magic() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("a.gguf");
        let bad = dir.path().join("b.gguf");
        write_gguf(&good);
        std::fs::write(&bad, b"<html>").unwrap();
        assert!(is_gguf(&good));
        assert!(!is_gguf(&bad));
        assert!(!is_gguf(&dir.path().join("missing.gguf")));
    }

    #[tokio::test]
    async fn test_install_from_bundled_resources() {
        let dir = TempDir::new().unwrap();
        let resources = dir.path().join("res");
        write_gguf(&resources.join("models/Qwen3-0.6B-Q4_K_M.gguf"));
        let store = store(dir.path(), Some(resources));

        let path = store
            .install_model(REFERENCE_MODEL_ID, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(path.ends_with("Qwen3-0.6B-Q4_K_M.gguf"));
        assert_eq!(store.model_path(REFERENCE_MODEL_ID), Some(path));
    }

    #[tokio::test]
    async fn test_install_rejects_non_gguf_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("fake.gguf");
        std::fs::write(&src, b"not a model").unwrap();
        let store = store(dir.path(), None);

        let err = store
            .install_model("custom", src.to_str(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Install { .. }));
        assert!(store.model_path("custom").is_none());
    }

    #[tokio::test]
    async fn test_install_when_downloads_disabled() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), None);
        let err = store
            .install_model("qwen3_4b_q4_k_m", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_download());
    }

    #[tokio::test]
    async fn test_import_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("My Model.gguf");
        write_gguf(&src);
        let store = store(dir.path(), None);

        let first = store.import_model(&src).await.unwrap();
        let second = store.import_model(&src).await.unwrap();
        let third = store.import_model(&src).await.unwrap();
        assert_eq!(first, "My_Model");
        assert_eq!(second, "My_Model-1");
        assert_eq!(third, "My_Model-2");

        let listed: Vec<String> = store
            .list_installed_models()
            .unwrap()
            .into_iter()
            .map(|m| m.model_id)
            .collect();
        assert_eq!(listed, vec!["My_Model", "My_Model-1", "My_Model-2"]);
    }

    #[tokio::test]
    async fn test_import_named_like_catalog_file_keeps_one_id() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("Qwen3-4B-Q4_K_M.gguf");
        write_gguf(&src);
        let store = store(dir.path(), None);

        let imported = store.import_model(&src).await.unwrap();
        assert_eq!(imported, "Qwen3-4B-Q4_K_M-1");
        assert!(store.model_path(&imported).is_some());
        assert!(store.model_path("qwen3_4b_q4_k_m").is_none());

        let listed: Vec<String> = store
            .list_installed_models()
            .unwrap()
            .into_iter()
            .map(|m| m.model_id)
            .collect();
        assert_eq!(listed, vec![imported]);
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_destination_untouched() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.gguf");
        write_gguf(&src);
        // a non-empty directory where the file should go makes the final
        // rename fail after the data was copied
        let dest = dir.path().join("models/custom.gguf");
        std::fs::create_dir_all(dest.join("blocker")).unwrap();

        assert!(copy_into_place(&src, &dest).await.is_err());
        assert!(dest.is_dir());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("models"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name() != "custom.gguf")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_install_goes_through_temporary_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("weights.gguf");
        write_gguf(&src);
        let store = store(dir.path(), None);

        let path = store
            .install_model("custom", src.to_str(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&src).unwrap());
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        assert_eq!(names, vec!["custom.gguf"]);

        // a missing source fails without creating anything
        let missing = dir.path().join("gone.gguf");
        assert!(store
            .install_model("other", missing.to_str(), &CancellationToken::new())
            .await
            .is_err());
        assert!(store.model_path("other").is_none());
    }

    #[tokio::test]
    async fn test_list_maps_catalog_files_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), None);
        write_gguf(&store.dir().join("Qwen3-8B-Q4_K_M.gguf"));
        std::fs::write(store.dir().join("notes.txt"), b"x").unwrap();

        let listed = store.list_installed_models().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].model_id, "qwen3_8b_q4_k_m");
        assert!(listed[0].file_size_bytes > 0);

        store.delete_model("qwen3_8b_q4_k_m").await.unwrap();
        assert!(store.list_installed_models().unwrap().is_empty());
        assert!(matches!(
            store.delete_model("qwen3_8b_q4_k_m").await,
            Err(ProvisionError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_of_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(dir.path(), None).list_installed_models().unwrap().is_empty());
    }
}
