//! Runtime archive extraction and directory helpers

use super::ProvisionError;
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

/// Unpacks `archive` into `dest`, creating it if needed
pub async fn extract(archive: &Path, dest: &Path) -> Result<(), ProvisionError> {
    let kind = ArchiveKind::from_path(archive).ok_or_else(|| {
        ProvisionError::install(
            archive.display().to_string(),
            "unsupported archive format (expected .tar.gz or .zip)",
        )
    })?;
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(kind, &archive, &dest))
        .await
        .map_err(|e| ProvisionError::install("archive", e))?
}

fn extract_blocking(kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(dest).map_err(|e| ProvisionError::io(dest, e))?;
    let file = File::open(archive).map_err(|e| ProvisionError::io(archive, e))?;
    debug!(archive = %archive.display(), dest = %dest.display(), "Extracting archive");

    match kind {
        ArchiveKind::TarGz => {
            let mut tar = Archive::new(GzDecoder::new(file));
            tar.unpack(dest)
                .map_err(|e| ProvisionError::install(archive.display().to_string(), e))?;
        }
        ArchiveKind::Zip => extract_zip(file, archive, dest)?,
    }
    Ok(())
}

fn extract_zip(file: File, archive: &Path, dest: &Path) -> Result<(), ProvisionError> {
    let target = archive.display().to_string();
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| ProvisionError::install(target.clone(), e))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ProvisionError::install(target.clone(), e))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(|e| ProvisionError::io(&out, e))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProvisionError::io(parent, e))?;
        }
        let mut writer = File::create(&out).map_err(|e| ProvisionError::io(&out, e))?;
        std::io::copy(&mut entry, &mut writer).map_err(|e| ProvisionError::io(&out, e))?;
    }
    Ok(())
}

/// Executable name with the platform suffix
pub fn exe_name(base: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", base)
    } else {
        base.to_string()
    }
}

/// Finds `name` anywhere below `root`, shallowest match first
pub fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_key(|e| e.depth())
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.into_path())
}

/// Marks every regular file below `root` executable (unix only)
pub fn mark_executables(root: &Path) -> Result<(), ProvisionError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_binary = path.extension().is_none()
                || path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e, "so" | "dylib"));
            if is_binary || path.to_string_lossy().contains(".so.") {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
                    .map_err(|e| ProvisionError::io(path, e))?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = root;
    Ok(())
}

/// Recursively copies a directory tree
pub fn copy_dir(src: &Path, dest: &Path) -> Result<(), ProvisionError> {
    for entry in WalkDir::new(src).into_iter().filter_map(Result::ok) {
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| ProvisionError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ProvisionError::io(parent, e))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| ProvisionError::io(&target, e))?;
        }
    }
    Ok(())
}
