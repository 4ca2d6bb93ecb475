use std::fs;
use std::io::{self, Read};
use std::path::Path;

use camino::{Utf8Component, Utf8Path};
use zip::ZipArchive;

use crate::error::SyncError;

/// Accept a server-supplied relative file name only if joining it onto a
/// directory cannot land outside that directory: no absolute paths, no `..`
/// or `.` components, no backslash separators. Applies to zip entry names
/// and manifest media filenames alike.
pub fn contained_path(name: &str) -> Option<&Utf8Path> {
    let path = Utf8Path::new(name);
    let contained = !name.is_empty()
        && !name.contains('\\')
        && !path.is_absolute()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)));
    contained.then_some(path)
}

/// True when the file starts with the zip local-file magic. Media manifests
/// may point at bundled archives that must be unpacked after download.
pub fn is_zip_file(path: &Path) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    magic == [0x50, 0x4b, 0x03, 0x04]
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), SyncError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| SyncError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| SyncError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let entry_path = match contained_path(entry.name()) {
            Some(path) => target_dir.join(path.as_std_path()),
            None => {
                return Err(SyncError::Filesystem(format!(
                    "zip entry path traversal detected: {}",
                    entry.name()
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

pub fn validate_zip(zip_path: &Path) -> Result<(), SyncError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| SyncError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| SyncError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    Ok(())
}
