//! Read update payloads from a directory tree or a ZIP archive.
//!
//! The updater does not care which backing store an archive uses; it only
//! enumerates and extracts files by relative name.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;
use zip::ZipArchive;

#[derive(Debug)]
pub enum ArchiveError {
    Open(String),
    NotFound(String),
    Read(String),
}

pub enum Archive {
    Dir(PathBuf),
    Zip(Box<ZipArchive<File>>),
}

impl Archive {
    /// Opens an archive from the given path. The type of archive is
    /// determined automatically: a directory is served from the
    /// filesystem, anything else must be a ZIP file.
    pub fn open(path: &Path) -> Result<Archive, ArchiveError> {
        if path.is_dir() {
            debug!("Using directory archive: {}", path.display());
            return Ok(Archive::Dir(path.to_path_buf()));
        }
        let file = File::open(path)
            .map_err(|err| ArchiveError::Open(format!("{}: {}", path.display(), err)))?;
        let zip = ZipArchive::new(file)
            .map_err(|err| ArchiveError::Open(format!("{}: {}", path.display(), err)))?;
        debug!("Using ZIP archive: {}", path.display());
        Ok(Archive::Zip(Box::new(zip)))
    }

    /// Checks if an entry exists in the archive.
    pub fn has_entry(&mut self, name: &str) -> bool {
        match self {
            Archive::Dir(root) => root.join(name).exists(),
            Archive::Zip(zip) => zip.by_name(name).is_ok(),
        }
    }

    /// Reads a file from the archive.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        match self {
            Archive::Dir(root) => {
                let path = root.join(name);
                if !path.exists() {
                    return Err(ArchiveError::NotFound(name.to_string()));
                }
                std::fs::read(&path)
                    .map_err(|err| ArchiveError::Read(format!("{}: {}", path.display(), err)))
            }
            Archive::Zip(zip) => {
                let mut entry = zip
                    .by_name(name)
                    .map_err(|_| ArchiveError::NotFound(name.to_string()))?;
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut data)
                    .map_err(|err| ArchiveError::Read(format!("{}: {}", name, err)))?;
                Ok(data)
            }
        }
    }
}
