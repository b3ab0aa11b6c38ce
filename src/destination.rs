//! Layout of the destination directory.
//!
//! Per product the directory holds either `<identifier>.zip` or the extracted product directory.
//! Transfers land in `tmp_<timestamp>.tmp` first and are renamed once verified. A product whose
//! archive failed to extract leaves an `<identifier>.failed` marker holding the reason.
use crate::error::RunError;
use crate::product::ProductRecord;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const LOCK_FILE: &str = ".slow-peps.lock";

#[derive(Debug, Clone)]
pub struct Destination {
    dir: PathBuf,
}

impl Destination {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Creating {}", dir.display()))?;
        Ok(Self::new(dir))
    }

    pub fn dir(self: &Self) -> &Path {
        &self.dir
    }

    pub fn archive_path(self: &Self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.zip"))
    }

    pub fn product_dir(self: &Self, record: &ProductRecord) -> PathBuf {
        self.dir.join(record.extracted_dir_name())
    }

    /// True when the archive or the extracted product is already there.
    pub fn is_present(self: &Self, record: &ProductRecord) -> bool {
        self.archive_path(&record.identifier).exists() || self.product_dir(record).is_dir()
    }

    /// Fresh temporary file name for an in-flight transfer.
    pub fn temp_path(self: &Self) -> PathBuf {
        self.unused_path("tmp")
    }

    /// Fresh scratch directory name for unpacking an archive.
    pub fn unpack_path(self: &Self) -> PathBuf {
        self.unused_path("unpack")
    }

    fn unused_path(self: &Self, extension: &str) -> PathBuf {
        let mut ticks = Utc::now().timestamp_micros();
        loop {
            let path = self.dir.join(format!("tmp_{ticks}.{extension}"));
            if !path.exists() {
                return path;
            }
            ticks += 1;
        }
    }

    fn failure_marker(self: &Self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.failed"))
    }

    pub fn mark_failed(self: &Self, identifier: &str, reason: &str) -> Result<()> {
        let path = self.failure_marker(identifier);
        fs::write(&path, reason).with_context(|| format!("Writing {}", path.display()))?;
        Ok(())
    }

    /// Reason recorded by an earlier run whose extraction of this product failed.
    pub fn failure_reason(self: &Self, identifier: &str) -> Option<String> {
        fs::read_to_string(self.failure_marker(identifier)).ok()
    }

    pub fn clear_failure(self: &Self, identifier: &str) -> Result<()> {
        match fs::remove_file(self.failure_marker(identifier)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Claims the directory for this process until the returned guard is dropped. A lock left by
    /// a process that no longer exists is taken over.
    pub fn lock(self: &Self) -> Result<DestinationLock> {
        let path = self.dir.join(LOCK_FILE);
        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists && lock_owner_is_gone(&path) => {
                warn!(path = %path.display(), "Removing lock left by a run that is no longer alive");
                fs::remove_file(&path)?;
                create_lock_file(&path).map_err(|e| self.lock_error(e))?
            }
            Err(e) => return Err(self.lock_error(e)),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(DestinationLock { path })
    }

    fn lock_error(self: &Self, e: std::io::Error) -> anyhow::Error {
        match e.kind() {
            ErrorKind::AlreadyExists => RunError::DestinationLocked(self.dir.display().to_string()).into(),
            _ => e.into(),
        }
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// True when the lock names a process id that is no longer running. A lock without a readable
/// id is kept, it may belong to a run that has not written it yet.
fn lock_owner_is_gone(path: &Path) -> bool {
    let owner = fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok());
    match owner {
        Some(pid) => !process_is_alive(pid),
        None => false,
    }
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug)]
pub struct DestinationLock {
    path: PathBuf,
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Could not remove lock file: {e}");
        }
    }
}
