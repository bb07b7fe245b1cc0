use crate::progress::{log_upgrade, ProgressRecord};
use crate::MigrateError;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Exclusively-created marker that keeps a second instance of the same
/// migration away from the progress file. Removed when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn acquire(path: &Path) -> Result<Self, MigrateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(MigrateError::Io)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Self { path: path.to_path_buf() }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(MigrateError::Lock(format!(
                "{} exists: another run may be active; remove it by hand only if no run is",
                path.display()
            ))),
            Err(e) => Err(MigrateError::Lock(format!("cannot create {}: {}", path.display(), e))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Durable home of a `ProgressRecord`.
///
/// A writable store holds the singleton lock for its lifetime. Saves go to
/// `<path>.tmp` and are renamed over the live file, so readers only ever
/// see a complete JSON document.
pub struct ProgressStore {
    path: PathBuf,
    temp_path: PathBuf,
    job: String,
    lock: Option<LockGuard>,
}

impl ProgressStore {
    pub fn lock_path_for(path: &Path) -> PathBuf {
        sibling(path, "lock")
    }

    pub fn temp_path_for(path: &Path) -> PathBuf {
        sibling(path, "tmp")
    }

    /// Open for writing, taking the singleton lock.
    pub fn open<P: AsRef<Path>>(path: P, job: &str) -> Result<Self, MigrateError> {
        let path = path.as_ref().to_path_buf();
        let lock = LockGuard::acquire(&Self::lock_path_for(&path))?;
        info!(lock = %lock.path().display(), "acquired migration lock");
        Ok(Self {
            temp_path: Self::temp_path_for(&path),
            path,
            job: job.to_string(),
            lock: Some(lock),
        })
    }

    /// Open for inspection only. No lock is taken and `save` refuses.
    pub fn open_read_only<P: AsRef<Path>>(path: P, job: &str) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            temp_path: Self::temp_path_for(&path),
            path,
            job: job.to_string(),
            lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_writable(&self) -> bool {
        self.lock.is_some()
    }

    /// Load the record, upgrading older shapes. A missing file yields a
    /// fresh record, which a writable store persists right away.
    pub fn load(&self) -> Result<ProgressRecord, MigrateError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no progress file, starting fresh");
                let record = ProgressRecord::new(&self.job);
                if self.is_writable() {
                    self.save(&record)?;
                }
                return Ok(record);
            }
            Err(e) => {
                return Err(MigrateError::Persistence(format!("cannot read {}: {}", self.path.display(), e)));
            }
        };

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| MigrateError::Persistence(format!("{} is not valid JSON: {}", self.path.display(), e)))?;
        let (mut record, upgraded_from) = ProgressRecord::from_json(value, &self.job)?;
        if record.job.is_empty() {
            record.job = self.job.clone();
        }
        log_upgrade(upgraded_from, &record);
        Ok(record)
    }

    /// Crash-safe save: temp file, fsync, rename. On any failure the temp
    /// file is removed and the previous durable state is left untouched.
    pub fn save(&self, record: &ProgressRecord) -> Result<(), MigrateError> {
        if !self.is_writable() {
            return Err(MigrateError::Persistence(format!(
                "{} was opened read-only",
                self.path.display()
            )));
        }

        let result = self.write_temp(record).and_then(|_| {
            fs::rename(&self.temp_path, &self.path)
                .map_err(|e| MigrateError::Persistence(format!("rename to {}: {}", self.path.display(), e)))
        });

        if let Err(e) = &result {
            error!(path = %self.path.display(), error = %e, "failed to save progress");
            if self.temp_path.is_file() {
                let _ = fs::remove_file(&self.temp_path);
            }
        }
        result
    }

    fn write_temp(&self, record: &ProgressRecord) -> Result<(), MigrateError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| MigrateError::Persistence(format!("create {}: {}", parent.display(), e)))?;
        }
        let file = File::create(&self.temp_path)
            .map_err(|e| MigrateError::Persistence(format!("create {}: {}", self.temp_path.display(), e)))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, record)
            .map_err(|e| MigrateError::Persistence(format!("serialize progress: {}", e)))?;
        writer
            .flush()
            .map_err(|e| MigrateError::Persistence(format!("flush {}: {}", self.temp_path.display(), e)))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| MigrateError::Persistence(format!("sync {}: {}", self.temp_path.display(), e)))?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
