//! Durable last-known value for an unreachable companion.
//!
//! While the relay link is down, every payload replaces the stored context.
//! The link pushes it as a CONTEXT frame on next contact and clears it.
//! With a backing file the value survives a bridge restart.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RelayError;

/// The value waiting for the companion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContext {
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Last-known value, optionally backed by a JSON file.
#[derive(Debug)]
pub struct ContextStore {
    path: Option<PathBuf>,
    current: Mutex<Option<StoredContext>>,
}

impl ContextStore {
    /// Creates a store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: Mutex::new(None),
        }
    }

    /// Opens a file-backed store, loading any value left by a previous run.
    ///
    /// An unreadable or corrupt file is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match load(&path) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable context file");
                None
            }
        };
        if current.is_some() {
            debug!(path = %path.display(), "loaded pending context");
        }
        Self {
            path: Some(path),
            current: Mutex::new(current),
        }
    }

    /// Returns the pending value, if any.
    pub fn current(&self) -> Option<StoredContext> {
        self.current.lock().ok().and_then(|guard| guard.clone())
    }

    /// Replaces the pending value and persists it.
    ///
    /// Does blocking file I/O. The in-memory value is updated even when
    /// persisting fails.
    pub fn save(&self, message: &str) -> Result<(), RelayError> {
        let context = StoredContext {
            message: message.to_owned(),
            updated_at: Utc::now(),
        };
        if let Ok(mut guard) = self.current.lock() {
            *guard = Some(context.clone());
        }
        match &self.path {
            Some(path) => persist(path, &context),
            None => Ok(()),
        }
    }

    /// Clears the pending value after it reached the companion.
    ///
    /// Only clears when the stored message still equals `delivered`, so a
    /// value saved while the push was in flight is kept.
    pub fn clear_if(&self, delivered: &StoredContext) -> Result<(), RelayError> {
        let Ok(mut guard) = self.current.lock() else {
            return Ok(());
        };
        if guard.as_ref() != Some(delivered) {
            return Ok(());
        }
        *guard = None;
        drop(guard);

        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn load(path: &Path) -> Result<Option<StoredContext>, RelayError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn persist(path: &Path, context: &StoredContext) -> Result<(), RelayError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    // Write next to the target and rename so a crash never leaves half a file.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(context)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}
