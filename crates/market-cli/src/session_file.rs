//! Persisted auth session between CLI invocations.

use anyhow::{Context, Result};
use baas_client::Session;
use std::path::Path;
use tracing::{debug, warn};

/// Read a persisted session. A missing or unreadable file yields `None`.
pub fn load(path: &Path) -> Option<Session> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to read session file");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(session) => Some(session),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Discarding corrupt session file");
            None
        }
    }
}

/// Write `session`, or remove the file when there is none.
pub fn store(path: &Path, session: Option<&Session>) -> Result<()> {
    let Some(session) = session else {
        return clear(path);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(session)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), "Session persisted");
    Ok(())
}

fn clear(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Session file removed");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
