//! Configuration file rendering.
//!
//! The coordinator decides *what* a configuration file should say; a
//! [`ConfigRenderer`] decides how it lands on disk. [`FileRenderer`] writes
//! PostgreSQL `key = 'value'` files atomically and reports whether the
//! content actually changed, which is what drives reload decisions.

use crate::error::{AgentError, Result};
use crate::substrate::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Recovery settings file.
pub const RECOVERY_TEMPLATE: &str = "recovery.conf";
/// Empty marker telling PostgreSQL 12+ to start as a standby.
pub const STANDBY_SIGNAL_TEMPLATE: &str = "standby.signal";

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub template: &'static str,
    pub path: PathBuf,
    pub data: BTreeMap<String, String>,
    pub mode: u32,
    /// `(uid, gid)` to chown the file to, if any.
    pub owner: Option<(u32, u32)>,
}

pub trait ConfigRenderer: Send + Sync {
    /// Write the file. Returns true if its content changed.
    fn render(&self, request: RenderRequest) -> BoxFuture<'_, bool>;

    /// Remove the file. Returns true if it existed.
    fn remove(&self, path: PathBuf) -> BoxFuture<'_, bool>;
}

/// Renders templates straight to the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FileRenderer;

impl FileRenderer {
    pub fn new() -> Self {
        Self
    }

    fn content(template: &str, data: &BTreeMap<String, String>) -> Result<String> {
        match template {
            RECOVERY_TEMPLATE => {
                let mut out = String::from("# Managed by pg-replication-agent. Local changes will be lost.\n");
                for (key, value) in data {
                    out.push_str(&format!("{} = '{}'\n", key, value.replace('\'', "''")));
                }
                Ok(out)
            }
            STANDBY_SIGNAL_TEMPLATE => Ok(String::new()),
            other => Err(AgentError::Internal(format!("unknown template {}", other))),
        }
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn read_digest(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(digest(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AgentError::io(format!("read {}", path.display()), e)),
    }
}

impl ConfigRenderer for FileRenderer {
    fn render(&self, request: RenderRequest) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let content = Self::content(request.template, &request.data)?;
            let path = &request.path;
            let before = read_digest(path).await?;
            let after = digest(content.as_bytes());

            if before.as_deref() == Some(after.as_str()) {
                debug!(path = %path.display(), "Rendered file unchanged");
                return Ok(false);
            }

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AgentError::io(format!("create {}", parent.display()), e))?;
            }

            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, content.as_bytes())
                .await
                .map_err(|e| AgentError::io(format!("write {}", tmp.display()), e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(request.mode))
                    .await
                    .map_err(|e| AgentError::io(format!("chmod {}", tmp.display()), e))?;
                if let Some((uid, gid)) = request.owner {
                    std::os::unix::fs::chown(&tmp, Some(uid), Some(gid))
                        .map_err(|e| AgentError::io(format!("chown {}", tmp.display()), e))?;
                }
            }

            tokio::fs::rename(&tmp, path)
                .await
                .map_err(|e| AgentError::io(format!("rename {}", path.display()), e))?;

            debug!(path = %path.display(), template = request.template, "Rendered file changed");
            Ok(true)
        })
    }

    fn remove(&self, path: PathBuf) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(AgentError::io(format!("remove {}", path.display()), e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(path: PathBuf, pairs: &[(&str, &str)]) -> RenderRequest {
        RenderRequest {
            template: RECOVERY_TEMPLATE,
            path,
            data: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            mode: 0o600,
            owner: None,
        }
    }

    #[tokio::test]
    async fn test_render_detects_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main").join("recovery.conf");
        let renderer = FileRenderer::new();

        assert!(renderer.render(request(path.clone(), &[("standby_mode", "on")])).await.unwrap());
        assert!(!renderer.render(request(path.clone(), &[("standby_mode", "on")])).await.unwrap());
        assert!(renderer.render(request(path.clone(), &[("standby_mode", "off")])).await.unwrap());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("standby_mode = 'off'"));
    }

    #[tokio::test]
    async fn test_render_escapes_quotes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.conf");
        FileRenderer::new()
            .render(request(path.clone(), &[("primary_conninfo", "password='x'")]))
            .await
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("primary_conninfo = 'password=''x'''"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_render_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.conf");
        FileRenderer::new().render(request(path.clone(), &[])).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("standby.signal");
        let renderer = FileRenderer::new();
        assert!(!renderer.remove(path.clone()).await.unwrap());
        renderer
            .render(RenderRequest {
                template: STANDBY_SIGNAL_TEMPLATE,
                path: path.clone(),
                data: BTreeMap::new(),
                mode: 0o600,
                owner: None,
            })
            .await
            .unwrap();
        assert!(renderer.remove(path).await.unwrap());
    }
}
