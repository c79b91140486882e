//! Static content shipped with plugins.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{HostError, Result};
use crate::fs::FileSystem;
use crate::identity::PluginIdentity;

/// Lifetime reported for a full response: the caller must not cache it.
pub const NOT_CACHEABLE: i64 = -1;

/// Directory of plugin views on the content file system.
pub const VIEWS_ROOT: &str = "views";

/// A view resource, or a "you already have it" answer with an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedViewData {
    /// Path of the resource on the content file system
    pub path: PathBuf,
    pub mime_type: String,
    /// Empty when the client's copy is still current
    pub data: Vec<u8>,
    pub last_write_time: DateTime<Utc>,
    /// Seconds the client's copy stays valid, or [`NOT_CACHEABLE`]
    pub lifetime_seconds: i64,
}

impl CachedViewData {
    /// Whether this is a "not modified" answer without a body.
    pub fn is_not_modified(&self) -> bool {
        self.lifetime_seconds > 0 && self.data.is_empty()
    }
}

/// Reads plugin view files under `/views/{id} {major}.{minor}/`.
#[derive(Debug, Clone)]
pub struct ViewDataCache {
    fs: Arc<dyn FileSystem>,
}

impl ViewDataCache {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Path of a plugin's view resource. `sub_path` may or may not start with `/`.
    pub fn resource_path(identity: &PluginIdentity, sub_path: &str) -> PathBuf {
        Path::new(VIEWS_ROOT)
            .join(identity.content_dir_name())
            .join(sub_path.trim_start_matches('/'))
    }

    /// Fetch a view resource.
    ///
    /// Returns `None` when the resource does not exist or the sub-path tries
    /// to leave the plugin's view directory. When `if_modified_since` is
    /// later than the resource's last write, the answer has an empty body
    /// and the remaining lifetime of the client's copy.
    pub async fn fetch(
        &self,
        identity: &PluginIdentity,
        sub_path: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<Option<CachedViewData>> {
        if Path::new(sub_path).components().any(|c| c == Component::ParentDir) {
            warn!("Refusing view path {:?} for plugin {}", sub_path, identity);
            return Ok(None);
        }

        let fs = self.fs.clone();
        let path = Self::resource_path(identity, sub_path);
        tokio::task::spawn_blocking(move || read_view(fs.as_ref(), path, if_modified_since))
            .await
            .map_err(|e| HostError::Task(e.to_string()))?
    }
}

fn read_view(
    fs: &dyn FileSystem,
    path: PathBuf,
    if_modified_since: Option<DateTime<Utc>>,
) -> Result<Option<CachedViewData>> {
    let stat = match fs.stat(&path) {
        Ok(stat) => stat,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("View file {} not found", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let mime_type = mime_guess::from_path(&path).first_or_octet_stream().essence_str().to_string();

    if let Some(since) = if_modified_since {
        if stat.last_write_time < since {
            let remaining = (since - stat.last_write_time).num_seconds();
            if remaining > 0 {
                debug!("View file {} is unchanged; client copy valid for {}s", path.display(), remaining);
                return Ok(Some(CachedViewData {
                    path,
                    mime_type,
                    data: Vec::new(),
                    last_write_time: stat.last_write_time,
                    lifetime_seconds: remaining,
                }));
            }
        }
    }

    let data = fs.read(&path)?;
    Ok(Some(CachedViewData {
        path,
        mime_type,
        data,
        last_write_time: stat.last_write_time,
        lifetime_seconds: NOT_CACHEABLE,
    }))
}
