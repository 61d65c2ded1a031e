// ABOUTME: Mediates agent filesystem requests against the session's working-directory root.
// ABOUTME: In-root access is served directly, out-of-root access goes through a permission request.

use crate::channels::SessionChannels;
use crate::error::RpcError;
use crate::permission::{PermissionDecision, PermissionRequest};
use crate::tool_kind::ToolKind;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};

/// Where a requested path falls relative to the session root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsAccess {
    InRoot,
    NeedsPermission,
}

pub struct FsMediator {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
}

/// Resolve `.` and `..` without touching the filesystem
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest
fn canonicalize_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(&existing) {
            let mut resolved = canonical;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return Some(resolved);
        }
        let name = existing.file_name()?.to_os_string();
        rest.push(name);
        if !existing.pop() {
            return None;
        }
    }
}

impl FsMediator {
    /// A relative root is resolved against the current directory. A root that
    /// still is not absolute afterwards contains nothing.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        let root = normalize_lexically(&root);
        let canonical_root = std::fs::canonicalize(&root).ok();
        Self {
            root,
            canonical_root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Classify a path. Non-absolute paths are an invalid-params error.
    pub fn check(&self, path: &Path) -> Result<FsAccess, RpcError> {
        if !path.is_absolute() {
            return Err(RpcError::invalid_params(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }
        if self.is_within_root(path) {
            Ok(FsAccess::InRoot)
        } else {
            Ok(FsAccess::NeedsPermission)
        }
    }

    /// Lexically inside the root, and still inside once symlinks are resolved
    pub fn is_within_root(&self, path: &Path) -> bool {
        if !self.root.is_absolute() {
            return false;
        }
        let lexical = normalize_lexically(path);
        if !lexical.starts_with(&self.root) {
            return false;
        }
        match (&self.canonical_root, canonicalize_existing_prefix(&lexical)) {
            (Some(root), Some(resolved)) => resolved.starts_with(root),
            _ => true,
        }
    }

    /// Read a file, optionally slicing from 1-based `line` for `limit` lines
    pub async fn read(
        &self,
        path: &Path,
        line: Option<u64>,
        limit: Option<u64>,
    ) -> Result<String, RpcError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RpcError::internal(format!("Failed to read {}: {}", path.display(), e)))?;
        Ok(slice_lines(&content, line, limit))
    }

    pub async fn write(&self, path: &Path, content: &str) -> Result<(), RpcError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RpcError::internal(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| RpcError::internal(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Handle `fs/read_text_file`
    pub async fn read_text_file(
        &self,
        params: &Value,
        channels: &SessionChannels,
    ) -> Result<Value, RpcError> {
        let path = path_param(params)?;
        self.authorize(&path, "Read", ToolKind::Read, "Read access", channels)
            .await?;
        let line = params.get("line").and_then(|v| v.as_u64());
        let limit = params.get("limit").and_then(|v| v.as_u64());
        let content = self.read(&path, line, limit).await?;
        Ok(json!({ "content": content }))
    }

    /// Handle `fs/write_text_file`
    pub async fn write_text_file(
        &self,
        params: &Value,
        channels: &SessionChannels,
    ) -> Result<Value, RpcError> {
        let path = path_param(params)?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::invalid_params("Missing content"))?;
        self.authorize(&path, "Write", ToolKind::Edit, "Write access", channels)
            .await?;
        self.write(&path, content).await?;
        Ok(json!({}))
    }

    async fn authorize(
        &self,
        path: &Path,
        tool_name: &str,
        kind: ToolKind,
        action: &str,
        channels: &SessionChannels,
    ) -> Result<(), RpcError> {
        if self.check(path)? == FsAccess::InRoot {
            return Ok(());
        }

        tracing::info!(
            session_id = %channels.session_id(),
            path = %path.display(),
            root = %self.root.display(),
            "Out-of-root file access, asking for permission"
        );
        let (request, pending) = PermissionRequest::new(
            channels.session_id(),
            tool_name,
            kind,
            json!({ "path": path.display().to_string() }),
        );
        let request = request.with_reason(Some(format!(
            "{} outside the working directory: {}",
            action,
            path.display()
        )));
        channels.request_permission(request);

        match pending.wait().await {
            PermissionDecision::Allow { .. } => Ok(()),
            PermissionDecision::Deny { reason } => Err(RpcError::permission_denied(format!(
                "Permission denied for {}: {}",
                path.display(),
                reason
            ))),
        }
    }
}

fn path_param(params: &Value) -> Result<PathBuf, RpcError> {
    params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| RpcError::invalid_params("Missing path"))
}

fn slice_lines(content: &str, line: Option<u64>, limit: Option<u64>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let skip = line.map(|l| l.saturating_sub(1) as usize).unwrap_or(0);
    let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    content
        .lines()
        .skip(skip)
        .take(take)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lexically_resolves_parent_dirs() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexically(Path::new("/a/../../b")), PathBuf::from("/b"));
    }

    #[test]
    fn test_slice_lines() {
        let text = "one\ntwo\nthree\nfour";
        assert_eq!(slice_lines(text, Some(2), Some(2)), "two\nthree");
        assert_eq!(slice_lines(text, None, Some(1)), "one");
        assert_eq!(slice_lines(text, Some(4), None), "four");
        assert_eq!(slice_lines(text, None, None), text);
    }

    #[test]
    fn test_relative_path_is_invalid_params() {
        let mediator = FsMediator::new("/work");
        let err = mediator.check(Path::new("src/main.rs")).unwrap_err();
        assert_eq!(err.code, crate::error::codes::INVALID_PARAMS);
    }

    #[test]
    fn test_dotdot_escape_needs_permission() {
        let mediator = FsMediator::new("/work/project");
        assert_eq!(
            mediator.check(Path::new("/work/project/../secrets")).unwrap(),
            FsAccess::NeedsPermission
        );
        assert_eq!(
            mediator.check(Path::new("/work/project/src/lib.rs")).unwrap(),
            FsAccess::InRoot
        );
    }

    #[test]
    fn test_relative_root_resolves_against_current_dir() {
        let mediator = FsMediator::new(".");
        assert!(mediator.root().is_absolute());
        assert_eq!(
            mediator.check(Path::new("/etc/hostname")).unwrap(),
            FsAccess::NeedsPermission
        );
        let inside = std::env::current_dir().unwrap().join("Cargo.toml");
        assert_eq!(mediator.check(&inside).unwrap(), FsAccess::InRoot);
    }

    #[test]
    fn test_empty_root_contains_nothing() {
        let mediator = FsMediator {
            root: PathBuf::new(),
            canonical_root: None,
        };
        assert_eq!(
            mediator.check(Path::new("/etc/hostname")).unwrap(),
            FsAccess::NeedsPermission
        );
    }
}
