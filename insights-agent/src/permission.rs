// ABOUTME: PermissionRequest with a single-resolution slot shared by all clones.
// ABOUTME: The backend side awaits a PendingDecision; dropping every clone resolves it as a deny.

use crate::event::EventKind;
use crate::tool_kind::ToolKind;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};

/// Reason reported when a request is dropped without an answer
pub const DROPPED_REASON: &str = "Permission request dropped";

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow { updated_input: Option<Value> },
    Deny { reason: String },
}

impl PermissionDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionDecision::Allow { .. })
    }
}

struct Slot {
    tx: Mutex<Option<oneshot::Sender<PermissionDecision>>>,
    resolved: watch::Sender<bool>,
}

/// A tool call waiting for the user's allow/deny
#[derive(Clone)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_kind: ToolKind,
    pub tool_input: Value,
    pub tool_use_id: Option<String>,
    pub reason: Option<String>,
    slot: Arc<Slot>,
}

impl PermissionRequest {
    /// Create a request and the receiving end the backend awaits
    pub fn new(
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_kind: ToolKind,
        tool_input: Value,
    ) -> (Self, PendingDecision) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            tool_name: tool_name.into(),
            tool_kind,
            tool_input,
            tool_use_id: None,
            reason: None,
            slot: Arc::new(Slot {
                tx: Mutex::new(Some(tx)),
                resolved: watch::Sender::new(false),
            }),
        };
        (request, PendingDecision { rx })
    }

    pub fn with_tool_use_id(mut self, tool_use_id: Option<String>) -> Self {
        self.tool_use_id = tool_use_id;
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    /// Allow the tool call. Returns false if the request was already resolved.
    pub fn allow(&self, updated_input: Option<Value>) -> bool {
        self.resolve(PermissionDecision::Allow { updated_input })
    }

    /// Deny the tool call. Returns false if the request was already resolved.
    pub fn deny(&self, reason: impl Into<String>) -> bool {
        self.resolve(PermissionDecision::Deny {
            reason: reason.into(),
        })
    }

    pub fn resolve(&self, decision: PermissionDecision) -> bool {
        let tx = self
            .slot
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match tx {
            Some(tx) => {
                // The backend may have stopped waiting; the request still counts as resolved.
                let _ = tx.send(decision);
                self.slot.resolved.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Completes once any clone resolves the request
    pub async fn resolved(&self) {
        let mut rx = self.slot.resolved.subscribe();
        // The sender lives in the slot we hold, so this only returns once resolved.
        let _ = rx.wait_for(|resolved| *resolved).await;
    }

    /// The event announcing this request on the session's event stream
    pub fn to_event_kind(&self) -> EventKind {
        EventKind::PermissionRequest {
            request_id: self.id.clone(),
            tool_name: self.tool_name.clone(),
            tool_kind: self.tool_kind,
            input: self.tool_input.clone(),
            tool_use_id: self.tool_use_id.clone(),
            reason: self.reason.clone(),
        }
    }
}

impl fmt::Debug for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionRequest")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("tool_name", &self.tool_name)
            .field("tool_kind", &self.tool_kind)
            .field("tool_use_id", &self.tool_use_id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Backend-side handle for the decision on a PermissionRequest
pub struct PendingDecision {
    rx: oneshot::Receiver<PermissionDecision>,
}

impl PendingDecision {
    /// Wait for the decision. A request dropped unanswered resolves as a deny.
    pub async fn wait(self) -> PermissionDecision {
        self.rx.await.unwrap_or_else(|_| PermissionDecision::Deny {
            reason: DROPPED_REASON.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let (request, pending) =
            PermissionRequest::new("s1", "Bash", ToolKind::Execute, json!({"command": "ls"}));
        let clone = request.clone();

        assert!(request.allow(Some(json!({"command": "ls -la"}))));
        assert!(!clone.deny("too late"));
        assert!(clone.is_resolved());

        assert_eq!(
            pending.wait().await,
            PermissionDecision::Allow {
                updated_input: Some(json!({"command": "ls -la"}))
            }
        );
    }

    #[tokio::test]
    async fn test_resolved_wakes_other_clones() {
        let (request, _pending) =
            PermissionRequest::new("s1", "Bash", ToolKind::Execute, json!({}));
        let watcher = request.clone();
        let waiting = tokio::spawn(async move { watcher.resolved().await });
        assert!(request.deny("Cancelled by agent"));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        // Already resolved: returns immediately
        request.resolved().await;
    }

    #[tokio::test]
    async fn test_dropped_request_resolves_as_deny() {
        let (request, pending) = PermissionRequest::new("s1", "Read", ToolKind::Read, json!({}));
        drop(request);
        assert_eq!(
            pending.wait().await,
            PermissionDecision::Deny {
                reason: DROPPED_REASON.to_string()
            }
        );
    }

    #[test]
    fn test_event_kind_carries_request_fields() {
        let (request, _pending) = PermissionRequest::new("s1", "Edit", ToolKind::Edit, json!({}));
        let request = request.with_tool_use_id(Some("toolu_1".to_string()));
        match request.to_event_kind() {
            EventKind::PermissionRequest {
                request_id,
                tool_use_id,
                tool_kind,
                ..
            } => {
                assert_eq!(request_id, request.id);
                assert_eq!(tool_use_id.as_deref(), Some("toolu_1"));
                assert_eq!(tool_kind, ToolKind::Edit);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
