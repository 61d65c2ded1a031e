// ABOUTME: FIFO queue of permission requests waiting on the user, head is the current prompt.
// ABOUTME: Every removal resolves the request exactly once; operations never fail.

use insights_agent::PermissionRequest;
use serde_json::Value;
use std::collections::VecDeque;

/// Reason used when a prompt is withdrawn because the tool call timed out
pub const TIMEOUT_REASON: &str = "Permission request timed out";

#[derive(Default)]
pub struct PermissionQueue {
    requests: VecDeque<PermissionRequest>,
}

impl PermissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request. Returns true if it became the current prompt.
    pub fn push(&mut self, request: PermissionRequest) -> bool {
        self.prune_resolved();
        if self.requests.iter().any(|r| r.id == request.id) {
            tracing::debug!(request_id = %request.id, "Permission request already queued");
            return false;
        }
        self.requests.push_back(request);
        self.requests.len() == 1
    }

    pub fn current(&self) -> Option<&PermissionRequest> {
        self.requests.front()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionRequest> {
        self.requests.iter()
    }

    /// Drop requests that were resolved outside the queue. Returns how many were dropped.
    pub fn prune_resolved(&mut self) -> usize {
        let before = self.requests.len();
        self.requests.retain(|r| !r.is_resolved());
        before - self.requests.len()
    }

    /// Allow the head request and drop it from the queue
    pub fn allow_current(&mut self, updated_input: Option<Value>) -> Option<PermissionRequest> {
        self.prune_resolved();
        let request = self.requests.pop_front()?;
        if !request.allow(updated_input) {
            tracing::debug!(request_id = %request.id, "Permission request was already resolved");
        }
        Some(request)
    }

    /// Deny the head request and drop it from the queue
    pub fn deny_current(&mut self, reason: &str) -> Option<PermissionRequest> {
        self.prune_resolved();
        let request = self.requests.pop_front()?;
        if !request.deny(reason) {
            tracing::debug!(request_id = %request.id, "Permission request was already resolved");
        }
        Some(request)
    }

    /// Withdraw the request for a tool call, denying it with the timeout reason
    pub fn remove_by_tool_use_id(&mut self, tool_use_id: &str) -> Option<PermissionRequest> {
        let index = self
            .requests
            .iter()
            .position(|r| r.tool_use_id.as_deref() == Some(tool_use_id))?;
        let request = self.requests.remove(index)?;
        request.deny(TIMEOUT_REASON);
        Some(request)
    }

    /// Deny everything in queue order and empty it. Returns how many were denied.
    pub fn deny_all(&mut self, reason: &str) -> usize {
        let count = self.requests.len();
        for request in self.requests.drain(..) {
            request.deny(reason);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insights_agent::{PermissionDecision, ToolKind};
    use serde_json::json;

    fn request(tool: &str) -> (PermissionRequest, insights_agent::PendingDecision) {
        PermissionRequest::new("s1", tool, ToolKind::Execute, json!({}))
    }

    #[test]
    fn test_push_reports_first() {
        let mut queue = PermissionQueue::new();
        let (a, _pa) = request("Bash");
        let (b, _pb) = request("Write");
        assert!(queue.push(a));
        assert!(!queue.push(b));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.current().map(|r| r.tool_name.as_str()), Some("Bash"));
    }

    #[test]
    fn test_duplicate_id_ignored() {
        let mut queue = PermissionQueue::new();
        let (a, _pa) = request("Bash");
        queue.push(a.clone());
        assert!(!queue.push(a));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_allow_resolves_head_only() {
        let mut queue = PermissionQueue::new();
        let (a, pa) = request("Bash");
        let (b, _pb) = request("Write");
        queue.push(a);
        queue.push(b.clone());

        let allowed = queue.allow_current(Some(json!({"command": "ls"})));
        assert_eq!(allowed.map(|r| r.tool_name), Some("Bash".to_string()));
        assert_eq!(
            pa.wait().await,
            PermissionDecision::Allow {
                updated_input: Some(json!({"command": "ls"}))
            }
        );
        assert!(!b.is_resolved());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_by_tool_use_id_denies_with_timeout() {
        let mut queue = PermissionQueue::new();
        let (a, _pa) = request("Bash");
        let (b, pb) = request("Write");
        queue.push(a);
        queue.push(b.with_tool_use_id(Some("toolu_2".to_string())));

        assert!(queue.remove_by_tool_use_id("toolu_9").is_none());
        assert!(queue.remove_by_tool_use_id("toolu_2").is_some());
        assert_eq!(
            pb.wait().await,
            PermissionDecision::Deny {
                reason: TIMEOUT_REASON.to_string()
            }
        );
        assert_eq!(queue.current().map(|r| r.tool_name.as_str()), Some("Bash"));
    }

    #[tokio::test]
    async fn test_requests_resolved_elsewhere_are_skipped() {
        let mut queue = PermissionQueue::new();
        let (a, _pa) = request("Bash");
        let (b, pb) = request("Write");
        queue.push(a.clone());
        queue.push(b);

        assert!(a.deny("Cancelled by agent"));
        let allowed = queue.allow_current(None);
        assert_eq!(allowed.map(|r| r.tool_name), Some("Write".to_string()));
        assert!(pb.wait().await.is_allow());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_drops_resolved_head() {
        let mut queue = PermissionQueue::new();
        let (a, _pa) = request("Bash");
        let (b, _pb) = request("Write");
        queue.push(a.clone());
        a.allow(None);
        assert!(queue.push(b));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_queue_operations_are_noops() {
        let mut queue = PermissionQueue::new();
        assert!(queue.allow_current(None).is_none());
        assert!(queue.deny_current("no").is_none());
        assert_eq!(queue.deny_all("no"), 0);
    }
}
