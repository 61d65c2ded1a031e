// ABOUTME: Per-session output streams: normalized events, raw wire messages, permission requests.
// ABOUTME: Every backend session emits through a SessionChannels so tagging stays uniform.

use crate::event::{EventKind, InsightsEvent, Provider, RawMessage};
use crate::permission::PermissionRequest;
use crate::subscription::{Broadcaster, Subscription};
use serde_json::Value;
use std::sync::RwLock;

pub struct SessionChannels {
    provider: Provider,
    session_id: String,
    resolved_session_id: RwLock<String>,
    include_raw: bool,
    events: Broadcaster<InsightsEvent>,
    messages: Broadcaster<RawMessage>,
    permissions: Broadcaster<PermissionRequest>,
}

impl SessionChannels {
    pub fn new(
        provider: Provider,
        session_id: impl Into<String>,
        resolved_session_id: impl Into<String>,
        include_raw: bool,
    ) -> Self {
        Self {
            provider,
            session_id: session_id.into(),
            resolved_session_id: RwLock::new(resolved_session_id.into()),
            include_raw,
            events: Broadcaster::new(),
            messages: Broadcaster::new(),
            permissions: Broadcaster::new(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn resolved_session_id(&self) -> String {
        self.resolved_session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_resolved_session_id(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        let mut resolved = self
            .resolved_session_id
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *resolved != id {
            tracing::debug!(session_id = %self.session_id, resolved = %id, "Resolved session id changed");
            *resolved = id.to_string();
        }
    }

    pub fn emit(&self, kind: EventKind) {
        self.emit_with_raw(kind, None);
    }

    /// Emit one event, attaching `raw` when the session asked for raw payloads
    pub fn emit_with_raw(&self, kind: EventKind, raw: Option<&Value>) {
        if let EventKind::SessionInit {
            resolved_session_id,
            ..
        } = &kind
        {
            self.set_resolved_session_id(resolved_session_id);
        }
        let mut event = InsightsEvent::new(self.provider, self.session_id.clone(), kind);
        if self.include_raw {
            if let Some(raw) = raw {
                event = event.with_raw(raw.clone());
            }
        }
        tracing::trace!(session_id = %self.session_id, event = event.event_type(), "Emitting event");
        self.events.send(event);
    }

    pub fn emit_all(&self, kinds: Vec<EventKind>, raw: Option<&Value>) {
        for kind in kinds {
            self.emit_with_raw(kind, raw);
        }
    }

    pub fn record_inbound(&self, payload: &Value) {
        self.messages.send(RawMessage::inbound(payload.clone()));
    }

    pub fn record_outbound(&self, payload: &Value) {
        self.messages.send(RawMessage::outbound(payload.clone()));
    }

    /// Announce a permission request on the event stream and hand it to permission consumers
    pub fn request_permission(&self, request: PermissionRequest) {
        tracing::info!(
            session_id = %self.session_id,
            tool = %request.tool_name,
            request_id = %request.id,
            "Permission requested"
        );
        self.emit(request.to_event_kind());
        self.permissions.send(request);
    }

    pub fn subscribe_events(&self) -> Subscription<InsightsEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_messages(&self) -> Subscription<RawMessage> {
        self.messages.subscribe()
    }

    pub fn subscribe_permission_requests(&self) -> Subscription<PermissionRequest> {
        self.permissions.subscribe()
    }

    /// End all three streams
    pub fn close(&self) {
        self.events.close();
        self.messages.close();
        self.permissions.close();
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}
