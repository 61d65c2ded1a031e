// ABOUTME: Shared helpers for backend integration tests.
// ABOUTME: Waits on subscriptions with a deadline so a missing event fails instead of hanging.

#![allow(dead_code)]

use insights_agent::{EventKind, InsightsEvent, Subscription};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

/// Next event matching `predicate`, skipping the rest
pub async fn next_event<P>(events: &mut Subscription<InsightsEvent>, predicate: P) -> InsightsEvent
where
    P: Fn(&EventKind) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event.kind) => return event,
                Some(_) => continue,
                None => panic!("Event stream closed before a matching event"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event up to and including the first turn_complete
pub async fn collect_turn(events: &mut Subscription<InsightsEvent>) -> Vec<EventKind> {
    tokio::time::timeout(WAIT, async {
        let mut kinds = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event.kind, EventKind::TurnComplete { .. });
            kinds.push(event.kind);
            if done {
                break;
            }
        }
        kinds
    })
    .await
    .expect("timed out waiting for turn_complete")
}

/// Drain until the stream closes
pub async fn collect_until_closed(events: &mut Subscription<InsightsEvent>) -> Vec<EventKind> {
    tokio::time::timeout(WAIT, async {
        let mut kinds = Vec::new();
        while let Some(event) = events.recv().await {
            kinds.push(event.kind);
        }
        kinds
    })
    .await
    .expect("timed out waiting for stream to close")
}

pub async fn next<T: Clone>(subscription: &mut Subscription<T>) -> T {
    tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("timed out waiting for item")
        .expect("subscription closed")
}
