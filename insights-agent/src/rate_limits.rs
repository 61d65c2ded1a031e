// ABOUTME: Account-level rate-limit windows reported by the app-server.
// ABOUTME: Parses account/rateLimits/updated notifications into RateLimitUpdate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RATE_LIMITS_METHOD: &str = "account/rateLimits/updated";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitWindow {
    pub used_percent: f64,
    pub window_minutes: Option<u64>,
    /// Unix seconds
    pub resets_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitUpdate {
    pub primary: Option<RateLimitWindow>,
    pub secondary: Option<RateLimitWindow>,
    pub received_at: DateTime<Utc>,
}

fn parse_window(value: Option<&Value>) -> Option<RateLimitWindow> {
    let value = value?;
    let used_percent = value.get("usedPercent").and_then(|v| v.as_f64())?;
    Some(RateLimitWindow {
        used_percent,
        window_minutes: value.get("windowDurationMins").and_then(|v| v.as_u64()),
        resets_at: value.get("resetsAt").and_then(|v| v.as_i64()),
    })
}

/// Parse notification params. Accepts the snapshot nested under `rateLimits` or at top level.
pub fn parse_rate_limits(params: &Value) -> Option<RateLimitUpdate> {
    let snapshot = params.get("rateLimits").unwrap_or(params);
    let primary = parse_window(snapshot.get("primary"));
    let secondary = parse_window(snapshot.get("secondary"));
    if primary.is_none() && secondary.is_none() {
        return None;
    }
    Some(RateLimitUpdate {
        primary,
        secondary,
        received_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_nested_snapshot() {
        let update = parse_rate_limits(&json!({
            "rateLimits": {
                "primary": {"usedPercent": 42.5, "windowDurationMins": 300, "resetsAt": 1730000000},
                "secondary": null
            }
        }))
        .unwrap();
        let primary = update.primary.unwrap();
        assert_eq!(primary.used_percent, 42.5);
        assert_eq!(primary.window_minutes, Some(300));
        assert_eq!(primary.resets_at, Some(1730000000));
        assert!(update.secondary.is_none());
    }

    #[test]
    fn test_empty_snapshot_is_ignored() {
        assert!(parse_rate_limits(&json!({"rateLimits": {}})).is_none());
    }
}
