//! Context predicates carried by tuples.
//!
//! A tuple may hold a JSON `conditions` document restricting when it is
//! eligible. The predicate language is deliberately small: a time
//! window, an allowed-IP list, and a device-tag equality. Tuples without
//! conditions are always eligible.

use serde_json::Value;

use crate::metadata::Timestamp;

/// Evaluates a tuple's conditions against a caller context document.
///
/// Supported keys:
/// - `time_window`: `{ "start_ms": i64?, "end_ms": i64? }`, compared to
///   the current time.
/// - `allowed_ips`: list of IPs; a trailing `*` matches a prefix.
/// - `device_tag`: string equality with the context's `device_tag`.
///
/// A condition over a context field the caller did not supply fails
/// closed.
pub fn evaluate(conditions: &Value, context: Option<&Value>, now: Timestamp) -> bool {
    let Some(object) = conditions.as_object() else {
        // A malformed conditions document never grants.
        return false;
    };

    for (key, expected) in object {
        let satisfied = match key.as_str() {
            "time_window" => check_time_window(expected, now),
            "allowed_ips" => check_allowed_ips(expected, context),
            "device_tag" => check_device_tag(expected, context),
            _ => false,
        };
        if !satisfied {
            return false;
        }
    }
    true
}

fn check_time_window(window: &Value, now: Timestamp) -> bool {
    let start = window.get("start_ms").and_then(Value::as_i64);
    let end = window.get("end_ms").and_then(Value::as_i64);
    if let Some(start) = start {
        if now.0 < start {
            return false;
        }
    }
    if let Some(end) = end {
        if now.0 >= end {
            return false;
        }
    }
    true
}

fn check_allowed_ips(allowed: &Value, context: Option<&Value>) -> bool {
    let Some(ip) = context.and_then(|c| c.get("ip")).and_then(Value::as_str) else {
        return false;
    };
    let Some(list) = allowed.as_array() else {
        return false;
    };
    list.iter().filter_map(Value::as_str).any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => ip.starts_with(prefix),
        None => ip == pattern,
    })
}

fn check_device_tag(expected: &Value, context: Option<&Value>) -> bool {
    let Some(tag) = context.and_then(|c| c.get("device_tag")).and_then(Value::as_str) else {
        return false;
    };
    expected.as_str() == Some(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_time_window() {
        let conditions = json!({ "time_window": { "start_ms": 100, "end_ms": 200 } });
        assert!(!evaluate(&conditions, None, Timestamp(50)));
        assert!(evaluate(&conditions, None, Timestamp(150)));
        assert!(!evaluate(&conditions, None, Timestamp(200)));
    }

    #[test]
    fn test_ip_membership_with_prefix() {
        let conditions = json!({ "allowed_ips": ["10.0.0.1", "192.168.*"] });
        let ctx = json!({ "ip": "192.168.4.7" });
        assert!(evaluate(&conditions, Some(&ctx), Timestamp(0)));
        let ctx = json!({ "ip": "10.0.0.2" });
        assert!(!evaluate(&conditions, Some(&ctx), Timestamp(0)));
        // Missing context field fails closed.
        assert!(!evaluate(&conditions, None, Timestamp(0)));
    }

    #[test]
    fn test_device_tag_equality() {
        let conditions = json!({ "device_tag": "trusted" });
        assert!(evaluate(&conditions, Some(&json!({ "device_tag": "trusted" })), Timestamp(0)));
        assert!(!evaluate(&conditions, Some(&json!({ "device_tag": "byod" })), Timestamp(0)));
    }

    #[test]
    fn test_all_conditions_must_hold() {
        let conditions = json!({
            "time_window": { "end_ms": 100 },
            "device_tag": "trusted"
        });
        let ctx = json!({ "device_tag": "trusted" });
        assert!(evaluate(&conditions, Some(&ctx), Timestamp(50)));
        assert!(!evaluate(&conditions, Some(&ctx), Timestamp(150)));
    }

    #[test]
    fn test_unknown_predicate_fails_closed() {
        let conditions = json!({ "moon_phase": "full" });
        assert!(!evaluate(&conditions, None, Timestamp(0)));
    }
}
