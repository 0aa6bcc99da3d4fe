use serde_json::Value;
use tracing::debug;

use floe_core::config::MemoryIsolation;
use floe_core::types::MemoryKey;

/// Segment used for key parts that could not be derived when the isolation
/// policy allows implicit keys.
const DEFAULT_SEGMENT: &str = "default";

/// Follow a dotted path (`"session.id"`) into a JSON object.
///
/// Strings are returned as-is, numbers and booleans in their JSON form.
/// Anything else (objects, arrays, null, missing) yields `None`.
pub fn lookup_path(context: &Value, path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let mut current = context;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resolve the memory key for one call.
///
/// An explicit key always wins. Otherwise each part is read from
/// `tool_context` through the isolation paths. When a part is missing and
/// `require_explicit_key` is set, memory is disabled for the call (`None`);
/// otherwise the part falls back to `"default"`.
pub fn resolve_key(
    isolation: &MemoryIsolation,
    explicit: Option<&MemoryKey>,
    tool_context: &Value,
) -> Option<MemoryKey> {
    if let Some(key) = explicit {
        return Some(key.clone());
    }

    let tenant = lookup_path(tool_context, &isolation.tenant_key);
    let user = lookup_path(tool_context, &isolation.user_key);
    let session = lookup_path(tool_context, &isolation.session_key);

    match (tenant, user, session) {
        (Some(t), Some(u), Some(s)) => Some(MemoryKey::new(t, u, s)),
        _ if isolation.require_explicit_key => {
            debug!("No memory key resolved, memory disabled for this call");
            None
        }
        (t, u, s) => Some(MemoryKey::new(
            t.unwrap_or_else(|| DEFAULT_SEGMENT.into()),
            u.unwrap_or_else(|| DEFAULT_SEGMENT.into()),
            s.unwrap_or_else(|| DEFAULT_SEGMENT.into()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn isolation(require_explicit_key: bool) -> MemoryIsolation {
        MemoryIsolation {
            tenant_key: "org.id".into(),
            user_key: "user_id".into(),
            session_key: "session_id".into(),
            require_explicit_key,
        }
    }

    #[test]
    fn test_lookup_path_nested() {
        let ctx = json!({"org": {"id": "acme", "tier": 3}, "flag": true, "empty": ""});
        assert_eq!(lookup_path(&ctx, "org.id").as_deref(), Some("acme"));
        assert_eq!(lookup_path(&ctx, "org.tier").as_deref(), Some("3"));
        assert_eq!(lookup_path(&ctx, "flag").as_deref(), Some("true"));
        assert_eq!(lookup_path(&ctx, "org"), None);
        assert_eq!(lookup_path(&ctx, "empty"), None);
        assert_eq!(lookup_path(&ctx, "org.missing"), None);
    }

    #[test]
    fn test_explicit_key_wins() {
        let explicit = MemoryKey::new("t", "u", "s");
        let ctx = json!({"org": {"id": "acme"}, "user_id": "u-1", "session_id": "abc"});
        let key = resolve_key(&isolation(true), Some(&explicit), &ctx).unwrap();
        assert_eq!(key, explicit);
    }

    #[test]
    fn test_derived_from_tool_context() {
        let ctx = json!({"org": {"id": "acme"}, "user_id": "u-1", "session_id": "abc"});
        let key = resolve_key(&isolation(true), None, &ctx).unwrap();
        assert_eq!(key.composite(), "acme:u-1:abc");
    }

    #[test]
    fn test_fail_closed_without_key() {
        let ctx = json!({"org": {"id": "acme"}, "user_id": "u-1"});
        assert!(resolve_key(&isolation(true), None, &ctx).is_none());
    }

    #[test]
    fn test_implicit_default_segments() {
        let ctx = json!({"user_id": "u-1"});
        let key = resolve_key(&isolation(false), None, &ctx).unwrap();
        assert_eq!(key.composite(), "default:u-1:default");
    }
}
