//! Webhook normalization
//!
//! Turns a raw notification body into a canonical [`CallEvent`]. Known shapes
//! are tried in order:
//!
//! 1. Graph change notification envelope: `{"value": [{"resourceData": {...}}]}`
//! 2. Direct call object: `{"id": ..., "state": ...}`, or an OData id path
//!    such as `/communications/calls/{id}`
//! 3. Bot Framework activity: unwrapped only when its `value`/`channelData`
//!    carries a call object, otherwise reported as not a call
//!
//! Normalization never fails outright: fields that cannot be read are `None`.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::models::{CallDirection, CallEvent, CallState};

/// Discriminated result of normalizing one body.
#[derive(Debug, Clone)]
pub enum Normalized {
    /// The body was the call object itself.
    Direct(CallEvent),
    /// The call object was unwrapped from an envelope or activity.
    Wrapped(CallEvent),
    /// Valid content that is not a call event; acknowledge and route elsewhere.
    NotACall(NotACallReason),
    /// Looked like JSON but could not be parsed.
    Unparseable(String),
}

#[cfg(test)]
impl Normalized {
    pub fn event(&self) -> Option<&CallEvent> {
        match self {
            Self::Direct(e) | Self::Wrapped(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_event(self) -> Option<CallEvent> {
        match self {
            Self::Direct(e) | Self::Wrapped(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotACallReason {
    Empty,
    /// SDP or other non-JSON content.
    NonJson,
    /// Conversational activity (message, typing, ...).
    Activity,
    /// JSON without any recognizable call fields.
    NoCallFields,
}

impl NotACallReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty_body",
            Self::NonJson => "non_json",
            Self::Activity => "activity",
            Self::NoCallFields => "no_call_fields",
        }
    }
}

/// Normalize a webhook body. Only the `Content-Type` header is consulted,
/// to tell SDP and plain text apart from JSON.
pub fn normalize(headers: &HeaderMap, body: &[u8], received_at: DateTime<Utc>) -> Normalized {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Normalized::NotACall(NotACallReason::Empty);
    }

    let declared_non_json = content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/sdp") || ct.starts_with("text/plain")
        })
        .unwrap_or(false);
    let looks_like_json = trimmed.starts_with('{') || trimmed.starts_with('[');
    if declared_non_json && !looks_like_json {
        return Normalized::NotACall(NotACallReason::NonJson);
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) if looks_like_json => return Normalized::Unparseable(e.to_string()),
        Err(_) => return Normalized::NotACall(NotACallReason::NonJson),
    };

    let Some(obj) = value.as_object() else {
        return Normalized::NotACall(NotACallReason::NoCallFields);
    };

    if let Some(event) = from_envelope(obj, received_at) {
        return Normalized::Wrapped(event);
    }
    if is_call_object(obj) {
        return Normalized::Direct(build_event(obj, None, received_at));
    }
    if obj.get("type").and_then(Value::as_str).is_some() {
        return match from_activity(obj, received_at) {
            Some(event) => Normalized::Wrapped(event),
            None => Normalized::NotACall(NotACallReason::Activity),
        };
    }
    if obj.contains_key("state") {
        // A state without any id: acknowledged, never actioned.
        return Normalized::Direct(build_event(obj, None, received_at));
    }

    Normalized::NotACall(NotACallReason::NoCallFields)
}

/// Graph change notification: first element of `value` carrying `resourceData`.
fn from_envelope(obj: &Map<String, Value>, received_at: DateTime<Utc>) -> Option<CallEvent> {
    let first = obj.get("value")?.as_array()?.first()?.as_object()?;
    let resource_data = first.get("resourceData")?.as_object()?;

    let mut event = build_event(resource_data, Some(first), received_at);
    event.client_state = str_field(first, &["clientState", "client_state"]);
    Some(event)
}

/// Activity whose `value` or `channelData` holds a call object.
fn from_activity(obj: &Map<String, Value>, received_at: DateTime<Utc>) -> Option<CallEvent> {
    ["value", "channelData"]
        .iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_object))
        .find(|inner| is_call_object(inner))
        .map(|inner| build_event(inner, None, received_at))
}

fn is_call_object(obj: &Map<String, Value>) -> bool {
    let has_state = obj.get("state").and_then(Value::as_str).is_some();
    let has_plain_id = str_field(obj, &["id", "callId", "call_id"]).is_some();
    (has_state && has_plain_id) || odata_call_id(obj).is_some()
}

/// Build an event from a call object. `container` is the envelope element,
/// consulted for the id when the call object does not carry one.
fn build_event(
    obj: &Map<String, Value>,
    container: Option<&Map<String, Value>>,
    received_at: DateTime<Utc>,
) -> CallEvent {
    let call_id = str_field(obj, &["id", "callId", "call_id"])
        .or_else(|| odata_call_id(obj))
        .or_else(|| container.and_then(odata_call_id));

    let state = str_field(obj, &["state", "callState"])
        .map(|s| CallState::parse(&s))
        .unwrap_or_else(|| CallState::Unknown(String::new()));

    let direction = str_field(obj, &["direction", "callDirection"])
        .map(|d| CallDirection::parse(&d))
        .unwrap_or(CallDirection::Unknown);

    CallEvent {
        call_id,
        state,
        direction,
        raw_source: any_field(obj, &["source", "from"]),
        raw_targets: any_field(obj, &["targets", "to"]),
        raw_callback_uri: str_field(obj, &["callbackUri", "callback_uri", "callbackUrl"]),
        client_state: None,
        received_at,
    }
}

/// First non-empty string among `keys`.
fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// First non-null value among `keys`.
fn any_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
        .cloned()
}

/// Call id from an OData path field (`@odata.id`, `resourceUrl`, `resource`).
fn odata_call_id(obj: &Map<String, Value>) -> Option<String> {
    ["@odata.id", "resourceUrl", "resource"]
        .iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .find_map(call_id_from_path)
}

/// Extract `{id}` from `.../calls/{id}` or `.../calls/{id}/...`.
pub fn call_id_from_path(path: &str) -> Option<String> {
    const MARKER: &str = "calls/";
    path.match_indices(MARKER)
        // The marker must start a segment (skips `recalls/` and the like)
        .filter(|(idx, _)| *idx == 0 || path[..*idx].ends_with('/'))
        .find_map(|(idx, _)| {
            let after = &path[idx + MARKER.len()..];
            let end = after
                .find(|c: char| c == '/' || c == '?' || c == '\'' || c == '"')
                .unwrap_or(after.len());
            let id = after[..end].trim();
            (!id.is_empty()).then(|| id.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
        headers
    }

    fn norm(body: &str) -> Normalized {
        normalize(&headers("application/json"), body.as_bytes(), Utc::now())
    }

    #[test]
    fn test_envelope_matches_direct_payload() {
        let wrapped = norm(r#"{"value":[{"resourceData":{"id":"c1","state":"established"}}]}"#);
        let direct = norm(r#"{"id":"c1","state":"established"}"#);

        assert!(matches!(wrapped, Normalized::Wrapped(_)));
        assert!(matches!(direct, Normalized::Direct(_)));

        let w = wrapped.event().unwrap();
        let d = direct.event().unwrap();
        assert_eq!(w.call_id.as_deref(), Some("c1"));
        assert_eq!(w.call_id, d.call_id);
        assert_eq!(w.state, CallState::Established);
        assert_eq!(w.state, d.state);
        assert_eq!(w.direction, d.direction);
    }

    #[test]
    fn test_envelope_id_from_resource_path() {
        let body = r##"{
            "value": [{
                "changeType": "updated",
                "clientState": "secret",
                "resource": "/app/calls/421f0b00-2e4f-4d3a-9f7b-1a2b3c4d5e6f",
                "resourceData": {
                    "@odata.type": "#microsoft.graph.call",
                    "state": "terminated",
                    "direction": "incoming",
                    "callback_uri": "https://bot.example.com/api/calls"
                }
            }]
        }"##;
        let event = norm(body).into_event().unwrap();
        assert_eq!(
            event.call_id.as_deref(),
            Some("421f0b00-2e4f-4d3a-9f7b-1a2b3c4d5e6f")
        );
        assert_eq!(event.state, CallState::Terminated);
        assert_eq!(event.direction, CallDirection::Incoming);
        assert_eq!(event.client_state.as_deref(), Some("secret"));
        assert_eq!(
            event.raw_callback_uri.as_deref(),
            Some("https://bot.example.com/api/calls")
        );
    }

    #[test]
    fn test_direct_odata_path_without_state() {
        let event = norm(r#"{"@odata.id":"/communications/calls/abc/operations/op1"}"#)
            .into_event()
            .unwrap();
        assert_eq!(event.call_id.as_deref(), Some("abc"));
        assert_eq!(event.state, CallState::Unknown(String::new()));
    }

    #[test]
    fn test_message_activity_is_not_a_call() {
        let result = norm(r#"{"type":"message","id":"a1","text":"hello bot"}"#);
        assert!(matches!(
            result,
            Normalized::NotACall(NotACallReason::Activity)
        ));
    }

    #[test]
    fn test_activity_with_call_value_is_unwrapped() {
        let body = r#"{"type":"event","name":"callUpdate","value":{"callId":"c9","state":"incoming"}}"#;
        let event = norm(body).into_event().unwrap();
        assert_eq!(event.call_id.as_deref(), Some("c9"));
        assert_eq!(event.state, CallState::Incoming);
    }

    #[test]
    fn test_sdp_body_is_acknowledged() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\n";
        let result = normalize(&headers("application/sdp"), sdp.as_bytes(), Utc::now());
        assert!(matches!(result, Normalized::NotACall(NotACallReason::NonJson)));

        // Same content with a wrong content type still is not an error
        let result = normalize(&headers("application/json"), sdp.as_bytes(), Utc::now());
        assert!(matches!(result, Normalized::NotACall(NotACallReason::NonJson)));
    }

    #[test]
    fn test_broken_json_is_unparseable() {
        assert!(matches!(norm(r#"{"id": "c1", "state": "#), Normalized::Unparseable(_)));
        assert!(matches!(norm("   "), Normalized::NotACall(NotACallReason::Empty)));
    }

    #[test]
    fn test_state_without_id_is_acknowledged_only() {
        let event = norm(r#"{"state":"established"}"#).into_event().unwrap();
        assert!(event.call_id.is_none());
        assert_eq!(event.state, CallState::Established);
    }

    #[test]
    fn test_wrong_field_types_do_not_abort() {
        let event = norm(r#"{"id":"c2","state":"incoming","direction":42,"callbackUri":{"x":1}}"#)
            .into_event()
            .unwrap();
        assert_eq!(event.call_id.as_deref(), Some("c2"));
        assert_eq!(event.direction, CallDirection::Unknown);
        assert!(event.raw_callback_uri.is_none());
    }

    #[test]
    fn test_call_id_from_path() {
        assert_eq!(
            call_id_from_path("/communications/calls/abc"),
            Some("abc".to_string())
        );
        assert_eq!(
            call_id_from_path("https://graph.microsoft.com/v1.0/communications/calls/abc?x=1"),
            Some("abc".to_string())
        );
        assert_eq!(call_id_from_path("communications/callRecords/abc"), None);
        assert_eq!(call_id_from_path("/communications/calls/"), None);
    }

    #[test]
    fn test_call_id_from_later_path_segment() {
        assert_eq!(
            call_id_from_path("/x/recalls/calls/abc"),
            Some("abc".to_string())
        );
        assert_eq!(
            call_id_from_path("/communications/calls//calls/def/operations"),
            Some("def".to_string())
        );
        assert_eq!(call_id_from_path("/x/recalls/abc"), None);
    }

    #[test]
    fn test_missing_content_type_is_sniffed() {
        let result = normalize(
            &HeaderMap::new(),
            br#"{"id":"c3","state":"incoming"}"#,
            Utc::now(),
        );
        assert!(matches!(result, Normalized::Direct(_)));
    }
}
