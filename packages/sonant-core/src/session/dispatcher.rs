//! Normalization and fan-out of model events.
//!
//! Every decoded model event passes through [`normalize`] and then
//! [`dispatch`], which delivers it in a fixed order: broadcast subject
//! first, then the type-specific handler, then the `any` handler. A
//! panicking handler is caught, logged and swallowed so the rest of the
//! chain still runs.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;

use super::events::{EventType, SessionEvent};
use super::Session;

/// Normalizes a raw event payload in place.
///
/// - Unifies the content identifier: whichever of `contentId` /
///   `contentName` is present is mirrored into both fields.
/// - If `additionalModelFields` is a JSON string and no parsed form is
///   attached yet, parses it into `parsedAdditionalModelFields`. A parse
///   failure leaves the string untouched.
///
/// Non-object payloads pass through unchanged.
pub fn normalize(payload: &mut Value) {
    let Some(object) = payload.as_object_mut() else {
        return;
    };

    let id = object
        .get("contentId")
        .or_else(|| object.get("contentName"))
        .cloned();
    if let Some(id) = id {
        object.insert("contentId".to_string(), id.clone());
        object.insert("contentName".to_string(), id);
    }

    if !object.contains_key("parsedAdditionalModelFields") {
        let parsed = object
            .get("additionalModelFields")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
        if let Some(parsed) = parsed {
            object.insert("parsedAdditionalModelFields".to_string(), parsed);
        }
    }
}

/// Delivers one event to the session's observers in arrival order.
///
/// Order per event: (a) the broadcast subject, (b) the type-specific
/// handler, (c) the `any` handler. Unknown (`Custom`) events skip (b) by
/// construction since no typed handler can exist for them without the
/// caller having registered the exact name.
pub fn dispatch(session: &Session, event_type: &EventType, data: &Value) {
    session.publish(SessionEvent {
        event_type: event_type.clone(),
        data: data.clone(),
    });

    session.with_handler(event_type, |handler| {
        if let Some(handler) = handler {
            run_guarded(session.id(), event_type, handler, data);
        }
    });

    session.with_any_handler(|handler| {
        if let Some(handler) = handler {
            run_guarded(session.id(), event_type, handler, data);
        }
    });
}

fn run_guarded(
    session_id: &str,
    event_type: &EventType,
    handler: &super::EventHandler,
    data: &Value,
) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(data))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        log::error!(
            "[Dispatcher] Handler panicked: session={}, event={}, panic={}",
            session_id,
            event_type.name(),
            reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_session() -> Arc<Session> {
        Session::new("CAtest", InferenceConfig::default(), 200)
    }

    #[test]
    fn normalize_unifies_content_identifiers() {
        let mut payload = json!({ "contentName": "abc" });
        normalize(&mut payload);
        assert_eq!(payload["contentId"], "abc");
        assert_eq!(payload["contentName"], "abc");

        let mut payload = json!({ "contentId": "xyz" });
        normalize(&mut payload);
        assert_eq!(payload["contentName"], "xyz");
    }

    #[test]
    fn normalize_prefers_content_id() {
        let mut payload = json!({ "contentId": "id", "contentName": "name" });
        normalize(&mut payload);
        assert_eq!(payload["contentId"], "id");
        assert_eq!(payload["contentName"], "id");
    }

    #[test]
    fn normalize_parses_additional_model_fields() {
        let mut payload = json!({ "additionalModelFields": "{\"k\":1}" });
        normalize(&mut payload);
        assert_eq!(payload["parsedAdditionalModelFields"]["k"], 1);
        assert_eq!(payload["additionalModelFields"], "{\"k\":1}");
    }

    #[test]
    fn normalize_leaves_unparseable_fields_untouched() {
        let mut payload = json!({ "additionalModelFields": "not json" });
        normalize(&mut payload);
        assert!(payload.get("parsedAdditionalModelFields").is_none());
        assert_eq!(payload["additionalModelFields"], "not json");
    }

    #[test]
    fn normalize_respects_existing_parsed_fields() {
        let mut payload = json!({
            "additionalModelFields": "{\"k\":1}",
            "parsedAdditionalModelFields": {"k": 2},
        });
        normalize(&mut payload);
        assert_eq!(payload["parsedAdditionalModelFields"]["k"], 2);
    }

    #[test]
    fn normalize_passes_non_objects_through() {
        let mut payload = json!("just a string");
        normalize(&mut payload);
        assert_eq!(payload, json!("just a string"));
    }

    #[test]
    fn dispatch_reaches_subject_then_typed_then_any() {
        let session = test_session();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let typed_order = Arc::clone(&order);
        session.register_handler(EventType::TextOutput, move |_| {
            typed_order.lock().push("typed");
        });
        let any_order = Arc::clone(&order);
        session.register_any_handler(move |_| {
            any_order.lock().push("any");
        });

        let mut rx = session.subscribe();
        dispatch(&session, &EventType::TextOutput, &json!({"content": "hi"}));

        // The subject received it (publish happens before handlers run).
        let event = rx.try_recv().expect("subject delivery");
        assert_eq!(event.event_type, EventType::TextOutput);
        assert_eq!(*order.lock(), vec!["typed", "any"]);
    }

    #[test]
    fn dispatch_without_typed_handler_still_hits_any() {
        let session = test_session();
        let count = Arc::new(AtomicUsize::new(0));
        let any_count = Arc::clone(&count);
        session.register_any_handler(move |_| {
            any_count.fetch_add(1, Ordering::SeqCst);
        });

        dispatch(
            &session,
            &EventType::Custom("toolUse".to_string()),
            &json!({}),
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_break_dispatch() {
        let session = test_session();
        let count = Arc::new(AtomicUsize::new(0));

        session.register_handler(EventType::TextOutput, |_| {
            panic!("handler exploded");
        });
        let any_count = Arc::clone(&count);
        session.register_any_handler(move |_| {
            any_count.fetch_add(1, Ordering::SeqCst);
        });

        dispatch(&session, &EventType::TextOutput, &json!({}));
        dispatch(&session, &EventType::TextOutput, &json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 2, "any handler keeps running");
    }

    #[test]
    fn dispatch_order_is_preserved_across_events() {
        let session = test_session();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        session.register_any_handler(move |data| {
            handler_seen.lock().push(data["n"].as_u64().expect("n"));
        });

        for n in 0..10u64 {
            dispatch(&session, &EventType::TextOutput, &json!({ "n": n }));
        }
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn handler_replacement_keeps_at_most_one() {
        let session = test_session();
        let count = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&count);
        session.register_handler(EventType::TextOutput, move |_| {
            first.fetch_add(10, Ordering::SeqCst);
        });
        let second = Arc::clone(&count);
        session.register_handler(EventType::TextOutput, move |_| {
            second.fetch_add(1, Ordering::SeqCst);
        });

        dispatch(&session, &EventType::TextOutput, &json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1, "replacement handler only");
    }
}
