//! Event-stream formatting for streaming mocks.

use serde_json::{json, Value};

/// Content type of streamed mock bodies.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Terminal sentinel closing every stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const TEXT_PART_ID: &str = "text-0";

/// Format `value` as a complete event-stream body.
///
/// Text is delivered one character per `text-delta`, wrapped in the
/// `start`/`text-start`/`text-end`/`finish` frames. Any other value is sent
/// as one data event.
pub fn format_event_stream(value: &Value) -> String {
    let mut out = String::new();

    match value {
        Value::String(text) => {
            push_event(&mut out, &json!({"type": "start"}));
            push_event(&mut out, &json!({"type": "text-start", "id": TEXT_PART_ID}));
            for ch in text.chars() {
                push_event(
                    &mut out,
                    &json!({"type": "text-delta", "id": TEXT_PART_ID, "delta": ch.to_string()}),
                );
            }
            push_event(&mut out, &json!({"type": "text-end", "id": TEXT_PART_ID}));
            push_event(&mut out, &json!({"type": "finish"}));
        }
        other => push_event(&mut out, other),
    }

    push_frame(&mut out, DONE_SENTINEL);
    out
}

/// Data payloads of a formatted stream, in order.
pub fn parse_event_stream(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

fn push_event(out: &mut String, event: &Value) {
    push_frame(out, &event.to_string());
}

fn push_frame(out: &mut String, data: &str) {
    out.push_str("data: ");
    out.push_str(data);
    out.push_str("\n\n");
}
