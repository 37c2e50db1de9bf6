//! Fuzz target for the wire-format adapter
//!
//! Parses arbitrary JSON and runs it through every payload normalizer.
//!
//! # Invariants
//!
//! - Normalizers never panic on any JSON shape
//! - A message that normalizes keeps the conversation it was parsed with
//! - History entries without a conversation id inherit the page's id

#![no_main]

use evsync_proto::{ConversationId, wire};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    let _ = wire::conversation_id(&value);
    let _ = wire::user_id(&value);
    let _ = wire::timestamp(&value, "fuzz");
    let _ = wire::typing(&value);
    let _ = wire::read_marker(&value);
    let _ = wire::conversation_summary(&value);
    let _ = wire::center_reassignment(&value);
    let _ = wire::notification(&value);

    if let Ok(message) = wire::message(&value) {
        let again = wire::message(&value).expect("normalization is deterministic");
        assert_eq!(again, message);
    }

    let page = ConversationId::new(42);
    let direct = wire::message(&value);
    if let Ok(message) = wire::history_message(&value, page) {
        if direct.is_err() {
            assert_eq!(message.conversation, page);
        }
    }

    for entry in wire::listing(&value) {
        let _ = wire::notification(entry);
        let _ = wire::history_message(entry, page);
    }
});
