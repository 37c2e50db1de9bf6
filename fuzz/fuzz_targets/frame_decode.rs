//! Fuzz target for HubFrame::decode_batch
//!
//! Feeds arbitrary transport messages through the frame decoder to find:
//! - Parser panics on malformed JSON or unexpected frame types
//! - Batches where one bad frame hides its neighbours
//! - Frames that decode but do not survive re-encoding
//!
//! The decoder should NEVER panic. Invalid frames return an error.

#![no_main]

use evsync_proto::{HubFrame, InboundEvent, RECORD_SEPARATOR};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let segments = text.split(RECORD_SEPARATOR).filter(|s| !s.trim().is_empty()).count();
    let frames = HubFrame::decode_batch(text);
    assert_eq!(frames.len(), segments, "every non-empty segment yields one result");

    for frame in frames.into_iter().flatten() {
        let encoded = frame.encode().expect("decoded frame must encode");
        assert!(encoded.ends_with(RECORD_SEPARATOR));

        let body = encoded.trim_end_matches(RECORD_SEPARATOR);
        let decoded = HubFrame::decode(body).expect("encoded frame must decode");
        assert_eq!(decoded, frame);

        if let HubFrame::Invocation { target, arguments, .. } = &frame {
            // Unknown targets and malformed payloads are errors, never panics
            let _ = InboundEvent::from_invocation(target, arguments);
        }
    }
});
