//! Property-based tests for inbound decoding.
//!
//! Inbound text comes straight off the network. Decoding must never panic,
//! and a well-formed payload must resolve the same way regardless of which
//! field-name convention the backend used.

use evsync_proto::{
    ConversationId, HubFrame, InboundEvent, MessageStatus, PayloadError, RECORD_SEPARATOR,
};
use proptest::prelude::*;
use serde_json::{Value, json};

const TARGETS: &[&str] = &[
    "ReceiveMessage",
    "UserTyping",
    "UserJoined",
    "UserLeft",
    "MessageRead",
    "NewConversation",
    "CenterReassigned",
    "ReceiveNotification",
];

/// Strategy for arbitrary JSON values, shallow enough to stay fast.
fn arbitrary_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 :.-]{0,24}".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(
                prop_oneof![
                    Just("id".to_string()),
                    Just("conversationId".to_string()),
                    Just("ConversationId".to_string()),
                    Just("userId".to_string()),
                    Just("sentAt".to_string()),
                    Just("isTyping".to_string()),
                    Just("status".to_string()),
                    "[a-zA-Z]{1,8}",
                ],
                inner,
                0..6,
            )
            .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

#[test]
fn prop_frame_decode_never_panics() {
    proptest!(|(text in ".{0,256}")| {
        // PROPERTY: arbitrary text yields Ok or Err, never a panic
        let _ = HubFrame::decode_batch(&text);
    });
}

#[test]
fn prop_inbound_event_never_panics() {
    proptest!(|(
        target in prop::sample::select(TARGETS),
        arguments in prop::collection::vec(arbitrary_json(), 0..3),
    )| {
        match InboundEvent::from_invocation(target, &arguments) {
            // PROPERTY: a decoded event reports the method it came from
            Ok(event) => prop_assert_eq!(event.target(), target),
            Err(PayloadError::UnknownTarget(_)) => {
                prop_assert!(false, "known target reported unknown");
            },
            Err(_) => {},
        }
    });
}

#[test]
fn prop_message_casing_is_irrelevant() {
    proptest!(|(
        id in 1u64..1_000_000,
        conversation in 1u64..1_000_000,
        sender in "[a-z]{1,8}-[0-9]{1,4}",
        content in "[ -~]{0,64}",
        millis in 0i64..4_000_000_000_000,
        numeric_ids in any::<bool>(),
    )| {
        let (id_value, conversation_value) = if numeric_ids {
            (json!(id), json!(conversation))
        } else {
            (json!(id.to_string()), json!(conversation.to_string()))
        };

        let camel = json!({
            "messageId": id_value,
            "conversationId": conversation_value,
            "senderId": sender,
            "content": content,
            "timestamp": millis,
        });
        let pascal = json!({
            "Id": id,
            "ConversationId": conversation,
            "SenderId": sender,
            "Content": content,
            "CreatedAt": millis,
        });

        let a = InboundEvent::from_invocation("ReceiveMessage", &[camel]);
        let b = InboundEvent::from_invocation("ReceiveMessage", &[pascal]);

        // PROPERTY: both spellings normalize to the same canonical message
        prop_assert_eq!(&a, &b);

        let Ok(InboundEvent::ReceiveMessage(message)) = a else {
            return Err(TestCaseError::fail("message should decode"));
        };
        prop_assert_eq!(message.conversation, ConversationId::new(conversation));
        prop_assert_eq!(message.status, MessageStatus::Delivered);
    });
}

#[test]
fn batch_with_handshake_tail_decodes() {
    let joined = r#"{"type":1,"target":"UserJoined","arguments":["u-1",5]}"#;
    let text = format!("{joined}{RECORD_SEPARATOR}{{\"type\":6}}{RECORD_SEPARATOR}");
    let frames: Vec<_> =
        HubFrame::decode_batch(&text).into_iter().collect::<Result<_, _>>().unwrap();

    assert_eq!(frames.len(), 2);
    let HubFrame::Invocation { target, arguments, .. } = &frames[0] else {
        panic!("expected invocation");
    };
    let event = InboundEvent::from_invocation(target, arguments).unwrap();
    assert!(matches!(
        event,
        InboundEvent::UserJoined { conversation, .. } if conversation.get() == 5
    ));
}
