//! Snapshot tests for outbound invocation encoding.
//!
//! The hub binds arguments positionally and by JSON type, so the exact text
//! of every outbound method is pinned here.

use evsync_proto::{
    ConversationId, HandshakeRequest, HubFrame, HubInvocation, RECORD_SEPARATOR, UserId,
};

fn encode(invocation: &HubInvocation) -> String {
    let text = invocation.to_frame(None).encode().unwrap();
    assert!(text.ends_with(RECORD_SEPARATOR));
    text.trim_end_matches(RECORD_SEPARATOR).to_string()
}

#[test]
fn join_and_leave_send_numeric_ids() {
    let id = ConversationId::new(42);

    insta::assert_snapshot!(
        encode(&HubInvocation::JoinConversation(id)),
        @r#"{"type":1,"target":"JoinConversation","arguments":[42]}"#
    );
    insta::assert_snapshot!(
        encode(&HubInvocation::LeaveConversation(id)),
        @r#"{"type":1,"target":"LeaveConversation","arguments":[42]}"#
    );
}

#[test]
fn send_message() {
    let invocation = HubInvocation::SendMessage {
        conversation: ConversationId::new(7),
        content: "Brake pads arrived".to_string(),
    };

    insta::assert_snapshot!(
        encode(&invocation),
        @r#"{"type":1,"target":"SendMessage","arguments":[7,"Brake pads arrived"]}"#
    );
}

#[test]
fn notify_typing_for_user() {
    let invocation = HubInvocation::NotifyTyping {
        conversation: ConversationId::new(7),
        is_typing: false,
        user: Some(UserId::from("advisor-3")),
        guest_session: None,
    };

    insta::assert_snapshot!(
        encode(&invocation),
        @r#"{"type":1,"target":"NotifyTyping","arguments":[7,false,"advisor-3",null]}"#
    );
}

#[test]
fn group_methods() {
    insta::assert_snapshot!(
        encode(&HubInvocation::JoinUserGroup(UserId::from("u-1"))),
        @r#"{"type":1,"target":"JoinUserGroup","arguments":["u-1"]}"#
    );
    insta::assert_snapshot!(
        encode(&HubInvocation::JoinStaffGroup),
        @r#"{"type":1,"target":"JoinStaffGroup","arguments":[]}"#
    );
}

#[test]
fn invocation_with_completion_id() {
    let frame = HubInvocation::JoinConversation(ConversationId::new(1)).to_frame(Some("9".into()));
    let text = frame.encode().unwrap();

    insta::assert_snapshot!(
        text.trim_end_matches(RECORD_SEPARATOR),
        @r#"{"type":1,"invocationId":"9","target":"JoinConversation","arguments":[1]}"#
    );
}

#[test]
fn handshake_and_ping() {
    let handshake = HandshakeRequest::default().encode().unwrap();
    insta::assert_snapshot!(
        handshake.trim_end_matches(RECORD_SEPARATOR),
        @r#"{"protocol":"json","version":1}"#
    );

    let ping = HubFrame::Ping.encode().unwrap();
    insta::assert_snapshot!(ping.trim_end_matches(RECORD_SEPARATOR), @r#"{"type":6}"#);
}
