//! Conversation hub client.
//!
//! Combines membership, typing, message dispatch and read receipts behind one
//! event/action interface. Everything the hub must hear about goes through
//! [`HubChannel`], which sends on a live link and defers otherwise.
//!
//! # Reconnect order
//!
//! On every `Connected`:
//! 1. Join every member conversation not joined on this link, in join
//!    order; this covers joins made while disconnected
//! 2. `JoinUserGroup` for authenticated sessions
//! 3. Replay deferred operations in FIFO order
//!
//! # Errors
//!
//! Invocation failures (error completion or link gone) are logged and the
//! operation is retried on the next `Connected`. Malformed inbound payloads
//! are dropped with a warning.

use chrono::{DateTime, Utc};
use evsync_core::{
    ConnectionStatus, DispatchOutcome, Environment, Identity, Membership,
    MessageDispatcher, ReadReceiptTracker, ReceiptOutcome, TypingAction, TypingConfig,
    TypingCoordinator,
};
use evsync_proto::{ConversationId, HubInvocation, InboundEvent, Message, Typist, UserId};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::ClientError,
    event::{ChatEvent, ChatNotice},
    hub::{Edge, FrameOutcome, HubAction, HubChannel, HubClient, HubConfig, Lifecycle},
};

/// Actions produced by the chat client.
pub type ChatAction = HubAction<ChatNotice>;

/// Client for the conversation hub.
#[derive(Debug)]
pub struct ChatClient<E>
where
    E: Environment,
{
    channel: HubChannel<E>,
    identity: Identity,
    membership: Membership,
    typing: TypingCoordinator<E::Instant>,
    dispatcher: MessageDispatcher,
    receipts: ReadReceiptTracker,
}

impl<E> ChatClient<E>
where
    E: Environment,
{
    /// Create a disconnected client.
    pub fn new(env: E, identity: Identity, hub: HubConfig, typing: TypingConfig) -> Self {
        Self {
            channel: HubChannel::new(env, Self::HUB, hub),
            membership: Membership::new(),
            typing: TypingCoordinator::new(typing, identity.clone()),
            dispatcher: MessageDispatcher::new(identity.clone()),
            receipts: ReadReceiptTracker::new(identity.clone()),
            identity,
        }
    }

    /// Process an event and return resulting actions.
    ///
    /// # Errors
    ///
    /// - `EmptyMessage` if a send carries no text
    pub fn handle(&mut self, event: ChatEvent<E::Instant>) -> Result<Vec<ChatAction>, ClientError> {
        let mut out = Vec::new();
        match event {
            ChatEvent::Lifecycle(request) => self.handle_lifecycle(request, &mut out),
            ChatEvent::Tick { now } => self.handle_tick(now, &mut out),
            ChatEvent::Join(conversation) => self.handle_join(conversation, &mut out),
            ChatEvent::Leave(conversation) => self.handle_leave(conversation, &mut out),
            ChatEvent::SendMessage { conversation, content } => {
                self.handle_send_message(conversation, content, &mut out)?;
            },
            ChatEvent::Typing(conversation) => {
                let now = self.channel.env().now();
                if let Some(signal) = self.typing.notify_typing(conversation, now) {
                    self.transmit(signal, &mut out);
                }
            },
            ChatEvent::StopTyping(conversation) => {
                if let Some(signal) = self.typing.stop_typing(conversation) {
                    self.transmit(signal, &mut out);
                }
            },
            ChatEvent::MarkRead(conversation) => self.handle_mark_read(conversation, &mut out),
            ChatEvent::MergeHistory { conversation, messages } => {
                self.dispatcher.merge_history(conversation, messages);
                out.push(HubAction::Notice(ChatNotice::HistoryMerged { conversation }));
                self.reapply_receipts(conversation, &mut out);
            },
        }
        Ok(out)
    }

    /// Session identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// True once the hub endpoint was found missing.
    pub fn is_degraded(&self) -> bool {
        self.channel.connection().is_degraded()
    }

    /// Operations waiting for the next `Connected`.
    pub fn deferred(&self) -> usize {
        self.channel.deferred_len()
    }

    /// Conversations the session is a member of, in join order.
    pub fn conversations(&self) -> Vec<ConversationId> {
        self.membership.conversations().collect()
    }

    /// True if `conversation` is joined on the current link.
    pub fn is_joined(&self, conversation: ConversationId) -> bool {
        self.membership.is_joined(conversation)
    }

    /// Messages of `conversation` in display order.
    pub fn messages(&self, conversation: ConversationId) -> &[Message] {
        self.dispatcher.messages(conversation)
    }

    /// Unread count of `conversation`.
    pub fn unread(&self, conversation: ConversationId) -> u32 {
        self.dispatcher.unread(conversation)
    }

    /// Unread count across all conversations.
    pub fn total_unread(&self) -> u32 {
        self.dispatcher.total_unread()
    }

    /// Who is typing in `conversation` right now.
    pub fn typists(&self, conversation: ConversationId) -> Vec<Typist> {
        self.typing.active(conversation, self.channel.env().now())
    }

    /// Known participants of `conversation`.
    pub fn participants(&self, conversation: ConversationId) -> Vec<UserId> {
        self.membership.participants(conversation)
    }

    /// Last read instant of `participant` in `conversation`.
    pub fn last_read_at(
        &self,
        conversation: ConversationId,
        participant: &UserId,
    ) -> Option<DateTime<Utc>> {
        self.receipts.last_read_at(conversation, participant)
    }

    fn handle_lifecycle(&mut self, request: Lifecycle, out: &mut Vec<ChatAction>) {
        let edge = match request {
            Lifecycle::Connect(credential) => self.channel.connect(credential, out),
            Lifecycle::RenewCredential(credential) => {
                self.channel.renew_credential(credential);
                None
            },
            Lifecycle::Disconnect => self.channel.disconnect(out),
            Lifecycle::Dispose => {
                if let Some(user) = self.identity.user.clone()
                    && self.channel.is_connected()
                {
                    self.channel.invoke(HubInvocation::LeaveUserGroup(user), out);
                }
                let edge = self.channel.disconnect(out);
                self.channel.reset();
                edge.map(|_| Edge::Down(Vec::new()))
            },
            Lifecycle::Link(event) => match self.channel.link(event, out) {
                FrameOutcome::Handled => None,
                FrameOutcome::Edge(edge) => Some(edge),
                FrameOutcome::Invocation { target, arguments } => {
                    self.handle_invocation(&target, &arguments, out);
                    None
                },
                FrameOutcome::Failed { invocation, reason } => {
                    self.invocation_failed(invocation, &reason);
                    None
                },
            },
        };

        match edge {
            Some(Edge::Up) => self.on_connected(out),
            Some(Edge::Down(failed)) => self.on_connection_lost(failed),
            None => {},
        }
    }

    fn handle_tick(&mut self, now: E::Instant, out: &mut Vec<ChatAction>) {
        match self.channel.tick(now, out) {
            Some(Edge::Up) => self.on_connected(out),
            Some(Edge::Down(failed)) => self.on_connection_lost(failed),
            None => {},
        }

        for action in self.typing.tick(now) {
            match action {
                TypingAction::Transmit(signal) => self.transmit(signal, out),
                TypingAction::Changed(conversation) => {
                    let typists = self.typing.active(conversation, now);
                    let notice = ChatNotice::TypingChanged { conversation, typists };
                    out.push(HubAction::Notice(notice));
                },
            }
        }
    }

    fn handle_join(&mut self, conversation: ConversationId, out: &mut Vec<ChatAction>) {
        if self.channel.is_connected() {
            if let Some(join) = self.membership.join(conversation) {
                self.channel.invoke(join, out);
            }
        } else if self.membership.remember(conversation) {
            debug!(%conversation, "joining once connected");
        }
    }

    fn handle_leave(&mut self, conversation: ConversationId, out: &mut Vec<ChatAction>) {
        if let Some(signal) = self.typing.stop_typing(conversation) {
            self.transmit(signal, out);
        }
        self.typing.clear(conversation);

        if self.channel.is_connected() {
            if let Some(leave) = self.membership.leave(conversation) {
                self.channel.invoke(leave, out);
            }
        } else {
            // The hub dropped our groups with the link
            self.membership.forget(conversation);
        }
    }

    fn handle_send_message(
        &mut self,
        conversation: ConversationId,
        content: String,
        out: &mut Vec<ChatAction>,
    ) -> Result<(), ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::EmptyMessage { conversation });
        }

        if let Some(signal) = self.typing.stop_typing(conversation) {
            self.transmit(signal, out);
        }

        let now = self.channel.env().wall_clock();
        let message = self.dispatcher.record_local(conversation, content.clone(), now);
        out.push(HubAction::Notice(ChatNotice::MessageQueued(message)));

        self.transmit(HubInvocation::SendMessage { conversation, content }, out);
        Ok(())
    }

    fn handle_mark_read(&mut self, conversation: ConversationId, out: &mut Vec<ChatAction>) {
        let had_unread = self.dispatcher.unread(conversation) > 0;
        let now = self.channel.env().wall_clock();
        let marker = self.receipts.mark_read(conversation, now, &mut self.dispatcher);

        if had_unread {
            out.push(HubAction::Notice(ChatNotice::UnreadChanged {
                conversation,
                unread: 0,
                total: self.dispatcher.total_unread(),
            }));
        }
        out.push(HubAction::Notice(ChatNotice::MarkedRead { conversation, marker }));
    }

    fn handle_invocation(&mut self, target: &str, arguments: &[Value], out: &mut Vec<ChatAction>) {
        match InboundEvent::from_invocation(target, arguments) {
            Ok(event) => self.handle_inbound(event, out),
            Err(error) => warn!(hub = Self::HUB, target, %error, "dropping malformed payload"),
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent, out: &mut Vec<ChatAction>) {
        match event {
            InboundEvent::ReceiveMessage(message) => self.handle_message(message, out),
            InboundEvent::UserTyping(signal) => {
                let now = self.channel.env().now();
                if self.typing.on_signal(&signal, now) {
                    let conversation = signal.conversation;
                    let typists = self.typing.active(conversation, now);
                    let notice = ChatNotice::TypingChanged { conversation, typists };
                    out.push(HubAction::Notice(notice));
                }
            },
            InboundEvent::UserJoined { user, conversation } => {
                if self.membership.participant_joined(conversation, user) {
                    self.participants_changed(conversation, out);
                }
            },
            InboundEvent::UserLeft { user, conversation } => {
                if self.membership.participant_left(conversation, &user) {
                    self.participants_changed(conversation, out);
                }
            },
            InboundEvent::MessageRead(marker) => {
                match self.receipts.on_read_marker(&marker, &mut self.dispatcher) {
                    ReceiptOutcome::Stale => {
                        let conversation = marker.conversation;
                        debug!(%conversation, reader = %marker.reader, "stale read marker");
                    },
                    ReceiptOutcome::Advanced { promoted } => {
                        let conversation = marker.conversation;
                        out.push(HubAction::Notice(ChatNotice::ReadReceipt(marker)));
                        if !promoted.is_empty() {
                            out.push(HubAction::Notice(ChatNotice::MessagesRead {
                                conversation,
                                messages: promoted,
                            }));
                        }
                    },
                }
            },
            InboundEvent::NewConversation(summary) => {
                self.membership.conversation_created(&summary);
                out.push(HubAction::Notice(ChatNotice::ConversationCreated(summary)));
            },
            InboundEvent::CenterReassigned(reassignment) => {
                out.push(HubAction::Notice(ChatNotice::CenterReassigned(reassignment)));
            },
            InboundEvent::ReceiveNotification(notification) => {
                let id = &notification.id;
                warn!(hub = Self::HUB, %id, "notification on conversation hub, dropping");
            },
        }
    }

    fn handle_message(&mut self, message: Message, out: &mut Vec<ChatAction>) {
        match self.dispatcher.on_message(message) {
            DispatchOutcome::Appended { message, from_peer } => {
                let conversation = message.conversation;
                out.push(HubAction::Notice(ChatNotice::MessageReceived { message, from_peer }));
                if from_peer {
                    out.push(HubAction::Notice(ChatNotice::UnreadChanged {
                        conversation,
                        unread: self.dispatcher.unread(conversation),
                        total: self.dispatcher.total_unread(),
                    }));
                } else {
                    self.reapply_receipts(conversation, out);
                }
            },
            DispatchOutcome::Acknowledged { local, message } => {
                let conversation = message.conversation;
                out.push(HubAction::Notice(ChatNotice::MessageAcknowledged { local, message }));
                self.reapply_receipts(conversation, out);
            },
            DispatchOutcome::Duplicate => debug!("duplicate message dropped"),
        }
    }

    /// Own messages that arrived after a peer's marker are read already.
    fn reapply_receipts(&mut self, conversation: ConversationId, out: &mut Vec<ChatAction>) {
        let messages = self.receipts.reapply(conversation, &mut self.dispatcher);
        if !messages.is_empty() {
            out.push(HubAction::Notice(ChatNotice::MessagesRead { conversation, messages }));
        }
    }

    fn participants_changed(&self, conversation: ConversationId, out: &mut Vec<ChatAction>) {
        let participants = self.membership.participants(conversation);
        out.push(HubAction::Notice(ChatNotice::ParticipantsChanged { conversation, participants }));
    }

    /// Send on a live link, defer otherwise.
    fn transmit(&mut self, invocation: HubInvocation, out: &mut Vec<ChatAction>) {
        if self.channel.is_connected() {
            self.channel.invoke(invocation, out);
        } else {
            self.channel.defer(invocation);
        }
    }

    fn on_connected(&mut self, out: &mut Vec<ChatAction>) {
        for join in self.membership.on_connected() {
            self.channel.invoke(join, out);
        }

        if let Some(user) = self.identity.user.clone() {
            self.channel.invoke(HubInvocation::JoinUserGroup(user), out);
        }

        for invocation in self.channel.drain_deferred() {
            self.channel.invoke(invocation, out);
        }
    }

    fn on_connection_lost(&mut self, failed: Vec<HubInvocation>) {
        self.membership.connection_lost();
        for invocation in failed {
            self.invocation_failed(invocation, "link lost");
        }
    }

    fn invocation_failed(&mut self, invocation: HubInvocation, reason: &str) {
        warn!(hub = Self::HUB, target = invocation.target(), reason, "invocation failed");

        match invocation {
            HubInvocation::JoinConversation(conversation) => {
                self.membership.join_failed(conversation);
            },
            // Group joins are reissued on every connect; the hub drops
            // leaves and typing with the link anyway
            HubInvocation::JoinUserGroup(_)
            | HubInvocation::LeaveUserGroup(_)
            | HubInvocation::JoinStaffGroup
            | HubInvocation::LeaveConversation(_)
            | HubInvocation::NotifyTyping { .. } => {},
            other @ HubInvocation::SendMessage { .. } => {
                self.channel.defer(other);
            },
        }
    }
}

impl<E> HubClient for ChatClient<E>
where
    E: Environment,
{
    type Env = E;
    type Notice = ChatNotice;

    const HUB: &'static str = "chat";

    fn lifecycle(&mut self, request: Lifecycle) -> Vec<ChatAction> {
        let mut out = Vec::new();
        self.handle_lifecycle(request, &mut out);
        out
    }

    fn tick(&mut self, now: E::Instant) -> Vec<ChatAction> {
        let mut out = Vec::new();
        self.handle_tick(now, &mut out);
        out
    }

    fn next_deadline(&self) -> Option<E::Instant> {
        match (self.channel.next_deadline(), self.typing.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }
}
