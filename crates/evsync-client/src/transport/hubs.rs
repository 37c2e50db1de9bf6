//! Typed facades over the two hub actors.

use std::sync::Arc;

use evsync_core::{ConnectionStatus, SubscriptionId};
use evsync_proto::{
    ConversationId, Credential, Message, Notification, NotificationId, ReadMarker, Typist, UserId,
};
use tracing::{debug, warn};

use super::{
    rest::{ConversationStore, HistoryPage, NotificationStore},
    runtime::{HubHandle, StatusChange},
};
use crate::{
    ChatClient, ChatEvent, ChatNotice, ClientError, Environment, NotificationClient,
    NotificationEvent, NotificationNotice,
};

/// Conversation hub: membership, messages, typing and read receipts.
pub struct ChatHub<E: Environment> {
    handle: HubHandle<ChatClient<E>>,
    store: Arc<dyn ConversationStore>,
}

impl<E: Environment> Clone for ChatHub<E> {
    fn clone(&self) -> Self {
        Self { handle: self.handle.clone(), store: Arc::clone(&self.store) }
    }
}

impl<E: Environment> std::fmt::Debug for ChatHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHub").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl<E: Environment> ChatHub<E> {
    /// Wrap a running chat actor.
    pub fn new(handle: HubHandle<ChatClient<E>>, store: Arc<dyn ConversationStore>) -> Self {
        Self { handle, store }
    }

    /// The underlying actor handle.
    pub fn handle(&self) -> &HubHandle<ChatClient<E>> {
        &self.handle
    }

    /// Open a conversation.
    ///
    /// Malformed identifiers are rejected here, before anything reaches the
    /// hub. While not connected the join is remembered and replayed on the
    /// next `Connected`.
    pub async fn join(&self, conversation: &str) -> Result<ConversationId, ClientError> {
        let conversation: ConversationId = conversation.parse()?;
        self.event(ChatEvent::Join(conversation)).await?;
        Ok(conversation)
    }

    /// Close a conversation. Never fails for conversations we are not in.
    pub async fn leave(&self, conversation: ConversationId) -> Result<(), ClientError> {
        self.event(ChatEvent::Leave(conversation)).await.map(drop)
    }

    /// Send a message. Recorded locally as `Sending` right away.
    pub async fn send_message(
        &self,
        conversation: ConversationId,
        content: impl Into<String>,
    ) -> Result<(), ClientError> {
        let content = content.into();
        self.event(ChatEvent::SendMessage { conversation, content }).await.map(drop)
    }

    /// The local user typed.
    pub async fn notify_typing(&self, conversation: ConversationId) -> Result<(), ClientError> {
        self.event(ChatEvent::Typing(conversation)).await.map(drop)
    }

    /// The local user cleared the input.
    pub async fn stop_typing(&self, conversation: ConversationId) -> Result<(), ClientError> {
        self.event(ChatEvent::StopTyping(conversation)).await.map(drop)
    }

    /// Mark `conversation` read and store the marker.
    ///
    /// A failing store is logged; the local state is already updated.
    pub async fn mark_read(&self, conversation: ConversationId) -> Result<(), ClientError> {
        let notices = self.event(ChatEvent::MarkRead(conversation)).await?;
        let marker = notices.into_iter().find_map(|notice| match notice {
            ChatNotice::MarkedRead { marker, .. } => marker,
            _ => None,
        });

        if let Some(marker) = marker
            && let Err(error) = self.store.mark_read(&marker).await
        {
            warn!(%conversation, %error, "failed to store read marker");
        }
        Ok(())
    }

    /// Load one history page and merge it into the conversation.
    ///
    /// Returns the number of messages in the page.
    pub async fn load_history(
        &self,
        conversation: ConversationId,
        page: HistoryPage,
    ) -> Result<usize, ClientError> {
        let messages = self.store.history(conversation, page).await?;
        let count = messages.len();
        self.event(ChatEvent::MergeHistory { conversation, messages }).await?;
        debug!(%conversation, count, "history merged");
        Ok(count)
    }

    /// Use `credential` for every later dial.
    pub async fn renew_credential(&self, credential: Credential) -> Result<(), ClientError> {
        self.handle.renew_credential(credential).await
    }

    /// Leave the user group and disconnect.
    pub async fn dispose(&self) -> Result<(), ClientError> {
        self.handle.dispose().await
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// True once the hub endpoint was found missing.
    pub async fn is_degraded(&self) -> Result<bool, ClientError> {
        self.handle.query(ChatClient::is_degraded).await
    }

    /// Conversations joined, or waiting for the next link to join them, in join order.
    pub async fn conversations(&self) -> Result<Vec<ConversationId>, ClientError> {
        self.handle.query(ChatClient::conversations).await
    }

    /// Messages of `conversation` in display order.
    pub async fn messages(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Message>, ClientError> {
        self.handle.query(move |client| client.messages(conversation).to_vec()).await
    }

    /// Unread count of `conversation`.
    pub async fn unread(&self, conversation: ConversationId) -> Result<u32, ClientError> {
        self.handle.query(move |client| client.unread(conversation)).await
    }

    /// Unread count across all conversations.
    pub async fn total_unread(&self) -> Result<u32, ClientError> {
        self.handle.query(ChatClient::total_unread).await
    }

    /// Who is typing in `conversation`.
    pub async fn typists(&self, conversation: ConversationId) -> Result<Vec<Typist>, ClientError> {
        self.handle.query(move |client| client.typists(conversation)).await
    }

    /// Known participants of `conversation`.
    pub async fn participants(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<UserId>, ClientError> {
        self.handle.query(move |client| client.participants(conversation)).await
    }

    /// Register a status observer.
    pub fn on_status_changed(
        &self,
        handler: impl FnMut(&StatusChange) + Send + 'static,
    ) -> SubscriptionId {
        self.handle.on_status_changed(handler)
    }

    /// Register an observer for every conversation notice.
    pub fn on_notice(&self, handler: impl FnMut(&ChatNotice) + Send + 'static) -> SubscriptionId {
        self.handle.on_notice(handler)
    }

    /// Register an observer for stored inbound messages.
    pub fn on_message(&self, mut handler: impl FnMut(&Message) + Send + 'static) -> SubscriptionId {
        self.handle.on_notice(move |notice| {
            if let ChatNotice::MessageReceived { message, .. } = notice {
                handler(message);
            }
        })
    }

    /// Register an observer for typing changes.
    pub fn on_typing_changed(
        &self,
        mut handler: impl FnMut(ConversationId, &[Typist]) + Send + 'static,
    ) -> SubscriptionId {
        self.handle.on_notice(move |notice| {
            if let ChatNotice::TypingChanged { conversation, typists } = notice {
                handler(*conversation, typists);
            }
        })
    }

    /// Register an observer for advancing read markers.
    pub fn on_read_receipt(
        &self,
        mut handler: impl FnMut(&ReadMarker) + Send + 'static,
    ) -> SubscriptionId {
        self.handle.on_notice(move |notice| {
            if let ChatNotice::ReadReceipt(marker) = notice {
                handler(marker);
            }
        })
    }

    /// Remove an observer.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handle.unsubscribe(id)
    }

    async fn event(&self, event: ChatEvent<E::Instant>) -> Result<Vec<ChatNotice>, ClientError> {
        let (outcome, notices) = self
            .handle
            .apply(move |client| match client.handle(event) {
                Ok(actions) => (actions, Ok(())),
                Err(error) => (Vec::new(), Err(error)),
            })
            .await?;
        outcome.map(|()| notices)
    }
}

/// Notification hub: inbox and unread badge.
pub struct NotificationHub<E: Environment> {
    handle: HubHandle<NotificationClient<E>>,
    store: Arc<dyn NotificationStore>,
}

impl<E: Environment> Clone for NotificationHub<E> {
    fn clone(&self) -> Self {
        Self { handle: self.handle.clone(), store: Arc::clone(&self.store) }
    }
}

impl<E: Environment> std::fmt::Debug for NotificationHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl<E: Environment> NotificationHub<E> {
    /// Wrap a running notification actor.
    pub fn new(
        handle: HubHandle<NotificationClient<E>>,
        store: Arc<dyn NotificationStore>,
    ) -> Self {
        Self { handle, store }
    }

    /// The underlying actor handle.
    pub fn handle(&self) -> &HubHandle<NotificationClient<E>> {
        &self.handle
    }

    /// Mark one notification read, locally and in the store.
    pub async fn mark_read(&self, id: NotificationId) -> Result<(), ClientError> {
        let notices = self.event(NotificationEvent::MarkRead(id)).await?;
        self.store_read(notices).await;
        Ok(())
    }

    /// Mark every notification read.
    pub async fn mark_all_read(&self) -> Result<(), ClientError> {
        let notices = self.event(NotificationEvent::MarkAllRead).await?;
        self.store_read(notices).await;
        Ok(())
    }

    /// Reload the notification list from the store and reconcile.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let listing = self.store.list().await?;
        debug!(count = listing.len(), "notifications listed");
        self.event(NotificationEvent::Reconcile(listing)).await.map(drop)
    }

    /// Use `credential` for every later dial.
    pub async fn renew_credential(&self, credential: Credential) -> Result<(), ClientError> {
        self.handle.renew_credential(credential).await
    }

    /// Disconnect.
    pub async fn dispose(&self) -> Result<(), ClientError> {
        self.handle.dispose().await
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// True once the hub endpoint was found missing.
    pub async fn is_degraded(&self) -> Result<bool, ClientError> {
        self.handle.query(NotificationClient::is_degraded).await
    }

    /// Number of `NEW` notifications.
    pub async fn unread_count(&self) -> Result<usize, ClientError> {
        self.handle.query(NotificationClient::unread_count).await
    }

    /// All notifications in arrival order.
    pub async fn notifications(&self) -> Result<Vec<Notification>, ClientError> {
        self.handle.query(|client| client.notifications().to_vec()).await
    }

    /// Register a status observer.
    pub fn on_status_changed(
        &self,
        handler: impl FnMut(&StatusChange) + Send + 'static,
    ) -> SubscriptionId {
        self.handle.on_status_changed(handler)
    }

    /// Register an observer for new notifications.
    pub fn on_notification(
        &self,
        mut handler: impl FnMut(&Notification) + Send + 'static,
    ) -> SubscriptionId {
        self.handle.on_notice(move |notice| {
            if let NotificationNotice::Received(notification) = notice {
                handler(notification);
            }
        })
    }

    /// Register an observer for the unread badge.
    pub fn on_unread_count_change(
        &self,
        mut handler: impl FnMut(usize) + Send + 'static,
    ) -> SubscriptionId {
        self.handle.on_notice(move |notice| {
            if let NotificationNotice::UnreadChanged(count) = notice {
                handler(*count);
            }
        })
    }

    /// Remove an observer.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handle.unsubscribe(id)
    }

    async fn event(
        &self,
        event: NotificationEvent<E::Instant>,
    ) -> Result<Vec<NotificationNotice>, ClientError> {
        let ((), notices) = self.handle.apply(move |client| (client.handle(event), ())).await?;
        Ok(notices)
    }

    async fn store_read(&self, notices: Vec<NotificationNotice>) {
        for notice in notices {
            if let NotificationNotice::MarkedRead(ids) = notice
                && let Err(error) = self.store.mark_read(&ids).await
            {
                warn!(count = ids.len(), %error, "failed to store notification read state");
            }
        }
    }
}
