//! Simulated sessions against in-memory hubs.
//!
//! `SimWorld` runs the real Sans-IO clients, the same ones the websocket
//! runtime drives in production, against two [`SimHub`]s. It plays the
//! runtime's role: executes `Dial`, `Send` and `CloseLink` actions, routes
//! hub deliveries back as [`LinkEvent`]s and fires ticks as virtual time
//! advances. Nothing is delivered until [`SimWorld::deliver_pending`] runs,
//! so tests control interleavings explicitly.

use std::{
    collections::{BTreeSet, VecDeque},
    time::Duration,
};

use evsync_client::{
    ChatAction, ChatClient, ChatEvent, ChatNotice, ClientError, ConnectionStatus, HubAction,
    HubClient, HubConfig, Identity, Lifecycle, LinkEvent, NotificationAction, NotificationClient,
    NotificationEvent, NotificationNotice, TypingConfig,
};
use evsync_core::{ConnectionError, Environment};
use evsync_proto::{ConversationId, Credential, NotificationId, NotificationStatus};
use tracing::{debug, warn};

use crate::{
    SimEnv,
    invariants::{
        ClientSnapshot, ConversationSnapshot, HubSnapshot, InvariantRegistry, SystemSnapshot,
    },
    operation::{self, HubKind, Operation},
    sim_hub::{ConnId, Delivery, SimHub},
};

/// Upper bound on link events processed by one delivery run.
const MAX_DELIVERIES: usize = 100_000;

/// Upper bound on timer firings within one `advance`.
const MAX_TIMER_STEPS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct SimLink {
    generation: u64,
    conn: ConnId,
}

/// Driver-side state of one hub connection.
#[derive(Debug)]
struct HubSide<N> {
    link: Option<SimLink>,
    status: ConnectionStatus,
    history: Vec<ConnectionStatus>,
    offline_sends: usize,
    notices: Vec<N>,
}

impl<N> HubSide<N> {
    fn new() -> Self {
        Self {
            link: None,
            status: ConnectionStatus::Disconnected,
            history: vec![ConnectionStatus::Disconnected],
            offline_sends: 0,
            notices: Vec::new(),
        }
    }

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot { status_history: self.history.clone(), offline_sends: self.offline_sends }
    }

    /// Execute actions against `hub`. Returns link events for this side and
    /// frames the hub wants delivered.
    fn execute(
        &mut self,
        hub: &mut SimHub,
        principal: &str,
        actions: Vec<HubAction<N>>,
    ) -> (Vec<LinkEvent>, Vec<Delivery>) {
        let mut events = Vec::new();
        let mut deliveries = Vec::new();

        for action in actions {
            match action {
                HubAction::Dial { generation, .. } => {
                    if let Some(old) = self.link.take() {
                        hub.close(old.conn);
                    }
                    match hub.dial(principal) {
                        Ok(conn) => {
                            self.link = Some(SimLink { generation, conn });
                            events.push(LinkEvent::Established { generation });
                        },
                        Err(error) => events.push(LinkEvent::Failed { generation, error }),
                    }
                },
                HubAction::CloseLink { generation } => {
                    if let Some(link) = self.link.take_if(|link| link.generation == generation) {
                        hub.close(link.conn);
                    }
                },
                HubAction::Send(frame) => match self.link {
                    Some(link) if self.status.is_connected() => {
                        deliveries.extend(hub.receive(link.conn, frame));
                    },
                    _ => {
                        warn!(status = %self.status, "send while offline");
                        self.offline_sends += 1;
                    },
                },
                HubAction::StatusChanged { to, .. } => {
                    self.status = to;
                    self.history.push(to);
                },
                HubAction::Notice(notice) => self.notices.push(notice),
            }
        }

        (events, deliveries)
    }
}

/// One simulated session: both clients plus their driver state.
#[derive(Debug)]
pub struct SimClient {
    identity: Identity,
    chat: ChatClient<SimEnv>,
    notifications: NotificationClient<SimEnv>,
    chat_side: HubSide<ChatNotice>,
    notification_side: HubSide<NotificationNotice>,
}

impl SimClient {
    fn new(env: &SimEnv, identity: Identity) -> Self {
        let chat = ChatClient::new(
            env.clone(),
            identity.clone(),
            HubConfig::default(),
            TypingConfig::default(),
        );
        let notifications =
            NotificationClient::new(env.clone(), identity.clone(), HubConfig::default());
        Self {
            identity,
            chat,
            notifications,
            chat_side: HubSide::new(),
            notification_side: HubSide::new(),
        }
    }

    /// Session identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Conversation client.
    pub fn chat(&self) -> &ChatClient<SimEnv> {
        &self.chat
    }

    /// Notification client.
    pub fn notifications(&self) -> &NotificationClient<SimEnv> {
        &self.notifications
    }

    /// Every conversation notice emitted so far.
    pub fn chat_notices(&self) -> &[ChatNotice] {
        &self.chat_side.notices
    }

    /// Every notification notice emitted so far.
    pub fn notification_notices(&self) -> &[NotificationNotice] {
        &self.notification_side.notices
    }

    /// Statuses the given hub went through.
    pub fn status_history(&self, hub: HubKind) -> &[ConnectionStatus] {
        match hub {
            HubKind::Chat => &self.chat_side.history,
            HubKind::Notifications => &self.notification_side.history,
        }
    }

    /// Server-side connection of the given hub, if linked.
    pub fn conn(&self, hub: HubKind) -> Option<ConnId> {
        self.link(hub).map(|link| link.conn)
    }

    fn link(&self, hub: HubKind) -> Option<SimLink> {
        match hub {
            HubKind::Chat => self.chat_side.link,
            HubKind::Notifications => self.notification_side.link,
        }
    }

    fn principal(&self) -> String {
        self.identity.sender().as_str().to_string()
    }
}

#[derive(Debug)]
struct Pending {
    client: usize,
    hub: HubKind,
    event: LinkEvent,
}

/// Sessions, hubs and the link events in flight between them.
#[derive(Debug)]
pub struct SimWorld {
    env: SimEnv,
    chat_hub: SimHub,
    notification_hub: SimHub,
    clients: Vec<SimClient>,
    pending: VecDeque<Pending>,
    touched: BTreeSet<ConversationId>,
    credential: Credential,
    invariants: Option<InvariantRegistry>,
}

impl SimWorld {
    /// World with one session per identity. Nothing is connected yet.
    pub fn new(seed: u64, identities: Vec<Identity>) -> Self {
        let env = SimEnv::with_seed(seed);
        let clients = identities.into_iter().map(|id| SimClient::new(&env, id)).collect();
        Self {
            chat_hub: SimHub::new(env.clone(), "chat"),
            notification_hub: SimHub::new(env.clone(), "notifications"),
            env,
            clients,
            pending: VecDeque::new(),
            touched: BTreeSet::new(),
            credential: Credential::bearer("sim-token"),
            invariants: None,
        }
    }

    /// Enable invariant checking after every [`SimWorld::apply`].
    #[must_use]
    pub fn with_invariants(mut self, registry: InvariantRegistry) -> Self {
        self.invariants = Some(registry);
        self
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True if the world has no sessions.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Session `index`.
    pub fn client(&self, index: usize) -> &SimClient {
        &self.clients[index]
    }

    /// Server side of the given hub.
    pub fn hub(&self, hub: HubKind) -> &SimHub {
        match hub {
            HubKind::Chat => &self.chat_hub,
            HubKind::Notifications => &self.notification_hub,
        }
    }

    /// Mutable server side of the given hub, for fault scripting.
    pub fn hub_mut(&mut self, hub: HubKind) -> &mut SimHub {
        match hub {
            HubKind::Chat => &mut self.chat_hub,
            HubKind::Notifications => &mut self.notification_hub,
        }
    }

    /// Link events and frames not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Apply one model operation. Client ids wrap around the session count.
    ///
    /// Returns the client's rejection for invalid intents (such as an empty
    /// message); the world stays consistent either way.
    pub fn apply(&mut self, op: &Operation) -> Result<(), ClientError> {
        let count = self.clients.len().max(1);
        let index = |id: u8| usize::from(id) % count;

        let result = match *op {
            Operation::Connect { client_id } => {
                self.connect(index(client_id));
                Ok(())
            },
            Operation::Disconnect { client_id } => {
                self.disconnect(index(client_id));
                Ok(())
            },
            Operation::Join { client_id, conversation } => {
                self.join(index(client_id), operation::conversation(conversation))
            },
            Operation::Leave { client_id, conversation } => {
                self.leave(index(client_id), operation::conversation(conversation))
            },
            Operation::Send { client_id, conversation, seed } => {
                let content = format!("message {seed}");
                self.send(index(client_id), operation::conversation(conversation), &content)
            },
            Operation::Typing { client_id, conversation } => {
                self.typing(index(client_id), operation::conversation(conversation))
            },
            Operation::MarkRead { client_id, conversation } => {
                self.mark_read(index(client_id), operation::conversation(conversation))
            },
            Operation::PushNotification { client_id } => {
                self.push_notification(index(client_id), "Service update");
                Ok(())
            },
            Operation::MarkAllNotificationsRead { client_id } => {
                self.notification_event(index(client_id), NotificationEvent::MarkAllRead);
                Ok(())
            },
            Operation::DropLink { client_id, hub } => {
                self.drop_link(index(client_id), hub);
                Ok(())
            },
            Operation::RefuseDials { hub, count } => {
                let error = ConnectionError::Transport("connection refused".into());
                self.hub_mut(hub).refuse_next(usize::from(count % 8), &error);
                Ok(())
            },
            Operation::AdvanceTime { millis } => {
                self.advance(Duration::from_millis(u64::from(millis)));
                Ok(())
            },
            Operation::DeliverPending => {
                self.deliver_pending();
                Ok(())
            },
        };

        if let Some(registry) = &self.invariants {
            registry.assert_all(&self.snapshot(), &format!("after {op:?}"));
        }
        result
    }

    /// Start connecting both hubs of session `index`.
    pub fn connect(&mut self, index: usize) {
        let credential = self.credential.clone();
        let actions = self.clients[index].chat.lifecycle(Lifecycle::Connect(credential.clone()));
        self.chat_actions(index, actions);
        let actions = self.clients[index].notifications.lifecycle(Lifecycle::Connect(credential));
        self.notification_actions(index, actions);
    }

    /// Force both hubs of session `index` to `Disconnected`.
    pub fn disconnect(&mut self, index: usize) {
        let actions = self.clients[index].chat.lifecycle(Lifecycle::Disconnect);
        self.chat_actions(index, actions);
        let actions = self.clients[index].notifications.lifecycle(Lifecycle::Disconnect);
        self.notification_actions(index, actions);
    }

    /// Orderly shutdown of session `index`.
    pub fn dispose(&mut self, index: usize) {
        let actions = self.clients[index].chat.lifecycle(Lifecycle::Dispose);
        self.chat_actions(index, actions);
        let actions = self.clients[index].notifications.lifecycle(Lifecycle::Dispose);
        self.notification_actions(index, actions);
    }

    /// Open `conversation`.
    pub fn join(&mut self, index: usize, conversation: ConversationId) -> Result<(), ClientError> {
        self.touched.insert(conversation);
        self.chat_event(index, ChatEvent::Join(conversation))
    }

    /// Close `conversation`.
    pub fn leave(&mut self, index: usize, conversation: ConversationId) -> Result<(), ClientError> {
        self.chat_event(index, ChatEvent::Leave(conversation))
    }

    /// Send `content` to `conversation`.
    pub fn send(
        &mut self,
        index: usize,
        conversation: ConversationId,
        content: &str,
    ) -> Result<(), ClientError> {
        self.touched.insert(conversation);
        let content = content.to_string();
        self.chat_event(index, ChatEvent::SendMessage { conversation, content })
    }

    /// Type in `conversation`.
    pub fn typing(
        &mut self,
        index: usize,
        conversation: ConversationId,
    ) -> Result<(), ClientError> {
        self.chat_event(index, ChatEvent::Typing(conversation))
    }

    /// Read `conversation`. The marker is stored on the chat hub, which
    /// broadcasts it like the backend does after the REST call.
    pub fn mark_read(
        &mut self,
        index: usize,
        conversation: ConversationId,
    ) -> Result<(), ClientError> {
        self.chat_event(index, ChatEvent::MarkRead(conversation))
    }

    /// Push a notification to the user of session `index`. Guests have no
    /// user and receive nothing.
    pub fn push_notification(&mut self, index: usize, title: &str) {
        let Some(user) = self.clients[index].identity.user.clone() else {
            return;
        };
        let deliveries = self.notification_hub.push_notification(&user, title);
        self.route(HubKind::Notifications, deliveries);
    }

    /// Mark one notification read.
    pub fn mark_notification_read(&mut self, index: usize, id: NotificationId) {
        self.notification_event(index, NotificationEvent::MarkRead(id));
    }

    /// Break the link of `hub` for session `index`. Frames in flight on it
    /// are lost.
    pub fn drop_link(&mut self, index: usize, hub: HubKind) {
        let client = &mut self.clients[index];
        let link = match hub {
            HubKind::Chat => client.chat_side.link.take(),
            HubKind::Notifications => client.notification_side.link.take(),
        };
        let Some(link) = link else {
            return;
        };

        self.hub_mut(hub).close(link.conn);
        self.discard_frames(index, hub);
        let error = ConnectionError::Transport("connection reset".into());
        let event = LinkEvent::Lost { generation: link.generation, error };
        self.pending.push_back(Pending { client: index, hub, event });
    }

    /// Deliver link events and frames until nothing is in flight. Returns
    /// the number delivered.
    pub fn deliver_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(Pending { client, hub, event }) = self.pending.pop_front() {
            delivered += 1;
            if delivered > MAX_DELIVERIES {
                warn!(delivered, "delivery bound reached, stopping");
                break;
            }

            match hub {
                HubKind::Chat => {
                    let actions = self.clients[client].chat.lifecycle(Lifecycle::Link(event));
                    self.chat_actions(client, actions);
                },
                HubKind::Notifications => {
                    let actions =
                        self.clients[client].notifications.lifecycle(Lifecycle::Link(event));
                    self.notification_actions(client, actions);
                },
            }
        }
        delivered
    }

    /// Advance virtual time by `by`, firing every timer that falls due on
    /// the way and delivering what it produces.
    pub fn advance(&mut self, by: Duration) {
        let target = self.env.now() + by;

        let mut previous = None;
        for _ in 0..MAX_TIMER_STEPS {
            let next = self
                .clients
                .iter()
                .flat_map(|c| [c.chat.next_deadline(), c.notifications.next_deadline()])
                .flatten()
                .filter(|deadline| *deadline <= target)
                .min();
            let Some(deadline) = next else {
                break;
            };

            self.env.advance(deadline - self.env.now());
            let progressed = self.tick_all();
            // A deadline that survives an idle tick would spin forever
            if !progressed && previous == Some(deadline) {
                break;
            }
            previous = Some(deadline);
        }

        self.env.advance(target - self.env.now());
        self.tick_all();
    }

    /// Observable state of every session.
    pub fn snapshot(&self) -> SystemSnapshot {
        let clients = self
            .clients
            .iter()
            .enumerate()
            .map(|(id, client)| {
                let conversations = self
                    .touched
                    .iter()
                    .map(|&conversation| {
                        let messages = client.chat.messages(conversation);
                        let snapshot = ConversationSnapshot {
                            message_ids: messages.iter().map(|m| m.id.clone()).collect(),
                            peer_messages: messages
                                .iter()
                                .filter(|m| !client.identity.is_self(&m.sender))
                                .count(),
                            unread: client.chat.unread(conversation),
                        };
                        (conversation, snapshot)
                    })
                    .collect();

                ClientSnapshot {
                    id,
                    chat: client.chat_side.snapshot(),
                    notifications: client.notification_side.snapshot(),
                    conversations,
                    notification_unread: client.notifications.unread_count(),
                    notifications_new: client
                        .notifications
                        .notifications()
                        .iter()
                        .filter(|n| n.status == NotificationStatus::New)
                        .count(),
                }
            })
            .collect();

        SystemSnapshot::from_clients(clients)
    }

    /// Tick every client at the current time. Returns true if anything
    /// happened.
    fn tick_all(&mut self) -> bool {
        let now = self.env.now();
        let mut any = false;

        for index in 0..self.clients.len() {
            let actions = self.clients[index].chat.tick(now);
            any |= !actions.is_empty();
            self.chat_actions(index, actions);

            let actions = self.clients[index].notifications.tick(now);
            any |= !actions.is_empty();
            self.notification_actions(index, actions);
        }

        any |= self.deliver_pending() > 0;
        any
    }

    fn chat_event(
        &mut self,
        index: usize,
        event: ChatEvent<crate::SimInstant>,
    ) -> Result<(), ClientError> {
        let actions = self.clients[index].chat.handle(event)?;
        self.chat_actions(index, actions);
        Ok(())
    }

    fn notification_event(&mut self, index: usize, event: NotificationEvent<crate::SimInstant>) {
        let actions = self.clients[index].notifications.handle(event);
        self.notification_actions(index, actions);
    }

    fn chat_actions(&mut self, index: usize, actions: Vec<ChatAction>) {
        let markers: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                HubAction::Notice(ChatNotice::MarkedRead { marker: Some(marker), .. }) => {
                    Some(marker.clone())
                },
                _ => None,
            })
            .collect();
        let closes = actions.iter().any(|a| matches!(a, HubAction::CloseLink { .. }));

        let client = &mut self.clients[index];
        let principal = client.principal();
        let (events, mut deliveries) =
            client.chat_side.execute(&mut self.chat_hub, &principal, actions);
        for marker in &markers {
            deliveries.extend(self.chat_hub.store_read_marker(marker));
        }

        if closes {
            self.discard_frames(index, HubKind::Chat);
        }
        self.enqueue(index, HubKind::Chat, events);
        self.route(HubKind::Chat, deliveries);
    }

    fn notification_actions(&mut self, index: usize, actions: Vec<NotificationAction>) {
        let closes = actions.iter().any(|a| matches!(a, HubAction::CloseLink { .. }));

        let client = &mut self.clients[index];
        let principal = client.principal();
        let (events, deliveries) =
            client.notification_side.execute(&mut self.notification_hub, &principal, actions);

        if closes {
            self.discard_frames(index, HubKind::Notifications);
        }
        self.enqueue(index, HubKind::Notifications, events);
        self.route(HubKind::Notifications, deliveries);
    }

    fn enqueue(&mut self, client: usize, hub: HubKind, events: Vec<LinkEvent>) {
        self.pending.extend(events.into_iter().map(|event| Pending { client, hub, event }));
    }

    /// Turn hub deliveries into frame events for the owning clients.
    fn route(&mut self, hub: HubKind, deliveries: Vec<Delivery>) {
        for Delivery { conn, frame } in deliveries {
            let owner = self.clients.iter().enumerate().find_map(|(index, client)| {
                client.link(hub).filter(|link| link.conn == conn).map(|link| (index, link))
            });
            match owner {
                Some((client, link)) => {
                    let event = LinkEvent::Frame { generation: link.generation, frame };
                    self.pending.push_back(Pending { client, hub, event });
                },
                None => debug!(conn, "delivery for closed connection dropped"),
            }
        }
    }

    fn discard_frames(&mut self, client: usize, hub: HubKind) {
        self.pending.retain(|p| {
            !(p.client == client && p.hub == hub && matches!(p.event, LinkEvent::Frame { .. }))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_users() -> SimWorld {
        SimWorld::new(1, vec![Identity::user("tech"), Identity::user("customer")])
            .with_invariants(InvariantRegistry::standard())
    }

    #[test]
    fn connect_reaches_connected_after_delivery() {
        let mut world = two_users();
        world.connect(0);

        assert_eq!(world.client(0).chat().status(), ConnectionStatus::Connecting);
        world.deliver_pending();
        assert_eq!(world.client(0).chat().status(), ConnectionStatus::Connected);

        let conn = world.client(0).conn(HubKind::Chat).unwrap();
        assert!(world.hub(HubKind::Chat).in_user_group(conn));
    }

    #[test]
    fn dropped_link_reconnects_on_tick() {
        let mut world = two_users();
        world.connect(0);
        world.deliver_pending();

        world.drop_link(0, HubKind::Chat);
        world.deliver_pending();
        world.advance(Duration::from_secs(1));

        assert_eq!(world.client(0).chat().status(), ConnectionStatus::Connected);
        assert_eq!(world.hub(HubKind::Chat).dials(), 2);
    }
}
