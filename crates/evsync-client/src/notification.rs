//! Notification hub client.
//!
//! A second connection, independent of the conversation hub: its own
//! [`HubChannel`], reconnect schedule and status. Feeds the notification
//! inbox and the unread badge.

use evsync_core::{ConnectionStatus, Environment, Identity, NotificationInbox};
use evsync_proto::{HubInvocation, InboundEvent, Notification, NotificationId, NotificationStatus};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    event::{NotificationEvent, NotificationNotice},
    hub::{Edge, FrameOutcome, HubAction, HubChannel, HubClient, HubConfig, Lifecycle},
};

/// Actions produced by the notification client.
pub type NotificationAction = HubAction<NotificationNotice>;

/// Client for the notification hub.
#[derive(Debug)]
pub struct NotificationClient<E>
where
    E: Environment,
{
    channel: HubChannel<E>,
    identity: Identity,
    inbox: NotificationInbox,
}

impl<E> NotificationClient<E>
where
    E: Environment,
{
    /// Create a disconnected client.
    pub fn new(env: E, identity: Identity, hub: HubConfig) -> Self {
        let channel = HubChannel::new(env, Self::HUB, hub);
        Self { channel, identity, inbox: NotificationInbox::new() }
    }

    /// Process an event and return resulting actions.
    pub fn handle(&mut self, event: NotificationEvent<E::Instant>) -> Vec<NotificationAction> {
        let mut out = Vec::new();
        match event {
            NotificationEvent::Lifecycle(request) => self.handle_lifecycle(request, &mut out),
            NotificationEvent::Tick { now } => {
                let edge = self.channel.tick(now, &mut out);
                self.on_edge(edge, &mut out);
            },
            NotificationEvent::MarkRead(id) => {
                if self.inbox.mark_read(&id) {
                    out.push(HubAction::Notice(NotificationNotice::MarkedRead(vec![id])));
                    self.unread_changed(&mut out);
                }
            },
            NotificationEvent::MarkAllRead => {
                let changed = self.inbox.mark_all_read();
                if !changed.is_empty() {
                    out.push(HubAction::Notice(NotificationNotice::MarkedRead(changed)));
                    self.unread_changed(&mut out);
                }
            },
            NotificationEvent::Reconcile(listing) => {
                if self.inbox.reconcile(listing) {
                    self.unread_changed(&mut out);
                }
            },
        }
        out
    }

    /// True once the hub endpoint was found missing.
    pub fn is_degraded(&self) -> bool {
        self.channel.connection().is_degraded()
    }

    /// Number of `NEW` notifications.
    pub fn unread_count(&self) -> usize {
        self.inbox.unread_count()
    }

    /// All notifications in arrival order.
    pub fn notifications(&self) -> &[Notification] {
        self.inbox.notifications()
    }

    /// Look up one notification.
    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.inbox.get(id)
    }

    fn handle_lifecycle(&mut self, request: Lifecycle, out: &mut Vec<NotificationAction>) {
        let edge = match request {
            Lifecycle::Connect(credential) => self.channel.connect(credential, out),
            Lifecycle::RenewCredential(credential) => {
                self.channel.renew_credential(credential);
                None
            },
            Lifecycle::Disconnect => self.channel.disconnect(out),
            Lifecycle::Dispose => {
                self.channel.disconnect(out);
                self.channel.reset();
                None
            },
            Lifecycle::Link(event) => match self.channel.link(event, out) {
                FrameOutcome::Handled => None,
                FrameOutcome::Edge(edge) => Some(edge),
                FrameOutcome::Invocation { target, arguments } => {
                    self.handle_invocation(&target, &arguments, out);
                    None
                },
                FrameOutcome::Failed { invocation, reason } => {
                    let target = invocation.target();
                    warn!(hub = Self::HUB, target, reason, "invocation failed");
                    None
                },
            },
        };
        self.on_edge(edge, out);
    }

    fn handle_invocation(
        &mut self,
        target: &str,
        arguments: &[Value],
        out: &mut Vec<NotificationAction>,
    ) {
        match InboundEvent::from_invocation(target, arguments) {
            Ok(InboundEvent::ReceiveNotification(notification)) => {
                let is_new = notification.status == NotificationStatus::New;
                if !self.inbox.on_notification(notification.clone()) {
                    debug!(id = %notification.id, "duplicate notification dropped");
                    return;
                }
                out.push(HubAction::Notice(NotificationNotice::Received(notification)));
                if is_new {
                    self.unread_changed(out);
                }
            },
            Ok(other) => {
                let target = other.target();
                warn!(hub = Self::HUB, target, "unexpected event on notification hub");
            },
            Err(error) => warn!(hub = Self::HUB, target, %error, "dropping malformed payload"),
        }
    }

    fn on_edge(&mut self, edge: Option<Edge>, out: &mut Vec<NotificationAction>) {
        match edge {
            Some(Edge::Up) => {
                if self.identity.staff {
                    self.channel.invoke(HubInvocation::JoinStaffGroup, out);
                }
            },
            // JoinStaffGroup is the only call and it is reissued on connect
            Some(Edge::Down(_)) | None => {},
        }
    }

    fn unread_changed(&self, out: &mut Vec<NotificationAction>) {
        out.push(HubAction::Notice(NotificationNotice::UnreadChanged(self.inbox.unread_count())));
    }
}

impl<E> HubClient for NotificationClient<E>
where
    E: Environment,
{
    type Env = E;
    type Notice = NotificationNotice;

    const HUB: &'static str = "notifications";

    fn lifecycle(&mut self, request: Lifecycle) -> Vec<NotificationAction> {
        let mut out = Vec::new();
        self.handle_lifecycle(request, &mut out);
        out
    }

    fn tick(&mut self, now: E::Instant) -> Vec<NotificationAction> {
        self.handle(NotificationEvent::Tick { now })
    }

    fn next_deadline(&self) -> Option<E::Instant> {
        self.channel.next_deadline()
    }

    fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }
}

#[cfg(test)]
mod tests {
    use evsync_proto::{Credential, HubFrame};
    use serde_json::json;

    use super::*;
    use crate::{LinkEvent, test_env::ManualEnv};

    fn client(identity: Identity) -> NotificationClient<ManualEnv> {
        NotificationClient::new(ManualEnv::new(), identity, HubConfig::default())
    }

    fn connect(client: &mut NotificationClient<ManualEnv>) -> Vec<NotificationAction> {
        let credential = Credential::bearer("token");
        let actions = client.handle(NotificationEvent::Lifecycle(Lifecycle::Connect(credential)));
        let generation = actions
            .iter()
            .find_map(|action| match action {
                HubAction::Dial { generation, .. } => Some(*generation),
                _ => None,
            })
            .unwrap();
        let established = Lifecycle::Link(LinkEvent::Established { generation });
        client.handle(NotificationEvent::Lifecycle(established))
    }

    fn push(client: &mut NotificationClient<ManualEnv>, payload: Value) -> Vec<NotificationAction> {
        let generation = client.channel.connection().generation();
        let frame = HubFrame::Invocation {
            invocation_id: None,
            target: "ReceiveNotification".into(),
            arguments: vec![payload],
        };
        let link = Lifecycle::Link(LinkEvent::Frame { generation, frame });
        client.handle(NotificationEvent::Lifecycle(link))
    }

    fn notices(actions: Vec<NotificationAction>) -> Vec<NotificationNotice> {
        actions
            .into_iter()
            .filter_map(|action| match action {
                HubAction::Notice(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }

    fn listed(id: &str, status: NotificationStatus) -> Notification {
        Notification {
            id: NotificationId::new(id),
            user: None,
            title: "Vehicle ready".into(),
            message: "Pick up at bay 3".into(),
            status,
            kind: None,
            created_at: None,
        }
    }

    #[test]
    fn staff_joins_staff_group_on_every_connect() {
        let mut staff = client(Identity::staff("advisor"));
        let actions = connect(&mut staff);

        assert!(actions.iter().any(|action| matches!(
            action,
            HubAction::Send(HubFrame::Invocation { target, .. }) if target == "JoinStaffGroup"
        )));

        let mut customer = client(Identity::user("customer"));
        let actions = connect(&mut customer);
        assert!(!actions.iter().any(|action| matches!(action, HubAction::Send(_))));
    }

    #[test]
    fn duplicate_push_counts_once() {
        let mut client = client(Identity::user("customer"));
        connect(&mut client);
        let payload = json!({ "notificationId": "n1", "status": "NEW", "title": "Ready" });

        let first = notices(push(&mut client, payload.clone()));
        let second = notices(push(&mut client, payload));

        assert_eq!(first.len(), 2);
        assert_eq!(first[1], NotificationNotice::UnreadChanged(1));
        assert!(second.is_empty());
        assert_eq!(client.unread_count(), 1);
    }

    #[test]
    fn read_push_does_not_touch_badge() {
        let mut client = client(Identity::user("customer"));
        connect(&mut client);

        let notices = notices(push(&mut client, json!({ "id": "n2", "status": "read" })));

        assert!(matches!(notices.as_slice(), [NotificationNotice::Received(_)]));
        assert_eq!(client.unread_count(), 0);
    }

    #[test]
    fn mark_read_decrements_once() {
        let mut client = client(Identity::user("customer"));
        connect(&mut client);
        push(&mut client, json!({ "notificationId": "n1" }));
        push(&mut client, json!({ "notificationId": "n2" }));

        let id = NotificationId::new("n1");
        let first = notices(client.handle(NotificationEvent::MarkRead(id.clone())));
        let again = notices(client.handle(NotificationEvent::MarkRead(id.clone())));

        assert_eq!(first, vec![
            NotificationNotice::MarkedRead(vec![id]),
            NotificationNotice::UnreadChanged(1),
        ]);
        assert!(again.is_empty());
    }

    #[test]
    fn mark_all_read_reports_changed_ids() {
        let mut client = client(Identity::user("customer"));
        client.handle(NotificationEvent::Reconcile(vec![
            listed("a", NotificationStatus::New),
            listed("b", NotificationStatus::Read),
            listed("c", NotificationStatus::New),
        ]));

        let notices = notices(client.handle(NotificationEvent::MarkAllRead));

        let changed = vec![NotificationId::new("a"), NotificationId::new("c")];
        assert_eq!(notices, vec![
            NotificationNotice::MarkedRead(changed),
            NotificationNotice::UnreadChanged(0),
        ]);
        assert!(client.handle(NotificationEvent::MarkAllRead).is_empty());
    }

    #[test]
    fn reconcile_while_disconnected_feeds_badge() {
        let mut client = client(Identity::user("customer"));
        assert_eq!(client.status(), ConnectionStatus::Disconnected);

        let first = notices(client.handle(NotificationEvent::Reconcile(vec![
            listed("a", NotificationStatus::New),
            listed("b", NotificationStatus::New),
        ])));
        assert_eq!(first, vec![NotificationNotice::UnreadChanged(2)]);

        // Read elsewhere; a later listing never reverts it to new
        let read = vec![listed("a", NotificationStatus::Read)];
        let second = notices(client.handle(NotificationEvent::Reconcile(read)));
        assert_eq!(second, vec![NotificationNotice::UnreadChanged(1)]);

        let stale = vec![listed("a", NotificationStatus::New)];
        assert!(client.handle(NotificationEvent::Reconcile(stale)).is_empty());
        let status = client.get(&NotificationId::new("a")).map(|n| n.status);
        assert_eq!(status, Some(NotificationStatus::Read));
    }

    #[test]
    fn chat_events_on_notification_hub_are_dropped() {
        let mut client = client(Identity::user("customer"));
        connect(&mut client);
        let generation = client.channel.connection().generation();
        let frame = HubFrame::Invocation {
            invocation_id: None,
            target: "UserJoined".into(),
            arguments: vec![json!("tech"), json!(4)],
        };

        let link = Lifecycle::Link(LinkEvent::Frame { generation, frame });
        let actions = client.handle(NotificationEvent::Lifecycle(link));

        assert!(actions.is_empty());
        assert!(client.notifications().is_empty());
    }
}
