//! Who the session acts as.

use evsync_proto::{Typist, UserId};

/// Identity of the local session.
///
/// Staff and customers are authenticated users; anonymous web chat runs as a
/// guest session with no user id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated user. `None` for guests.
    pub user: Option<UserId>,
    /// Guest chat session. `None` for authenticated users.
    pub guest_session: Option<String>,
    /// Service-center staff (joins the staff notification group).
    pub staff: bool,
}

impl Identity {
    /// Authenticated user.
    pub fn user(user: impl Into<String>) -> Self {
        Self { user: Some(UserId::new(user)), guest_session: None, staff: false }
    }

    /// Authenticated staff member.
    pub fn staff(user: impl Into<String>) -> Self {
        Self { staff: true, ..Self::user(user) }
    }

    /// Anonymous guest session.
    pub fn guest(session: impl Into<String>) -> Self {
        Self { user: None, guest_session: Some(session.into()), staff: false }
    }

    /// True if `sender` is this session.
    pub fn is_self(&self, sender: &UserId) -> bool {
        self.user.as_ref() == Some(sender)
            || self.guest_session.as_deref() == Some(sender.as_str())
    }

    /// True if `typist` is this session.
    pub fn is_typist(&self, typist: &Typist) -> bool {
        match typist {
            Typist::User(user) => self.user.as_ref() == Some(user),
            Typist::Guest(session) => self.guest_session.as_ref() == Some(session),
        }
    }

    /// Sender id recorded on locally sent messages.
    pub fn sender(&self) -> UserId {
        match (&self.user, &self.guest_session) {
            (Some(user), _) => user.clone(),
            (None, Some(guest)) => UserId::new(guest.clone()),
            (None, None) => UserId::new(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_matches_own_typing_and_messages() {
        let identity = Identity::guest("g-1");

        assert!(identity.is_typist(&Typist::Guest("g-1".into())));
        assert!(!identity.is_typist(&Typist::User(UserId::from("g-1"))));
        assert!(identity.is_self(&UserId::from("g-1")));
        assert_eq!(identity.sender(), UserId::from("g-1"));
    }
}
