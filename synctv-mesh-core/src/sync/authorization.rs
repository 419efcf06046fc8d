use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::ParticipantId;

/// Who may issue control messages
///
/// The host is always implicitly authorized and is never stored in the
/// member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationSet {
    host: ParticipantId,
    members: BTreeSet<ParticipantId>,
}

impl AuthorizationSet {
    #[must_use]
    pub fn new(host: ParticipantId) -> Self {
        Self {
            host,
            members: BTreeSet::new(),
        }
    }

    pub fn with_members(host: ParticipantId, members: impl IntoIterator<Item = ParticipantId>) -> Self {
        let mut set = Self::new(host);
        set.replace(members);
        set
    }

    #[must_use]
    pub const fn host(&self) -> &ParticipantId {
        &self.host
    }

    #[must_use]
    pub fn is_host(&self, id: &ParticipantId) -> bool {
        &self.host == id
    }

    #[must_use]
    pub fn permits(&self, id: &ParticipantId) -> bool {
        self.is_host(id) || self.members.contains(id)
    }

    /// Returns whether membership changed
    pub fn grant(&mut self, id: ParticipantId) -> bool {
        if self.is_host(&id) {
            return false;
        }
        self.members.insert(id)
    }

    pub fn revoke(&mut self, id: &ParticipantId) -> bool {
        self.members.remove(id)
    }

    pub fn set(&mut self, id: ParticipantId, granted: bool) -> bool {
        if granted {
            self.grant(id)
        } else {
            self.revoke(&id)
        }
    }

    /// Replace the whole list, e.g. from a `control-list-sync`
    pub fn replace(&mut self, members: impl IntoIterator<Item = ParticipantId>) {
        let host = self.host.clone();
        self.members = members.into_iter().filter(|id| *id != host).collect();
    }

    /// Explicit members, host excluded
    #[must_use]
    pub fn members(&self) -> Vec<ParticipantId> {
        self.members.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_is_implicit_member() {
        let host = ParticipantId::from("h");
        let mut set = AuthorizationSet::new(host.clone());
        assert!(set.permits(&host));
        assert!(!set.grant(host.clone()));
        assert!(set.members().is_empty());

        set.replace(vec![host.clone(), ParticipantId::from("a")]);
        assert_eq!(set.members(), vec![ParticipantId::from("a")]);
        assert!(set.permits(&host));
    }

    #[test]
    fn test_grant_and_revoke() {
        let mut set = AuthorizationSet::new(ParticipantId::from("h"));
        let guest = ParticipantId::from("g");
        assert!(!set.permits(&guest));

        assert!(set.set(guest.clone(), true));
        assert!(set.permits(&guest));
        assert!(!set.grant(guest.clone()));

        assert!(set.set(guest.clone(), false));
        assert!(!set.permits(&guest));
    }
}
