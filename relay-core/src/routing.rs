//! Routing tables: identity → slot (reserved during handshake, active once a session runs) and
//! identity → subscribed groups. The host keeps one `RoutingTable` behind a single lock.

use std::collections::{BTreeSet, HashMap};

use crate::identity::Identity;
use crate::protocol::ResultCode;

/// Entry for one client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<S> {
    /// Handshake in progress; blocks a second handshake for the same identity.
    Reserved,
    Active(S),
}

/// Outcome of a group subscription update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUpdate {
    /// Groups now subscribed.
    pub applied: usize,
    /// Requested groups dropped because of the cap.
    pub dropped: usize,
}

impl GroupUpdate {
    pub fn code(&self) -> ResultCode {
        if self.dropped > 0 {
            ResultCode::GroupLimited
        } else {
            ResultCode::Success
        }
    }
}

/// Both routing maps. Generic over the session handle so the host decides what a session is.
pub struct RoutingTable<S> {
    slots: HashMap<Identity, Slot<S>>,
    groups: HashMap<Identity, BTreeSet<Identity>>,
    max_clients: usize,
    max_groups: usize,
}

impl<S: Clone> RoutingTable<S> {
    pub fn new(max_clients: usize, max_groups: usize) -> Self {
        Self {
            slots: HashMap::new(),
            groups: HashMap::new(),
            max_clients,
            max_groups,
        }
    }

    /// Reserve `identity` for a handshake. Reserved slots count towards capacity.
    pub fn reserve(&mut self, identity: Identity) -> Result<(), ResultCode> {
        if !identity.is_client() {
            return Err(ResultCode::CodeInvalid);
        }
        if self.slots.len() >= self.max_clients {
            return Err(ResultCode::CountLimited);
        }
        if self.slots.contains_key(&identity) {
            return Err(ResultCode::CodeConflict);
        }
        self.slots.insert(identity, Slot::Reserved);
        Ok(())
    }

    /// Drop a reservation after a failed handshake. The slot must still be `Reserved`.
    pub fn release(&mut self, identity: Identity) -> Result<(), ResultCode> {
        match self.slots.get(&identity) {
            Some(Slot::Reserved) => {
                self.slots.remove(&identity);
                Ok(())
            }
            _ => Err(ResultCode::AssertFailed),
        }
    }

    /// Replace the reservation with the running session.
    pub fn activate(&mut self, identity: Identity, session: S) -> Result<(), ResultCode> {
        match self.slots.get_mut(&identity) {
            Some(slot) if matches!(slot, Slot::Reserved) => {
                *slot = Slot::Active(session);
                Ok(())
            }
            _ => Err(ResultCode::AssertFailed),
        }
    }

    /// Remove an active session and its group subscriptions. Reservations are left alone.
    pub fn remove(&mut self, identity: Identity) -> Option<S> {
        match self.slots.get(&identity) {
            Some(Slot::Active(_)) => {}
            _ => return None,
        }
        self.groups.remove(&identity);
        match self.slots.remove(&identity) {
            Some(Slot::Active(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, identity: Identity) -> Option<&Slot<S>> {
        self.slots.get(&identity)
    }

    pub fn session(&self, identity: Identity) -> Option<&S> {
        match self.slots.get(&identity) {
            Some(Slot::Active(s)) => Some(s),
            _ => None,
        }
    }

    /// Reserved plus active slots.
    pub fn occupied(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Active(_)))
            .count()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Active identities in ascending order.
    pub fn roster(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self
            .slots
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Active(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Replace the group set of an active identity. Non-group entries are ignored; the rest is
    /// clamped to `max_groups` in request order.
    pub fn set_groups(
        &mut self,
        identity: Identity,
        requested: &[Identity],
    ) -> Result<GroupUpdate, ResultCode> {
        if !matches!(self.slots.get(&identity), Some(Slot::Active(_))) {
            return Err(ResultCode::AssertFailed);
        }
        let mut set = BTreeSet::new();
        let mut dropped = 0;
        for group in requested.iter().copied().filter(|g| g.is_group()) {
            if set.contains(&group) {
                continue;
            }
            if set.len() >= self.max_groups {
                dropped += 1;
                continue;
            }
            set.insert(group);
        }
        let applied = set.len();
        if set.is_empty() {
            self.groups.remove(&identity);
        } else {
            self.groups.insert(identity, set);
        }
        Ok(GroupUpdate { applied, dropped })
    }

    pub fn groups_of(&self, identity: Identity) -> Vec<Identity> {
        self.groups
            .get(&identity)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sessions an envelope from `source` to `target` must be delivered to.
    ///
    /// Relay target: every active session except `source`. Client target: that session if
    /// active, even when it is `source`. Group target: every subscriber except `source`.
    pub fn targets(&self, source: Identity, target: Identity) -> Vec<(Identity, S)> {
        if target.is_relay() {
            self.slots
                .iter()
                .filter(|(id, _)| **id != source)
                .filter_map(|(id, slot)| match slot {
                    Slot::Active(s) => Some((*id, s.clone())),
                    Slot::Reserved => None,
                })
                .collect()
        } else if target.is_client() {
            self.session(target)
                .map(|s| vec![(target, s.clone())])
                .unwrap_or_default()
        } else {
            self.groups
                .iter()
                .filter(|(id, set)| **id != source && set.contains(&target))
                .filter_map(|(id, _)| self.session(*id).map(|s| (*id, s.clone())))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable<&'static str> {
        RoutingTable::new(4, 2)
    }

    fn connect(t: &mut RoutingTable<&'static str>, id: i32, name: &'static str) {
        t.reserve(Identity(id)).unwrap();
        t.activate(Identity(id), name).unwrap();
    }

    fn ids(v: Vec<(Identity, &'static str)>) -> Vec<i32> {
        let mut out: Vec<i32> = v.into_iter().map(|(id, _)| id.0).collect();
        out.sort();
        out
    }

    #[test]
    fn reserve_rejects_non_client_identities() {
        let mut t = table();
        assert_eq!(t.reserve(Identity(0)), Err(ResultCode::CodeInvalid));
        assert_eq!(t.reserve(Identity(-2)), Err(ResultCode::CodeInvalid));
        assert_eq!(t.occupied(), 0);
    }

    #[test]
    fn reserved_identity_conflicts() {
        let mut t = table();
        t.reserve(Identity(3)).unwrap();
        assert_eq!(t.reserve(Identity(3)), Err(ResultCode::CodeConflict));
        t.activate(Identity(3), "a").unwrap();
        assert_eq!(t.reserve(Identity(3)), Err(ResultCode::CodeConflict));
    }

    #[test]
    fn capacity_counts_reservations() {
        let mut t: RoutingTable<&str> = RoutingTable::new(1, 2);
        t.reserve(Identity(5)).unwrap();
        assert_eq!(t.reserve(Identity(7)), Err(ResultCode::CountLimited));
        t.activate(Identity(5), "five").unwrap();
        assert_eq!(t.reserve(Identity(7)), Err(ResultCode::CountLimited));
        assert_eq!(t.session(Identity(5)), Some(&"five"));
    }

    #[test]
    fn capacity_checked_before_conflict() {
        let mut t: RoutingTable<&str> = RoutingTable::new(1, 2);
        connect(&mut t, 5, "five");
        assert_eq!(t.reserve(Identity(5)), Err(ResultCode::CountLimited));
    }

    #[test]
    fn release_and_activate_require_reservation() {
        let mut t = table();
        assert_eq!(t.release(Identity(1)), Err(ResultCode::AssertFailed));
        assert_eq!(t.activate(Identity(1), "x"), Err(ResultCode::AssertFailed));
        connect(&mut t, 1, "a");
        assert_eq!(t.release(Identity(1)), Err(ResultCode::AssertFailed));
        assert_eq!(t.activate(Identity(1), "b"), Err(ResultCode::AssertFailed));
        t.reserve(Identity(2)).unwrap();
        t.release(Identity(2)).unwrap();
        assert!(t.get(Identity(2)).is_none());
    }

    #[test]
    fn remove_clears_groups_but_not_reservations() {
        let mut t = table();
        connect(&mut t, 1, "a");
        t.set_groups(Identity(1), &[Identity(-1)]).unwrap();
        t.reserve(Identity(2)).unwrap();
        assert_eq!(t.remove(Identity(2)), None);
        assert_eq!(t.get(Identity(2)), Some(&Slot::Reserved));
        assert_eq!(t.remove(Identity(1)), Some("a"));
        assert!(t.groups_of(Identity(1)).is_empty());
        assert!(t.roster().is_empty());
    }

    #[test]
    fn broadcast_excludes_source_and_reservations() {
        let mut t = table();
        connect(&mut t, 1, "a");
        connect(&mut t, 2, "b");
        connect(&mut t, 3, "c");
        t.reserve(Identity(4)).unwrap();
        assert_eq!(ids(t.targets(Identity(1), Identity::RELAY)), vec![2, 3]);
        assert_eq!(ids(t.targets(Identity::RELAY, Identity::RELAY)), vec![1, 2, 3]);
    }

    #[test]
    fn unicast_to_absent_identity_is_empty() {
        let mut t = table();
        connect(&mut t, 1, "a");
        t.reserve(Identity(2)).unwrap();
        assert!(t.targets(Identity(1), Identity(2)).is_empty());
        assert!(t.targets(Identity(1), Identity(9)).is_empty());
    }

    #[test]
    fn unicast_to_self_is_delivered() {
        let mut t = table();
        connect(&mut t, 1, "a");
        connect(&mut t, 2, "b");
        assert_eq!(t.targets(Identity(1), Identity(1)), vec![(Identity(1), "a")]);
    }

    #[test]
    fn group_delivery_skips_self_subscribed_source() {
        let mut t = table();
        connect(&mut t, 1, "a");
        connect(&mut t, 2, "b");
        connect(&mut t, 3, "c");
        t.set_groups(Identity(1), &[Identity(-7)]).unwrap();
        t.set_groups(Identity(2), &[Identity(-7), Identity(-8)]).unwrap();
        t.set_groups(Identity(3), &[Identity(-8)]).unwrap();
        assert_eq!(ids(t.targets(Identity(1), Identity(-7))), vec![2]);
        assert_eq!(ids(t.targets(Identity(3), Identity(-8))), vec![2]);
        assert_eq!(ids(t.targets(Identity(9), Identity(-8))), vec![2, 3]);
    }

    #[test]
    fn group_set_is_replaced_and_clamped() {
        let mut t = table();
        connect(&mut t, 1, "a");
        let update = t
            .set_groups(
                Identity(1),
                &[Identity(-1), Identity(4), Identity(-1), Identity(-2), Identity(-3)],
            )
            .unwrap();
        assert_eq!(update, GroupUpdate { applied: 2, dropped: 1 });
        assert_eq!(update.code(), ResultCode::GroupLimited);
        assert_eq!(t.groups_of(Identity(1)), vec![Identity(-2), Identity(-1)]);

        let update = t.set_groups(Identity(1), &[Identity(-9)]).unwrap();
        assert_eq!(update.code(), ResultCode::Success);
        assert_eq!(t.groups_of(Identity(1)), vec![Identity(-9)]);
    }

    #[test]
    fn group_update_requires_active_session() {
        let mut t = table();
        t.reserve(Identity(1)).unwrap();
        assert_eq!(
            t.set_groups(Identity(1), &[Identity(-1)]),
            Err(ResultCode::AssertFailed)
        );
    }
}
