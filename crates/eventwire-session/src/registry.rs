//! Server-side socket registry and rooms.
//!
//! A room is a named, server-wide group of sockets. Membership is keyed by
//! session id and disappears with the socket; empty rooms are dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use eventwire_codec::Value;
use tracing::debug;

use crate::socket::Socket;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live sockets by session id, and the rooms they have joined.
///
/// Lock order is `sockets` before `rooms`.
#[derive(Default)]
pub(crate) struct Registry {
    sockets: Mutex<BTreeMap<String, Socket>>,
    rooms: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl Registry {
    pub fn insert(&self, sid: String, socket: Socket) {
        lock(&self.sockets).insert(sid, socket);
    }

    /// Forget a socket and its memberships. Returns the rooms it was in.
    pub fn remove(&self, sid: &str) -> Vec<String> {
        let mut sockets = lock(&self.sockets);
        sockets.remove(sid);
        let mut left = Vec::new();
        lock(&self.rooms).retain(|room, members| {
            if members.remove(sid) {
                left.push(room.clone());
            }
            !members.is_empty()
        });
        left
    }

    pub fn sockets(&self) -> Vec<Socket> {
        lock(&self.sockets).values().cloned().collect()
    }

    pub fn socket(&self, sid: &str) -> Option<Socket> {
        lock(&self.sockets).get(sid).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sockets).len()
    }

    /// False if `sid` is not a live socket.
    pub fn join(&self, room: &str, sid: &str) -> bool {
        let sockets = lock(&self.sockets);
        if !sockets.contains_key(sid) {
            return false;
        }
        lock(&self.rooms)
            .entry(room.to_string())
            .or_default()
            .insert(sid.to_string());
        true
    }

    /// Whether `sid` was a member.
    pub fn leave(&self, room: &str, sid: &str) -> bool {
        let mut rooms = lock(&self.rooms);
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let was_member = members.remove(sid);
        if members.is_empty() {
            rooms.remove(room);
        }
        was_member
    }

    pub fn rooms_of(&self, sid: &str) -> Vec<String> {
        lock(&self.rooms)
            .iter()
            .filter(|(_, members)| members.contains(sid))
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub fn room_len(&self, room: &str) -> usize {
        lock(&self.rooms).get(room).map_or(0, BTreeSet::len)
    }

    /// Live members of `room`, ordered by session id.
    pub fn members(&self, room: &str) -> Vec<Socket> {
        let sockets = lock(&self.sockets);
        let rooms = lock(&self.rooms);
        rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|sid| sockets.get(sid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Emit on each target's default channel. Returns how many accepted it.
pub(crate) fn fan_out(targets: Vec<Socket>, event: &str, args: &[Value]) -> usize {
    let mut delivered = 0;
    for socket in targets {
        match socket.emit(event, args.to_vec()) {
            Ok(()) => delivered += 1,
            Err(err) => debug!(sid = ?socket.id(), event, error = %err, "fan-out skipped socket"),
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_needs_a_live_socket() {
        let registry = Registry::default();
        assert!(!registry.join("lobby", "node-1"));
        assert_eq!(registry.room_len("lobby"), 0);
        assert!(!registry.leave("lobby", "node-1"));
        assert!(registry.rooms_of("node-1").is_empty());
    }
}
