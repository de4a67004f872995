use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use eventwire_frame::DEFAULT_CHANNEL;

/// Per-channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Referenced but not confirmed by the peer (or suspended while reconnecting).
    Pending,
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Pending => "pending",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: ChannelState,
    /// Opened by the application or joined by the peer, as opposed to merely
    /// seen on an inbound frame. Only requested channels are re-joined.
    requested: bool,
}

impl Slot {
    fn requested(state: ChannelState) -> Self {
        Self {
            state,
            requested: true,
        }
    }
}

/// Channel registry for one logical connection.
///
/// The default channel exists from construction. Entries are never removed;
/// a closed channel stays `Closed` until it is explicitly opened again.
#[derive(Debug)]
pub struct ChannelTable {
    channels: Mutex<BTreeMap<String, Slot>>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTable {
    pub fn new() -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(
            DEFAULT_CHANNEL.to_string(),
            Slot::requested(ChannelState::Pending),
        );
        Self {
            channels: Mutex::new(channels),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent open. Returns the resulting state and whether the channel
    /// was (re)created, meaning a CONNECT is owed to the peer.
    pub fn open(&self, name: &str) -> (ChannelState, bool) {
        let mut channels = self.lock();
        match channels.get(name) {
            Some(slot) if slot.requested && slot.state != ChannelState::Closed => {
                (slot.state, false)
            }
            _ => {
                channels.insert(name.to_string(), Slot::requested(ChannelState::Pending));
                (ChannelState::Pending, true)
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<ChannelState> {
        self.lock().get(name).map(|slot| slot.state)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.state(name) == Some(ChannelState::Open)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Force a state, creating the entry if needed. Returns the previous state.
    pub fn set(&self, name: &str, state: ChannelState) -> Option<ChannelState> {
        self.lock()
            .insert(name.to_string(), Slot::requested(state))
            .map(|slot| slot.state)
    }

    /// `Pending → Open` for a requested channel. False otherwise.
    pub fn mark_open(&self, name: &str) -> bool {
        match self.lock().get_mut(name) {
            Some(slot) if slot.requested && slot.state == ChannelState::Pending => {
                slot.state = ChannelState::Open;
                true
            }
            _ => false,
        }
    }

    /// Look up the channel of an inbound frame without creating it.
    pub fn route_inbound(&self, name: &str) -> Option<ChannelState> {
        self.state(name)
    }

    /// Look up the channel of an inbound frame, recording an unknown one as
    /// `Pending`. Recorded channels are not re-joined after a reconnect.
    pub fn track_inbound(&self, name: &str) -> ChannelState {
        self.lock()
            .entry(name.to_string())
            .or_insert(Slot {
                state: ChannelState::Pending,
                requested: false,
            })
            .state
    }

    /// Mark closed. False if it was absent or already closed.
    pub fn close(&self, name: &str) -> bool {
        match self.lock().get_mut(name) {
            Some(slot) if slot.state != ChannelState::Closed => {
                slot.state = ChannelState::Closed;
                true
            }
            _ => false,
        }
    }

    pub fn close_all(&self) {
        for slot in self.lock().values_mut() {
            slot.state = ChannelState::Closed;
        }
    }

    /// Move every open channel back to `Pending`; returns their names.
    pub fn suspend_all(&self) -> Vec<String> {
        let mut suspended = Vec::new();
        for (name, slot) in self.lock().iter_mut() {
            if slot.state == ChannelState::Open {
                slot.state = ChannelState::Pending;
                suspended.push(name.clone());
            }
        }
        suspended
    }

    /// Requested non-default channels awaiting a CONNECT after (re)connecting.
    pub fn reconnect_targets(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(name, slot)| {
                name.as_str() != DEFAULT_CHANNEL
                    && slot.requested
                    && slot.state == ChannelState::Pending
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(String, ChannelState)> {
        self.lock()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.state))
            .collect()
    }
}
