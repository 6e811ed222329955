// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Channel records and the structures that index them.
//!
//! A channel is shared between the guest-facing MMIO path and host-side
//! service threads, so its wake state sits behind a per-channel lock. The
//! id-keyed map is shared too (host callbacks resolve ids through it); the
//! traversal list the wake scheduler walks is touched only by the MMIO path.

use crate::service::PipeService;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::hash::Hasher;
use std::sync::Arc;

/// One live channel: a guest handle bound to a host service instance.
pub(crate) struct Channel {
    /// Guest-assigned opaque identifier.
    pub id: u64,
    /// The bound service handler. Only the MMIO path invokes it; dropped
    /// when the channel is destroyed.
    pub service: Mutex<Box<dyn PipeService>>,
    state: Mutex<WakeState>,
}

#[derive(Default)]
struct WakeState {
    wanted: u8,
    closed: bool,
}

impl Channel {
    pub fn new(id: u64, service: Box<dyn PipeService>) -> Arc<Self> {
        Arc::new(Self {
            id,
            service: Mutex::new(service),
            state: Mutex::new(WakeState::default()),
        })
    }

    /// Returns the pending wake mask and clears it.
    pub fn take_wanted(&self) -> u8 {
        let mut state = self.state.lock();
        std::mem::take(&mut state.wanted)
    }

    /// ORs `bits` into the pending wake mask. Returns the new mask and
    /// whether the host has closed the channel.
    pub fn or_wanted(&self, bits: u8) -> (u8, bool) {
        let mut state = self.state.lock();
        state.wanted |= bits;
        (state.wanted, state.closed)
    }

    /// The pending wake mask.
    pub fn wanted(&self) -> u8 {
        self.state.lock().wanted
    }

    /// Whether the host has closed the channel.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Marks the channel closed by the host. Returns `false` if it already
    /// was.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.closed, true)
    }
}

/// Hashes channel ids with the device's fixed mixing function,
/// `h(x) = x ^ (x >> 6)`.
#[derive(Default)]
pub(crate) struct ChannelIdHasher(u64);

impl Hasher for ChannelIdHasher {
    fn write(&mut self, bytes: &[u8]) {
        // Channel ids arrive through write_u64; fold anything else in
        // byte-wise so the hasher stays total.
        for &b in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(b);
        }
    }

    fn write_u64(&mut self, id: u64) {
        self.0 = id ^ (id >> 6);
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// Channels keyed by id, for O(1) command dispatch and host-callback
/// resolution.
pub(crate) type ChannelMap = HashMap<u64, Arc<Channel>, BuildHasherDefault<ChannelIdHasher>>;

/// The traversal list the wake scheduler walks, newest channel first, plus
/// the scan cursor.
///
/// `entries[cursor..]` is the remaining scan suffix; restarting the walk
/// rewinds the cursor to the front. OPEN and CLOSE discard the
/// already-scanned prefix before mutating, so the saved head and the list
/// head coincide again afterwards.
#[derive(Default)]
pub(crate) struct ChannelList {
    pub entries: Vec<Arc<Channel>>,
    pub cursor: usize,
}

impl ChannelList {
    /// Prepends a freshly opened channel ahead of the remaining suffix.
    pub fn prepend(&mut self, channel: Arc<Channel>) {
        self.entries.drain(..self.cursor);
        self.cursor = 0;
        self.entries.insert(0, channel);
    }

    /// Unlinks `id`, searching the remaining suffix only (channels the scan
    /// already passed are not reachable, matching the hardware walk).
    pub fn unlink(&mut self, id: u64) -> Option<Arc<Channel>> {
        let index = (self.cursor..self.entries.len()).find(|&i| self.entries[i].id == id)?;
        let channel = self.entries.remove(index);
        self.entries.drain(..self.cursor);
        self.cursor = 0;
        Some(channel)
    }

    /// Index of the next signaled channel at or after the cursor.
    pub fn next_signaled(&self) -> Option<usize> {
        (self.cursor..self.entries.len()).find(|&i| self.entries[i].wanted() != 0)
    }

    /// Restores the scan to the saved head.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}
