use std::io;

use mio::Token;
use tracing::{debug, trace};

use super::RelayError;

/// Summary of a single fan-out pass over a [`BroadcastDomain`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers that accepted (at least part of) the payload.
    pub delivered: usize,
    /// Peers whose send would have blocked. The payload is dropped for them.
    pub dropped: usize,
    /// Total bytes handed to the peers.
    pub bytes_tx: usize,
    /// Peers removed from the domain because sending to them failed. The caller is
    /// responsible for closing them.
    pub evicted: Vec<Token>,
}

/// The set of clients connected to one listener. A payload received from one member is
/// re-sent to every other member.
///
/// Members live in a slot array. Removing a member nulls its slot instead of shifting the
/// others, so slot indices of live members never move, even while a fan-out pass removes
/// failing peers. Freed slots are reused by later additions. Once the last member leaves
/// the storage is released.
#[derive(Debug)]
pub struct BroadcastDomain {
    /// The listener this domain belongs to.
    listener: Token,
    /// Member slots. The length is the high-water mark.
    slots: Vec<Option<Token>>,
    /// Number of occupied slots.
    occupied: usize,
    /// Number of slots allocated.
    capacity: usize,
}

impl BroadcastDomain {
    /// Creates an empty domain for the given listener. Does not allocate.
    pub fn new(listener: Token) -> Self {
        Self { listener, slots: Vec::new(), occupied: 0, capacity: 0 }
    }

    /// Token of the listener the members were accepted on.
    #[inline]
    pub fn listener(&self) -> Token {
        self.listener
    }

    /// Number of members.
    #[inline]
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Whether the domain has no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// One past the highest slot index used since the domain was last empty.
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.slots.len()
    }

    /// Number of allocated slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the slot index of `member`, if it is in the domain.
    pub fn slot_of(&self, member: Token) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(member))
    }

    /// Whether `member` is in the domain.
    #[inline]
    pub fn contains(&self, member: Token) -> bool {
        self.slot_of(member).is_some()
    }

    /// Iterates over the members in slot order.
    pub fn members(&self) -> impl Iterator<Item = Token> + '_ {
        self.slots.iter().flatten().copied()
    }

    /// Adds a member and returns its slot index.
    ///
    /// A freed slot below the high-water mark is reused first. Otherwise the member is
    /// appended, doubling the capacity (starting at 2) when the slots are exhausted.
    /// Fails with [`RelayError::ResourceExhausted`] if the slots cannot be grown.
    pub fn add(&mut self, member: Token) -> Result<usize, RelayError> {
        debug_assert!(!self.contains(member), "member {member:?} added twice");

        if let Some(index) = self.slots.iter().position(Option::is_none) {
            self.slots[index] = Some(member);
            self.occupied += 1;
            return Ok(index);
        }

        if self.slots.len() == self.capacity {
            let new_capacity = if self.capacity == 0 { 2 } else { self.capacity * 2 };
            self.slots.try_reserve_exact(new_capacity - self.slots.len())?;
            self.capacity = new_capacity;
            trace!(listener = ?self.listener, capacity = new_capacity, "Grew broadcast domain");
        }

        self.slots.push(Some(member));
        self.occupied += 1;

        Ok(self.slots.len() - 1)
    }

    /// Removes a member and returns the slot it occupied. Returns `None` if it was not a
    /// member.
    pub fn remove(&mut self, member: Token) -> Option<usize> {
        let index = self.slot_of(member)?;
        self.slots[index] = None;
        self.occupied -= 1;
        self.release_if_empty();

        Some(index)
    }

    /// Removes all members and releases the storage, returning the former members.
    pub(crate) fn clear(&mut self) -> Vec<Token> {
        let members = self.members().collect();
        self.slots = Vec::new();
        self.occupied = 0;
        self.capacity = 0;

        members
    }

    /// Sends `payload` to every member except `sender`, using `send` for each peer.
    ///
    /// A send that would block drops the payload for that peer. Any other send error
    /// evicts the peer from the domain; the evicted peers are listed in the report and
    /// must be closed by the caller. The sender is never evicted here.
    pub fn broadcast<F>(&mut self, sender: Token, payload: &[u8], mut send: F) -> BroadcastReport
    where
        F: FnMut(Token, &[u8]) -> io::Result<usize>,
    {
        let mut report = BroadcastReport::default();

        for index in 0..self.slots.len() {
            let Some(peer) = self.slots[index] else { continue };
            if peer == sender {
                continue;
            }

            match send(peer, payload) {
                Ok(written) => {
                    if written < payload.len() {
                        trace!(?peer, written, len = payload.len(), "Short write, dropping tail");
                    }
                    report.delivered += 1;
                    report.bytes_tx += written;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock ||
                        e.kind() == io::ErrorKind::Interrupted =>
                {
                    trace!(?peer, "Peer not writable, dropping payload");
                    report.dropped += 1;
                }
                Err(e) => {
                    debug!(?peer, err = ?e, "Failed to send to peer, evicting");
                    self.slots[index] = None;
                    self.occupied -= 1;
                    report.evicted.push(peer);
                }
            }
        }

        self.release_if_empty();

        report
    }

    fn release_if_empty(&mut self) {
        if self.occupied == 0 && self.capacity != 0 {
            self.slots = Vec::new();
            self.capacity = 0;
        }
    }
}
