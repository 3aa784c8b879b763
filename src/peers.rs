//! Paired-peer table: five fixed slots, each owning its address, key
//! material, cipher session and a bounded inbound mailbox.

use std::collections::VecDeque;

use crate::cipher::CipherSession;
use crate::identity::{Address, KeyAgreementError, Keypair, Uid, KEY_SIZE};

/// Number of peer slots, matching the radio's reading pipes 1..=5.
pub const MAX_PEERS: usize = 5;

/// Complete messages retained per peer before the oldest is dropped.
pub const MAX_MAILBOX: usize = 3;

/// Peer-table operation failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("slot out of range")]
    InvalidSlot,
    #[error(transparent)]
    Crypto(#[from] KeyAgreementError),
}

/// One peer slot. An unused slot has no address, all-zero key material and an
/// empty mailbox; the cipher session key always equals the stored shared key.
pub struct PeerSlot {
    addr: Option<Address>,
    public_key: [u8; KEY_SIZE],
    shared_key: [u8; KEY_SIZE],
    cipher: CipherSession,
    mailbox: VecDeque<Vec<u8>>,
}

impl PeerSlot {
    fn empty() -> Self {
        Self {
            addr: None,
            public_key: [0u8; KEY_SIZE],
            shared_key: [0u8; KEY_SIZE],
            cipher: CipherSession::new([0u8; KEY_SIZE]),
            mailbox: VecDeque::new(),
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.addr
    }

    pub fn is_empty(&self) -> bool {
        self.addr.is_none()
    }

    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        &self.public_key
    }

    /// The derived session key. All zero for unused or address-only slots;
    /// always equal to the cipher session's key.
    pub fn shared_key(&self) -> &[u8; KEY_SIZE] {
        &self.shared_key
    }

    pub fn cipher_mut(&mut self) -> &mut CipherSession {
        &mut self.cipher
    }

    /// Append a complete message, dropping the oldest one when full.
    pub fn push_message(&mut self, msg: Vec<u8>) {
        if self.mailbox.len() >= MAX_MAILBOX {
            self.mailbox.pop_front();
        }
        self.mailbox.push_back(msg);
    }

    /// Pop the oldest message.
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.mailbox.pop_front()
    }

    pub fn message_count(&self) -> usize {
        self.mailbox.len()
    }

    pub fn clear_messages(&mut self) {
        self.mailbox.clear();
    }

    fn reset(&mut self) {
        self.addr = None;
        self.public_key = [0u8; KEY_SIZE];
        self.shared_key = [0u8; KEY_SIZE];
        self.cipher.set_key([0u8; KEY_SIZE]);
        self.mailbox.clear();
    }
}

/// Fixed table of [`MAX_PEERS`] slots. Non-empty addresses are unique and a
/// slot keeps its index until explicitly cleared.
pub struct PeerTable {
    slots: [PeerSlot; MAX_PEERS],
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| PeerSlot::empty()),
        }
    }

    pub fn slot(&self, slot: usize) -> Option<&PeerSlot> {
        self.slots.get(slot)
    }

    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut PeerSlot> {
        self.slots.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSlot> {
        self.slots.iter()
    }

    /// Install a peer: derive the shared key from `peer_public`, wipe the
    /// slot, then write address and keys and rekey the cipher in one step.
    /// Any other slot already holding `addr` is cleared first.
    pub fn assign(
        &mut self,
        slot: usize,
        addr: Address,
        peer_public: [u8; KEY_SIZE],
        keypair: &Keypair,
    ) -> Result<(), TableError> {
        if slot >= MAX_PEERS {
            return Err(TableError::InvalidSlot);
        }
        let shared = keypair.shared_key(&peer_public)?;
        if let Some(dup) = self.find_by_address(&addr) {
            if dup != slot {
                self.clear(dup);
            }
        }
        let entry = &mut self.slots[slot];
        entry.reset();
        entry.addr = Some(addr);
        entry.public_key = peer_public;
        entry.shared_key = shared;
        entry.cipher.set_key(shared);
        Ok(())
    }

    /// Install an address without key material. Encryption stays unusable
    /// for the slot until a key arrives through pairing.
    pub fn assign_addr_only(&mut self, slot: usize, addr: Address) -> Result<(), TableError> {
        if slot >= MAX_PEERS {
            return Err(TableError::InvalidSlot);
        }
        if let Some(dup) = self.find_by_address(&addr) {
            if dup != slot {
                self.clear(dup);
            }
        }
        let entry = &mut self.slots[slot];
        entry.reset();
        entry.addr = Some(addr);
        Ok(())
    }

    /// Wipe a slot: address, keys, cipher and mailbox.
    pub fn clear(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.reset();
        }
    }

    /// Clear the slot whose peer UID matches, if any. Returns `true` when a
    /// slot was cleared.
    pub fn clear_uid(&mut self, uid: &Uid) -> bool {
        match self.find_by_uid(uid) {
            Some(slot) => {
                self.clear(slot);
                true
            }
            None => false,
        }
    }

    pub fn find_by_address(&self, addr: &Address) -> Option<usize> {
        self.slots.iter().position(|s| s.addr == Some(*addr))
    }

    /// Match on the 4-character UID tail of each stored address.
    pub fn find_by_uid(&self, uid: &Uid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.addr.map(|a| a.uid()) == Some(*uid))
    }

    /// First unused slot, if the table is not full.
    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_empty())
    }
}
