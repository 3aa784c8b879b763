//! The engine: owns the radio and multiplexes outbound transmission, inbound
//! reassembly and the pairing exchange over it, one step per tick.

use log::{debug, warn};

use crate::cipher::CipherError;
use crate::config::Config;
use crate::identity::{Address, Keypair, Uid, KEY_SIZE};
use crate::pairing::{Pairing, PairingEnd, PairingOutcome, Phase, CONFIG_TX};
use crate::peers::{PeerTable, TableError, MAX_PEERS};
use crate::persist::{self, PersistError};
use crate::radio::{DataRate, PaLevel, Radio};
use crate::transport::{Outbound, Reassembly, SendHandle, SendStatus, MAX_MSG_SIZE, MAX_RX_FRAGMENTS};
use crate::wire::{self, FrameHeader, FRAME_SIZE, HEADER_SIZE};

/// Engine state. `Receiving` only exists inside a tick; callers observe it
/// through `is_busy` during reentrant queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Transmitting,
    Receiving,
    PairingListen,
    PairingTransmit,
}

/// Why a send was refused. Failures after acceptance surface through the
/// returned [`SendHandle`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("engine is disabled")]
    Disabled,
    #[error("engine is busy")]
    Busy,
    #[error("message exceeds the transmit limit")]
    TooLarge,
    #[error("destination is not a paired peer")]
    NotPaired,
    #[error("slot out of range or unpaired")]
    InvalidSlot,
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Why pairing could not start.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PairError {
    #[error("engine is disabled")]
    Disabled,
    #[error("engine is busy")]
    Busy,
}

/// Protocol engine for one node.
///
/// Single-threaded and host-driven: the host calls [`ChirpCore::tick`] from
/// its main loop with a millisecond timestamp, and every other operation from
/// the same thread. The engine owns the radio exclusively.
pub struct ChirpCore<R: Radio> {
    radio: R,
    cfg: Config,
    uid: Uid,
    keypair: Keypair,
    table: PeerTable,
    state: State,
    outbound: Option<Outbound>,
    reassembly: [Reassembly; MAX_PEERS],
    pairing: Option<Pairing>,
    enabled: bool,
}

impl<R: Radio> ChirpCore<R> {
    /// Build an engine with a fresh keypair. `radio_id` is normalized into
    /// the 4-character UID. Call [`ChirpCore::begin`] before anything else.
    pub fn new(radio: R, cfg: Config, radio_id: &str) -> Self {
        let uid = Uid::new(radio_id);
        let keypair = Keypair::generate(&uid);
        Self::with_keypair(radio, cfg, radio_id, keypair)
    }

    pub fn with_keypair(radio: R, cfg: Config, radio_id: &str, keypair: Keypair) -> Self {
        Self {
            radio,
            cfg,
            uid: Uid::new(radio_id),
            keypair,
            table: PeerTable::new(),
            state: State::Idle,
            outbound: None,
            reassembly: Default::default(),
            pairing: None,
            enabled: false,
        }
    }

    /// Bring up the transceiver and start listening for paired peers.
    /// Returns `false` (and leaves the engine disabled) on driver failure.
    pub fn begin(&mut self) -> bool {
        if !self.radio.begin() {
            warn!("radio init failed");
            self.enabled = false;
            return false;
        }
        self.enabled = true;
        self.radio.set_pa_level(PaLevel::Max);
        self.radio.set_data_rate(DataRate::Kbps250);
        self.init_radio();
        true
    }

    /// Gate all radio activity. Disabling clears every mailbox and stops
    /// listening; enabling repeats driver bring-up.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.begin();
        } else {
            for slot in 0..MAX_PEERS {
                self.clear_messages(slot);
            }
            self.radio.stop_listening();
            self.enabled = false;
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state != State::Idle
    }

    pub fn is_available(&self) -> bool {
        !self.is_busy()
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn peers(&self) -> &PeerTable {
        &self.table
    }

    /// Local X25519 keys as `(public, secret)`.
    pub fn personal_keys(&self) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
        (self.keypair.public_bytes(), self.keypair.secret_bytes())
    }

    /// Replace the local keypair. The public key is re-derived from the
    /// secret; existing shared keys are untouched until the next assignment.
    pub fn set_personal_keys(&mut self, secret: [u8; KEY_SIZE]) {
        self.keypair = Keypair::from_secret_bytes(secret);
    }

    /// Advance the engine by one step.
    pub fn tick(&mut self, now_ms: u64) {
        if !self.enabled {
            return;
        }
        match self.state {
            State::PairingListen | State::PairingTransmit => self.pairing_tick(now_ms),
            State::Idle => {
                if let Some(pipe) = self.radio.available() {
                    self.state = State::Receiving;
                    self.receive_frame(pipe, now_ms);
                    self.state = State::Idle;
                }
            }
            State::Transmitting => self.transmit_step(),
            State::Receiving => {}
        }
        if !matches!(self.state, State::PairingListen | State::PairingTransmit) {
            for (slot, reassembly) in self.reassembly.iter_mut().enumerate() {
                if reassembly.expire(now_ms, self.cfg.receive_timeout_ms) {
                    warn!("reassembly timed out on slot {slot}");
                }
            }
        }
    }

    // -- pairing ---------------------------------------------------------

    /// Enter the pairing exchange on the config channel. Only legal when
    /// idle; the engine returns to normal operation when the exchange ends.
    pub fn start_pairing(&mut self, now_ms: u64) -> Result<(), PairError> {
        if !self.enabled {
            return Err(PairError::Disabled);
        }
        if self.state != State::Idle {
            return Err(PairError::Busy);
        }
        self.pairing = Some(Pairing::start(now_ms, &self.table));
        self.state = State::PairingListen;
        self.radio.set_channel(self.cfg.config_channel);
        self.radio.open_reading_pipe(1, &CONFIG_TX);
        self.radio.start_listening();
        debug!("pairing started");
        Ok(())
    }

    fn pairing_tick(&mut self, now_ms: u64) {
        let Some(pairing) = self.pairing.as_mut() else {
            self.state = State::Idle;
            return;
        };
        match pairing.tick(
            &mut self.radio,
            &mut self.table,
            &self.keypair,
            &self.uid,
            &self.cfg,
            now_ms,
        ) {
            PairingOutcome::Pending => {
                self.state = match pairing.phase() {
                    Phase::Listen => State::PairingListen,
                    Phase::Transmit => State::PairingTransmit,
                };
            }
            PairingOutcome::Done(end) => {
                match end {
                    PairingEnd::Paired(slot) => debug!("paired on slot {slot}"),
                    PairingEnd::Unpaired => debug!("unpair exchange completed"),
                    PairingEnd::Aborted => warn!("pairing aborted"),
                }
                self.pairing = None;
                self.state = State::Idle;
                self.init_radio();
            }
        }
    }

    // -- sending ---------------------------------------------------------

    /// Send to the peer paired on `slot`.
    pub fn send(&mut self, slot: usize, msg: &[u8], encrypt: bool) -> Result<SendHandle, SendError> {
        let addr = self
            .table
            .slot(slot)
            .and_then(|s| s.address())
            .ok_or(SendError::InvalidSlot)?;
        self.send_to_addr(msg, addr, encrypt)
    }

    /// Send to an explicit address. With `encrypt` the address must resolve
    /// to a paired peer; plaintext sends to arbitrary addresses are allowed.
    ///
    /// Accepts at most one message at a time; completion is polled through
    /// the returned handle.
    pub fn send_to_addr(
        &mut self,
        msg: &[u8],
        addr: Address,
        encrypt: bool,
    ) -> Result<SendHandle, SendError> {
        if !self.enabled {
            return Err(SendError::Disabled);
        }
        if self.state != State::Idle {
            return Err(SendError::Busy);
        }
        if msg.len() > MAX_MSG_SIZE {
            return Err(SendError::TooLarge);
        }

        let payload = if encrypt {
            let slot = self
                .table
                .find_by_address(&addr)
                .ok_or(SendError::NotPaired)?;
            match self.table.slot_mut(slot) {
                Some(peer) => peer.cipher_mut().encrypt(msg)?,
                None => return Err(SendError::NotPaired),
            }
        } else {
            msg.to_vec()
        };
        if wire::total_fragments(payload.len()) > MAX_RX_FRAGMENTS {
            return Err(SendError::TooLarge);
        }

        let handle = SendHandle::new();
        if payload.is_empty() {
            handle.set(SendStatus::Sent);
            return Ok(handle);
        }

        debug!("sending {} bytes to {addr}", payload.len());
        self.state = State::Transmitting;
        self.radio.stop_listening();
        self.radio.open_writing_pipe(addr.as_bytes());
        self.outbound = Some(Outbound::new(payload, addr, handle.clone()));
        self.transmit_step();
        Ok(handle)
    }

    /// Push the next fragment out. A missing auto-ACK abandons the message.
    fn transmit_step(&mut self) {
        let Some(out) = self.outbound.as_mut() else {
            self.state = State::Idle;
            return;
        };
        let (frame, chunk) = out.current_frame();
        if !self.radio.write(&frame) {
            warn!("frame write to {} unacknowledged, aborting send", out.target);
            out.status.set(SendStatus::Failed);
            self.outbound = None;
            self.state = State::Idle;
            self.radio.start_listening();
            return;
        }
        if out.advance(chunk) {
            debug!("message sent to {}", out.target);
            out.status.set(SendStatus::Sent);
            self.outbound = None;
            self.state = State::Idle;
            self.radio.start_listening();
        }
    }

    // -- receiving -------------------------------------------------------

    fn receive_frame(&mut self, pipe: u8, now_ms: u64) {
        let mut frame = [0u8; FRAME_SIZE];
        let n = self.radio.read(&mut frame);
        if !(1..=MAX_PEERS as u8).contains(&pipe) {
            return;
        }
        let slot = (pipe - 1) as usize;

        let mut packet = frame[..n].to_vec();
        wire::unpad(&mut packet);
        let Some(header) = FrameHeader::parse(&packet) else {
            return;
        };
        let Some(raw) = self.reassembly[slot].on_frame(header, &packet[HEADER_SIZE..], now_ms)
        else {
            return;
        };

        let Some(peer) = self.table.slot_mut(slot) else {
            return;
        };
        if peer.is_empty() {
            debug!("complete message on unpaired pipe {pipe} dropped");
            return;
        }
        let message = match peer.cipher_mut().decrypt(&raw) {
            Ok(plain) => plain,
            Err(CipherError::Replay) => {
                debug!("replayed message on slot {slot} dropped");
                return;
            }
            // Too short to carry a nonce: assume it was sent in the clear.
            Err(_) => raw,
        };
        peer.push_message(message);
        debug!("message delivered to mailbox {slot}");
    }

    // -- mailboxes -------------------------------------------------------

    pub fn messages_available(&self, slot: usize) -> usize {
        self.table.slot(slot).map_or(0, |s| s.message_count())
    }

    /// Pop the oldest complete message for `slot`.
    pub fn read_message(&mut self, slot: usize) -> Option<Vec<u8>> {
        self.table.slot_mut(slot).and_then(|s| s.pop_message())
    }

    pub fn clear_messages(&mut self, slot: usize) {
        if let Some(s) = self.table.slot_mut(slot) {
            s.clear_messages();
        }
    }

    // -- peer management -------------------------------------------------

    pub fn peer_address(&self, slot: usize) -> Option<Address> {
        self.table.slot(slot).and_then(|s| s.address())
    }

    pub fn peer_uid(&self, slot: usize) -> Option<Uid> {
        self.peer_address(slot).map(|a| a.uid())
    }

    pub fn slot_for_uid(&self, uid: &Uid) -> Option<usize> {
        self.table.find_by_uid(uid)
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.table.first_free()
    }

    /// Install a peer manually, as a committed pairing would.
    pub fn set_peer(
        &mut self,
        slot: usize,
        addr: Address,
        peer_public: [u8; KEY_SIZE],
    ) -> Result<(), TableError> {
        self.table.assign(slot, addr, peer_public, &self.keypair)?;
        self.open_slot_pipe(slot);
        Ok(())
    }

    /// Install a peer address without key material.
    pub fn set_peer_addr_only(&mut self, slot: usize, addr: Address) -> Result<(), TableError> {
        self.table.assign_addr_only(slot, addr)?;
        self.open_slot_pipe(slot);
        Ok(())
    }

    pub fn clear_peer(&mut self, slot: usize) {
        self.table.clear(slot);
    }

    /// Remove the peer with the given UID, if present.
    pub fn clear_peer_uid(&mut self, uid: &Uid) -> bool {
        self.table.clear_uid(uid)
    }

    // -- configuration document ------------------------------------------

    /// Paired-device list as JSON.
    pub fn paired_devices_json(&self, include_keys: bool) -> Result<String, PersistError> {
        persist::export_devices(&self.table, include_keys)
    }

    /// Replace the paired-device table from JSON and re-open reading pipes.
    pub fn set_paired_devices_json(&mut self, json: &str) -> Result<(), PersistError> {
        persist::import_devices(json, &mut self.table, &self.keypair)?;
        self.init_radio();
        Ok(())
    }

    /// Full configuration document (device table plus personal keys).
    pub fn export_config(&self, include_keys: bool) -> Result<String, PersistError> {
        persist::export_config(&self.table, &self.keypair, include_keys)
    }

    /// Restore a configuration document and re-open reading pipes.
    pub fn import_config(&mut self, json: &str) -> Result<(), PersistError> {
        persist::import_config(json, &mut self.table, &mut self.keypair)?;
        self.init_radio();
        Ok(())
    }

    // -- radio plumbing --------------------------------------------------

    /// Return to the data channel with reading pipes open for every paired
    /// slot. Used at bring-up and on every exit from pairing.
    fn init_radio(&mut self) {
        self.radio.set_channel(self.cfg.data_channel);
        for slot in 0..MAX_PEERS {
            if self.table.slot(slot).is_some_and(|s| !s.is_empty()) {
                self.open_slot_pipe(slot);
            }
        }
        self.radio.start_listening();
    }

    fn open_slot_pipe(&mut self, slot: usize) {
        let local = Address::for_slot(slot, &self.uid);
        self.radio.open_reading_pipe(slot as u8 + 1, local.as_bytes());
    }
}
