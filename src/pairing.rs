//! Pairing exchange on the config channel.
//!
//! Both nodes enter the listen role; whoever hears nothing for the listen
//! window escalates to the transmit role, which breaks the symmetry. The
//! exchange swaps public keys in the clear, then swaps pipe addresses
//! encrypted under the freshly derived shared key, which doubles as the
//! proof of possession. An advertised pipe digit of `'0'` turns the exchange
//! into an unpair request for the sender's UID.

use log::{debug, warn};

use crate::cipher::CipherSession;
use crate::config::Config;
use crate::identity::{Address, Keypair, Uid, ADDR_LEN, KEY_SIZE};
use crate::peers::PeerTable;
use crate::radio::Radio;
use crate::wire::{self, FRAME_SIZE};

/// Writing label of the transmit role; the listen role reads here.
pub(crate) const CONFIG_TX: [u8; ADDR_LEN] = *b"CFGTX";

/// Writing label of the listen role; the transmit role reads here.
pub(crate) const CONFIG_RX: [u8; ADDR_LEN] = *b"CFGRX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Listen,
    Transmit,
}

/// How a finished exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PairingEnd {
    Paired(usize),
    Unpaired,
    Aborted,
}

pub(crate) enum PairingOutcome {
    Pending,
    Done(PairingEnd),
}

/// Transient pairing scratch state. Dropped (and its key material zeroized
/// through the cipher session) as soon as the engine returns to idle.
pub(crate) struct Pairing {
    phase: Phase,
    started_ms: u64,
    last_attempt_ms: u64,
    unpair: bool,
    got_pubkey: bool,
    sent_pubkey: bool,
    got_ack: bool,
    sent_ack: bool,
    peer_public: [u8; KEY_SIZE],
    cipher: CipherSession,
    payload: Vec<u8>,
    /// First free table slot at entry; `None` means the table is full and
    /// this side will request an unpair instead of pairing.
    slot: Option<usize>,
}

impl Pairing {
    pub(crate) fn start(now_ms: u64, table: &PeerTable) -> Self {
        Self {
            phase: Phase::Listen,
            started_ms: now_ms,
            last_attempt_ms: 0,
            unpair: false,
            got_pubkey: false,
            sent_pubkey: false,
            got_ack: false,
            sent_ack: false,
            peer_public: [0u8; KEY_SIZE],
            cipher: CipherSession::new([0u8; KEY_SIZE]),
            payload: Vec::new(),
            slot: table.first_free(),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Advance the exchange by one step. The caller resets the radio to the
    /// data channel once this returns `Done`.
    pub(crate) fn tick<R: Radio>(
        &mut self,
        radio: &mut R,
        table: &mut PeerTable,
        keypair: &Keypair,
        uid: &Uid,
        cfg: &Config,
        now_ms: u64,
    ) -> PairingOutcome {
        let outcome = match self.phase {
            Phase::Listen => self.listen_tick(radio, table, keypair, uid, cfg, now_ms),
            Phase::Transmit => self.transmit_tick(radio, table, keypair, uid, cfg, now_ms),
        };
        if matches!(outcome, PairingOutcome::Pending)
            && now_ms.saturating_sub(self.started_ms) > cfg.pairing_timeout_ms
        {
            warn!("pairing timed out");
            return PairingOutcome::Done(PairingEnd::Aborted);
        }
        outcome
    }

    fn listen_tick<R: Radio>(
        &mut self,
        radio: &mut R,
        table: &mut PeerTable,
        keypair: &Keypair,
        uid: &Uid,
        cfg: &Config,
        now_ms: u64,
    ) -> PairingOutcome {
        // L1: take the peer's public key and derive the session key.
        if !self.got_pubkey && radio.available().is_some() {
            if let Err(end) = self.receive_public_key(radio, keypair) {
                return PairingOutcome::Done(end);
            }
            debug!("pairing L1: received peer public key");
        }

        // L2: answer with our own public key.
        if self.got_pubkey
            && !self.sent_pubkey
            && now_ms.saturating_sub(self.last_attempt_ms) > cfg.pairing_interval_ms
        {
            self.last_attempt_ms = now_ms;
            radio.stop_listening();
            radio.open_writing_pipe(&CONFIG_RX);
            if radio.write(&keypair.public_bytes()) {
                self.sent_pubkey = true;
                debug!("pairing L2: sent public key");
            }
            radio.open_reading_pipe(1, &CONFIG_TX);
            radio.start_listening();
        }

        // L3: the peer's encrypted address decides pair vs unpair.
        if self.sent_pubkey && !self.got_ack && radio.available().is_some() {
            if let Some(addr) = self.read_ack(radio) {
                self.got_ack = true;
                if table.clear_uid(&addr.uid()) {
                    debug!("pairing L3: unpaired {addr}");
                    self.unpair = true;
                } else if addr.pipe() == 0 {
                    warn!("pairing L3: unpair request for unknown peer {addr}");
                    return PairingOutcome::Done(PairingEnd::Aborted);
                } else if let Some(slot) = self.slot {
                    if let Err(err) = table.assign(slot, addr, self.peer_public, keypair) {
                        warn!("pairing L3: {err}");
                        return PairingOutcome::Done(PairingEnd::Aborted);
                    }
                    debug!("pairing L3: stored {addr} in slot {slot}");
                } else {
                    warn!("pairing L3: all slots occupied");
                    return PairingOutcome::Done(PairingEnd::Aborted);
                }
            }
        }

        // L4: acknowledge with our own encrypted address.
        if self.got_ack && !self.sent_ack {
            self.last_attempt_ms = now_ms;
            radio.stop_listening();
            radio.open_writing_pipe(&CONFIG_RX);
            let ack = self.local_ack_address(uid);
            let mut frame = match self.cipher.encrypt(ack.as_bytes()) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("pairing L4: {err}");
                    return PairingOutcome::Done(PairingEnd::Aborted);
                }
            };
            wire::pad(&mut frame, FRAME_SIZE);
            if radio.write(&frame) {
                self.sent_ack = true;
                debug!("pairing L4: acknowledged, exchange complete");
                return PairingOutcome::Done(self.committed_end());
            }
            radio.open_reading_pipe(1, &CONFIG_TX);
            radio.start_listening();
        }

        // Nothing heard for the whole listen window: take the transmit role.
        if !self.got_pubkey && now_ms.saturating_sub(self.started_ms) > cfg.pairing_listen_ms {
            debug!("pairing: escalating to transmit role");
            self.phase = Phase::Transmit;
            radio.stop_listening();
            radio.open_writing_pipe(&CONFIG_TX);
            self.started_ms = now_ms;
        }

        PairingOutcome::Pending
    }

    fn transmit_tick<R: Radio>(
        &mut self,
        radio: &mut R,
        table: &mut PeerTable,
        keypair: &Keypair,
        uid: &Uid,
        cfg: &Config,
        now_ms: u64,
    ) -> PairingOutcome {
        // T1: broadcast our public key until somebody acknowledges it.
        if !self.sent_pubkey
            && now_ms.saturating_sub(self.last_attempt_ms) > cfg.pairing_interval_ms
        {
            self.last_attempt_ms = now_ms;
            radio.stop_listening();
            radio.open_writing_pipe(&CONFIG_TX);
            if radio.write(&keypair.public_bytes()) {
                self.sent_pubkey = true;
                debug!("pairing T1: sent public key");
            }
            radio.open_reading_pipe(1, &CONFIG_RX);
            radio.start_listening();
        }

        // T2: take the peer's key and prepare our encrypted address.
        if self.sent_pubkey && !self.got_pubkey && radio.available().is_some() {
            if let Err(end) = self.receive_public_key(radio, keypair) {
                return PairingOutcome::Done(end);
            }
            debug!("pairing T2: received peer public key");
            let ack = match self.slot {
                Some(slot) => Address::for_slot(slot, uid),
                None => {
                    debug!("pairing T2: table full, requesting unpair");
                    self.unpair = true;
                    Address::unpair(uid)
                }
            };
            self.payload = match self.cipher.encrypt(ack.as_bytes()) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("pairing T2: {err}");
                    return PairingOutcome::Done(PairingEnd::Aborted);
                }
            };
        }

        // T3: send the encrypted address.
        if self.got_pubkey
            && !self.sent_ack
            && now_ms.saturating_sub(self.last_attempt_ms) > cfg.pairing_interval_ms
        {
            self.last_attempt_ms = now_ms;
            radio.stop_listening();
            radio.open_writing_pipe(&CONFIG_TX);
            let mut frame = self.payload.clone();
            wire::pad(&mut frame, FRAME_SIZE);
            if radio.write(&frame) {
                self.sent_ack = true;
                debug!("pairing T3: sent encrypted address");
            }
            radio.open_reading_pipe(1, &CONFIG_RX);
            radio.start_listening();
        }

        // T4: the peer's encrypted answer commits the exchange.
        if self.sent_ack && !self.got_ack && radio.available().is_some() {
            if let Some(addr) = self.read_ack(radio) {
                self.got_ack = true;
                if addr.pipe() == 0 {
                    return PairingOutcome::Done(if table.clear_uid(&addr.uid()) {
                        debug!("pairing T4: unpair of {addr} confirmed");
                        PairingEnd::Unpaired
                    } else {
                        warn!("pairing T4: unpair answer for unknown peer {addr}");
                        PairingEnd::Aborted
                    });
                }
                if self.unpair {
                    warn!("pairing T4: peer ignored our unpair request");
                    return PairingOutcome::Done(PairingEnd::Aborted);
                }
                match self.slot {
                    Some(slot) => {
                        if let Err(err) = table.assign(slot, addr, self.peer_public, keypair) {
                            warn!("pairing T4: {err}");
                            return PairingOutcome::Done(PairingEnd::Aborted);
                        }
                        debug!("pairing T4: stored {addr} in slot {slot}");
                        return PairingOutcome::Done(PairingEnd::Paired(slot));
                    }
                    None => return PairingOutcome::Done(PairingEnd::Aborted),
                }
            }
        }

        PairingOutcome::Pending
    }

    /// Read a 32-byte public-key frame and rekey the transient cipher.
    fn receive_public_key<R: Radio>(
        &mut self,
        radio: &mut R,
        keypair: &Keypair,
    ) -> Result<(), PairingEnd> {
        let mut key = [0u8; KEY_SIZE];
        radio.read(&mut key);
        self.peer_public = key;
        match keypair.shared_key(&key) {
            Ok(shared) => {
                self.cipher.set_key(shared);
                self.got_pubkey = true;
                Ok(())
            }
            Err(err) => {
                warn!("pairing: {err}");
                Err(PairingEnd::Aborted)
            }
        }
    }

    /// Read, unpad, decrypt and validate an encrypted address frame. An
    /// invalid frame is ignored so the exchange keeps waiting.
    fn read_ack<R: Radio>(&mut self, radio: &mut R) -> Option<Address> {
        let mut frame = [0u8; FRAME_SIZE];
        let n = radio.read(&mut frame);
        let mut packet = frame[..n].to_vec();
        wire::unpad(&mut packet);
        let plain = match self.cipher.decrypt(&packet) {
            Ok(plain) => plain,
            Err(err) => {
                debug!("pairing: ack frame rejected: {err}");
                return None;
            }
        };
        match Address::from_bytes(&plain) {
            Ok(addr) => Some(addr),
            Err(err) => {
                debug!("pairing: ack is not a valid address: {err}");
                None
            }
        }
    }

    /// The address we advertise back: pipe `0` for an unpair, otherwise the
    /// pipe of the slot the peer now occupies.
    fn local_ack_address(&self, uid: &Uid) -> Address {
        match (self.unpair, self.slot) {
            (true, _) | (false, None) => Address::unpair(uid),
            (false, Some(slot)) => Address::for_slot(slot, uid),
        }
    }

    fn committed_end(&self) -> PairingEnd {
        if self.unpair {
            PairingEnd::Unpaired
        } else {
            match self.slot {
                Some(slot) => PairingEnd::Paired(slot),
                None => PairingEnd::Aborted,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{MockBus, MockRadio};

    fn setup() -> (MockBus, MockRadio, MockRadio, Config) {
        let bus = MockBus::new();
        let ours = bus.attach();
        let peer = bus.attach();
        (bus, ours, peer, Config::default())
    }

    fn enter_listen(radio: &mut MockRadio, cfg: &Config) {
        radio.set_channel(cfg.config_channel);
        radio.open_reading_pipe(1, &CONFIG_TX);
        radio.start_listening();
    }

    #[test]
    fn listen_side_completes_against_scripted_peer() {
        let (_bus, mut ours, mut peer, cfg) = setup();
        let uid = Uid::new("AAAA");
        let keypair = Keypair::generate(&uid);
        let peer_keypair = Keypair::generate(&Uid::new("BBBB"));
        let mut table = PeerTable::new();
        let mut pairing = Pairing::start(0, &table);
        enter_listen(&mut ours, &cfg);

        // Peer takes the transmit role and sends its public key.
        peer.set_channel(cfg.config_channel);
        peer.open_writing_pipe(&CONFIG_TX);
        assert!(peer.write(&peer_keypair.public_bytes()));
        peer.open_reading_pipe(1, &CONFIG_RX);
        peer.start_listening();

        // L1 consumes the key; L2 waits for the pairing interval.
        assert!(matches!(
            pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 10),
            PairingOutcome::Pending
        ));

        // L2 fires and our key reaches the peer.
        assert!(matches!(
            pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 300),
            PairingOutcome::Pending
        ));
        let mut echoed = [0u8; KEY_SIZE];
        assert_eq!(peer.read(&mut echoed), FRAME_SIZE);
        assert_eq!(echoed, keypair.public_bytes());

        // Peer answers with its encrypted address.
        let shared = peer_keypair.shared_key(&keypair.public_bytes()).unwrap();
        let mut peer_cipher = CipherSession::new(shared);
        let mut frame = peer_cipher.encrypt(b"1BBBB").unwrap();
        wire::pad(&mut frame, FRAME_SIZE);
        peer.open_writing_pipe(&CONFIG_TX);
        assert!(peer.write(&frame));

        // L3 commits the peer, L4 acknowledges and finishes.
        let outcome = pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 600);
        assert!(matches!(
            outcome,
            PairingOutcome::Done(PairingEnd::Paired(0))
        ));
        assert_eq!(
            table.slot(0).unwrap().address(),
            Some(Address::parse("1BBBB").unwrap())
        );

        // The ack we sent decrypts to our slot-0 address.
        let mut ack = [0u8; FRAME_SIZE];
        assert_eq!(peer.read(&mut ack), FRAME_SIZE);
        let mut packet = ack.to_vec();
        wire::unpad(&mut packet);
        assert_eq!(peer_cipher.decrypt(&packet).unwrap(), b"1AAAA");
    }

    #[test]
    fn silent_listener_escalates_to_transmit() {
        let (_bus, mut ours, _peer, cfg) = setup();
        let uid = Uid::new("AAAA");
        let keypair = Keypair::generate(&uid);
        let mut table = PeerTable::new();
        let mut pairing = Pairing::start(0, &table);
        enter_listen(&mut ours, &cfg);

        pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 4999);
        assert_eq!(pairing.phase(), Phase::Listen);
        pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 5001);
        assert_eq!(pairing.phase(), Phase::Transmit);
    }

    #[test]
    fn exchange_times_out() {
        let (_bus, mut ours, _peer, cfg) = setup();
        let uid = Uid::new("AAAA");
        let keypair = Keypair::generate(&uid);
        let mut table = PeerTable::new();
        let mut pairing = Pairing::start(0, &table);
        enter_listen(&mut ours, &cfg);

        // Escalation restarts the clock; the global timeout counts from there.
        pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 5001);
        assert_eq!(pairing.phase(), Phase::Transmit);
        let outcome = pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 15_002);
        assert!(matches!(
            outcome,
            PairingOutcome::Done(PairingEnd::Aborted)
        ));
    }

    #[test]
    fn garbage_ack_keeps_waiting() {
        let (_bus, mut ours, mut peer, cfg) = setup();
        let uid = Uid::new("AAAA");
        let keypair = Keypair::generate(&uid);
        let peer_keypair = Keypair::generate(&Uid::new("BBBB"));
        let mut table = PeerTable::new();
        let mut pairing = Pairing::start(0, &table);
        enter_listen(&mut ours, &cfg);

        peer.set_channel(cfg.config_channel);
        peer.open_writing_pipe(&CONFIG_TX);
        peer.write(&peer_keypair.public_bytes());
        peer.open_reading_pipe(1, &CONFIG_RX);
        peer.start_listening();

        pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 10);
        pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 300);

        // A frame that does not decrypt to a valid address is ignored.
        peer.open_writing_pipe(&CONFIG_TX);
        peer.write(&[0xaau8; FRAME_SIZE]);
        assert!(matches!(
            pairing.tick(&mut ours, &mut table, &keypair, &uid, &cfg, 600),
            PairingOutcome::Pending
        ));
        assert!(table.slot(0).unwrap().is_empty());
    }
}
