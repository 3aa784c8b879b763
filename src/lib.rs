//! Pairing and encrypted messaging engine for short-packet radios.
//! Host-driven: the engine owns the radio behind the [`Radio`] trait and is
//! advanced from the host's main loop via [`ChirpCore::tick`].
//!
//! The target hardware speaks fixed 32-byte frames with up to five reading
//! pipes addressed by 5-byte labels and a hardware auto-ACK, nRF24 style.
//! On top of that the engine provides dynamic pairing (X25519 key exchange
//! with listen/transmit role escalation on a dedicated config channel),
//! encrypted fragmented transport with per-peer anti-replay counters, and a
//! bounded FIFO mailbox per paired peer.
//!
//! ## Host responsibilities
//!
//! - **Driver**: implement [`Radio`] over the real transceiver. The engine
//!   never touches hardware directly; [`MockBus`] ships for hosts and tests
//!   without one.
//! - **Time**: pass a monotonic millisecond timestamp into [`ChirpCore::tick`]
//!   and the other timestamped calls.
//! - **Persistence**: store the configuration document from
//!   [`ChirpCore::export_config`] and replay it through
//!   [`ChirpCore::import_config`] after a reboot. Replay counters are not
//!   persisted, so a reboot reopens a replay window for frames recorded
//!   before it.

pub mod cipher;
pub mod config;
pub mod core;
pub mod identity;
pub mod pairing;
pub mod peers;
pub mod persist;
pub mod radio;
pub mod transport;
pub mod wire;

pub use crate::cipher::{CipherError, CipherSession};
pub use crate::config::Config;
pub use crate::core::{ChirpCore, PairError, SendError, State};
pub use crate::identity::{Address, AddressError, KeyAgreementError, Keypair, Uid};
pub use crate::peers::{PeerSlot, PeerTable, MAX_MAILBOX, MAX_PEERS};
pub use crate::persist::PersistError;
pub use crate::radio::{DataRate, MockBus, MockRadio, PaLevel, Radio};
pub use crate::transport::{SendHandle, SendStatus, MAX_MSG_SIZE};
