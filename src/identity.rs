//! Node identity: 4-character UID, 5-byte pipe addresses, X25519 keypair.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Key material size for X25519 keys and the derived session key.
pub const KEY_SIZE: usize = 32;

/// Length of a node UID in ASCII bytes.
pub const UID_LEN: usize = 4;

/// Length of an on-air address: one pipe digit followed by a UID.
pub const ADDR_LEN: usize = 5;

/// Fixed 4-character alphanumeric node identifier.
///
/// Supplied ids shorter than 4 bytes are left-padded with `'0'`; longer ids
/// are truncated to their first 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uid([u8; UID_LEN]);

impl Uid {
    /// Normalize an arbitrary id string into a 4-byte UID.
    pub fn new(id: &str) -> Self {
        let mut uid = [b'0'; UID_LEN];
        let bytes = id.as_bytes();
        let take = bytes.len().min(UID_LEN);
        // Short ids are left-padded; long ids keep their first four bytes.
        uid[UID_LEN - take..].copy_from_slice(&bytes[..take]);
        Uid(uid)
    }

    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// A malformed on-air address.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must be {ADDR_LEN} bytes")]
    BadLength,
    #[error("pipe digit must be '0'..'5'")]
    BadPipe,
    #[error("uid characters must be alphanumeric")]
    BadUid,
}

/// On-air address: a pipe digit `'0'..'5'` followed by the owning node's UID.
///
/// Pipe `'0'` never identifies a live slot; it is the unpair marker in the
/// pairing exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address([u8; ADDR_LEN]);

impl Address {
    /// Validate and wrap a 5-byte address.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != ADDR_LEN {
            return Err(AddressError::BadLength);
        }
        if !(b'0'..=b'5').contains(&bytes[0]) {
            return Err(AddressError::BadPipe);
        }
        if !bytes[1..].iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(AddressError::BadUid);
        }
        let mut addr = [0u8; ADDR_LEN];
        addr.copy_from_slice(bytes);
        Ok(Address(addr))
    }

    pub fn parse(s: &str) -> Result<Self, AddressError> {
        Self::from_bytes(s.as_bytes())
    }

    /// The address slot `slot` advertises to its peer: `(slot + 1) || uid`.
    pub fn for_slot(slot: usize, uid: &Uid) -> Self {
        let mut addr = [0u8; ADDR_LEN];
        addr[0] = b'1' + slot as u8;
        addr[1..].copy_from_slice(uid.as_bytes());
        Address(addr)
    }

    /// The unpair-request address: pipe digit `'0'` followed by our UID.
    pub fn unpair(uid: &Uid) -> Self {
        let mut addr = [b'0'; ADDR_LEN];
        addr[1..].copy_from_slice(uid.as_bytes());
        Address(addr)
    }

    /// Numeric pipe value of the leading digit (0..=5).
    pub fn pipe(&self) -> u8 {
        self.0[0] - b'0'
    }

    /// The 4-character UID tail.
    pub fn uid(&self) -> Uid {
        let mut uid = [0u8; UID_LEN];
        uid.copy_from_slice(&self.0[1..]);
        Uid(uid)
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// The X25519 agreement produced a non-contributory (all-zero) shared secret.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("key agreement produced a non-contributory shared secret")]
pub struct KeyAgreementError;

/// Long-lived X25519 keypair. The secret never leaves this type except
/// through [`Keypair::secret_bytes`] for configuration export.
pub struct Keypair {
    secret: StaticSecret,
    public: [u8; KEY_SIZE],
}

impl Keypair {
    /// Generate a fresh keypair.
    ///
    /// The seed mixes OS entropy with the local UID, so nodes with distinct
    /// UIDs derive distinct keys even under correlated entropy.
    pub fn generate(uid: &Uid) -> Self {
        let mut entropy = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut entropy);
        let mut hasher = Sha256::new();
        hasher.update(b"chirplink-keygen-v1");
        hasher.update(entropy);
        hasher.update(uid.as_bytes());
        let seed: [u8; KEY_SIZE] = hasher.finalize().into();
        Self::from_secret_bytes(seed)
    }

    /// Rebuild a keypair from a stored secret. The public key is re-derived.
    pub fn from_secret_bytes(secret: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public
    }

    pub fn secret_bytes(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Raw X25519 shared secret with a peer's public key, used directly as
    /// the pairwise session key. Deterministic for a given pair of keypairs.
    pub fn shared_key(&self, peer_public: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE], KeyAgreementError> {
        let peer = X25519PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(KeyAgreementError);
        }
        Ok(shared.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_normalization() {
        assert_eq!(Uid::new("X2d8").as_bytes(), b"X2d8");
        assert_eq!(Uid::new("ab").as_bytes(), b"00ab");
        assert_eq!(Uid::new("").as_bytes(), b"0000");
        assert_eq!(Uid::new("LONGID").as_bytes(), b"LONG");
    }

    #[test]
    fn address_round_trip() {
        let addr = Address::parse("1X2d8").unwrap();
        assert_eq!(addr.pipe(), 1);
        assert_eq!(addr.uid().as_bytes(), b"X2d8");
        assert_eq!(addr.to_string(), "1X2d8");
    }

    #[test]
    fn address_for_slot_and_unpair() {
        let uid = Uid::new("AAAA");
        assert_eq!(Address::for_slot(0, &uid).as_bytes(), b"1AAAA");
        assert_eq!(Address::for_slot(4, &uid).as_bytes(), b"5AAAA");
        assert_eq!(Address::unpair(&uid).as_bytes(), b"0AAAA");
    }

    #[test]
    fn address_validation() {
        assert_eq!(Address::parse("12345").unwrap().pipe(), 1);
        assert_eq!(Address::parse("6AAAA"), Err(AddressError::BadPipe));
        assert_eq!(Address::parse("1AA!A"), Err(AddressError::BadUid));
        assert_eq!(Address::parse("1AAA"), Err(AddressError::BadLength));
        assert_eq!(Address::parse("1AAAAA"), Err(AddressError::BadLength));
        assert_eq!(Address::parse("0zzzz").unwrap().pipe(), 0);
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate(&Uid::new("AAAA"));
        let b = Keypair::generate(&Uid::new("BBBB"));
        let shared_a = a.shared_key(&b.public_bytes()).unwrap();
        let shared_b = b.shared_key(&a.public_bytes()).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn shared_key_deterministic() {
        let a = Keypair::generate(&Uid::new("AAAA"));
        let b = Keypair::generate(&Uid::new("BBBB"));
        let first = a.shared_key(&b.public_bytes()).unwrap();
        let second = a.shared_key(&b.public_bytes()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn keypair_import_rederives_public() {
        let kp = Keypair::generate(&Uid::new("AAAA"));
        let restored = Keypair::from_secret_bytes(kp.secret_bytes());
        assert_eq!(restored.public_bytes(), kp.public_bytes());
    }

    #[test]
    fn low_order_peer_rejected() {
        let kp = Keypair::generate(&Uid::new("AAAA"));
        assert_eq!(kp.shared_key(&[0u8; KEY_SIZE]), Err(KeyAgreementError));
    }
}
