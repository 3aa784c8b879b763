//! Configuration document: JSON export/import of the paired-device table and
//! the personal keypair. `"0"` marks an empty slot; keys travel as standard
//! padded base64. Older firmware exported the device list as a JSON-encoded
//! string inside the document, so import accepts both the nested object and
//! the string form.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::identity::{Address, AddressError, Keypair, KEY_SIZE};
use crate::peers::{PeerTable, TableError, MAX_PEERS};

/// Configuration document failure.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 key: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("keys must be {KEY_SIZE} bytes")]
    KeyLength,
    #[error(transparent)]
    Addr(#[from] AddressError),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Serialize, Deserialize)]
struct DeviceList {
    addr: Vec<String>,
    #[serde(rename = "pubKey", default, skip_serializing_if = "Option::is_none")]
    pub_key: Option<Vec<Option<String>>>,
}

#[derive(Serialize, Deserialize)]
struct PersonalKeys {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKey")]
    private_key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DevicesField {
    Nested(DeviceList),
    Encoded(String),
}

#[derive(Serialize, Deserialize)]
struct ConfigDoc {
    #[serde(rename = "pairedDevices", default, skip_serializing_if = "Option::is_none")]
    paired_devices: Option<DevicesField>,
    #[serde(rename = "personalKeys", default, skip_serializing_if = "Option::is_none")]
    personal_keys: Option<PersonalKeys>,
}

fn device_list(table: &PeerTable, include_keys: bool) -> DeviceList {
    let mut addrs = Vec::with_capacity(MAX_PEERS);
    let mut keys = Vec::with_capacity(MAX_PEERS);
    for slot in table.iter() {
        match slot.address() {
            Some(addr) => {
                addrs.push(addr.to_string());
                keys.push(Some(STANDARD.encode(slot.public_key())));
            }
            None => {
                addrs.push("0".to_string());
                keys.push(None);
            }
        }
    }
    DeviceList {
        addr: addrs,
        pub_key: include_keys.then_some(keys),
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_SIZE], PersistError> {
    let bytes = STANDARD.decode(encoded)?;
    bytes.try_into().map_err(|_| PersistError::KeyLength)
}

fn apply_devices(
    list: &DeviceList,
    table: &mut PeerTable,
    keypair: &Keypair,
) -> Result<(), PersistError> {
    for slot in 0..MAX_PEERS {
        let Some(entry) = list.addr.get(slot) else {
            continue;
        };
        if entry == "0" {
            table.clear(slot);
            continue;
        }
        let addr = Address::parse(entry)?;
        let key = list
            .pub_key
            .as_ref()
            .and_then(|keys| keys.get(slot))
            .and_then(|k| k.as_deref());
        match key {
            Some(k) => table.assign(slot, addr, decode_key(k)?, keypair)?,
            None => table.assign_addr_only(slot, addr)?,
        }
    }
    Ok(())
}

/// Serialize just the paired-device list.
pub fn export_devices(table: &PeerTable, include_keys: bool) -> Result<String, PersistError> {
    Ok(serde_json::to_string(&device_list(table, include_keys))?)
}

/// Apply a paired-device list. Slot indices in the document are canonical;
/// shared keys are re-derived from the stored public keys.
pub fn import_devices(
    json: &str,
    table: &mut PeerTable,
    keypair: &Keypair,
) -> Result<(), PersistError> {
    let list: DeviceList = serde_json::from_str(json)?;
    apply_devices(&list, table, keypair)
}

/// Serialize the full configuration document.
pub fn export_config(
    table: &PeerTable,
    keypair: &Keypair,
    include_keys: bool,
) -> Result<String, PersistError> {
    let doc = ConfigDoc {
        paired_devices: Some(DevicesField::Nested(device_list(table, include_keys))),
        personal_keys: Some(PersonalKeys {
            public_key: STANDARD.encode(keypair.public_bytes()),
            private_key: STANDARD.encode(keypair.secret_bytes()),
        }),
    };
    Ok(serde_json::to_string(&doc)?)
}

/// Apply a full configuration document. Personal keys are installed first so
/// the device list re-derives its shared keys against the imported secret.
pub fn import_config(
    json: &str,
    table: &mut PeerTable,
    keypair: &mut Keypair,
) -> Result<(), PersistError> {
    let doc: ConfigDoc = serde_json::from_str(json)?;
    if let Some(keys) = &doc.personal_keys {
        let secret = decode_key(&keys.private_key)?;
        *keypair = Keypair::from_secret_bytes(secret);
    }
    if let Some(devices) = &doc.paired_devices {
        let nested;
        let list = match devices {
            DevicesField::Nested(list) => list,
            DevicesField::Encoded(s) => {
                nested = serde_json::from_str::<DeviceList>(s)?;
                &nested
            }
        };
        apply_devices(list, table, keypair)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Uid;

    fn populated() -> (PeerTable, Keypair) {
        let keypair = Keypair::generate(&Uid::new("AAAA"));
        let mut table = PeerTable::new();
        let peer_b = Keypair::generate(&Uid::new("BBBB"));
        let peer_c = Keypair::generate(&Uid::new("CCCC"));
        table
            .assign(0, Address::parse("1BBBB").unwrap(), peer_b.public_bytes(), &keypair)
            .unwrap();
        table
            .assign(2, Address::parse("3CCCC").unwrap(), peer_c.public_bytes(), &keypair)
            .unwrap();
        (table, keypair)
    }

    #[test]
    fn full_round_trip_restores_shared_keys() {
        let (table, mut keypair) = populated();
        let shared_before = *table.slot(0).unwrap().shared_key();
        let json = export_config(&table, &keypair, true).unwrap();

        let mut restored = PeerTable::new();
        import_config(&json, &mut restored, &mut keypair).unwrap();

        assert_eq!(
            restored.slot(0).unwrap().address(),
            Some(Address::parse("1BBBB").unwrap())
        );
        assert!(restored.slot(1).unwrap().is_empty());
        assert_eq!(*restored.slot(0).unwrap().shared_key(), shared_before);
    }

    #[test]
    fn empty_slots_export_as_zero() {
        let (table, keypair) = populated();
        let json = export_devices(&table, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["addr"][1], "0");
        assert_eq!(value["addr"][0], "1BBBB");
        assert!(value["pubKey"][1].is_null());
        assert!(value["pubKey"][0].is_string());
    }

    #[test]
    fn keys_omitted_when_not_requested() {
        let (table, _) = populated();
        let json = export_devices(&table, false).unwrap();
        assert!(!json.contains("pubKey"));
    }

    #[test]
    fn import_without_keys_assigns_address_only() {
        let keypair = Keypair::generate(&Uid::new("AAAA"));
        let mut table = PeerTable::new();
        import_devices(
            r#"{"addr":["1BBBB","0","0","0","0"]}"#,
            &mut table,
            &keypair,
        )
        .unwrap();
        let slot = table.slot(0).unwrap();
        assert_eq!(slot.address(), Some(Address::parse("1BBBB").unwrap()));
        assert_eq!(*slot.shared_key(), [0u8; KEY_SIZE]);
    }

    #[test]
    fn import_accepts_string_encoded_device_list() {
        let (table, mut keypair) = populated();
        let inner = export_devices(&table, true).unwrap();
        let doc = serde_json::json!({ "pairedDevices": inner }).to_string();

        let mut restored = PeerTable::new();
        import_config(&doc, &mut restored, &mut keypair).unwrap();
        assert_eq!(
            restored.slot(2).unwrap().address(),
            Some(Address::parse("3CCCC").unwrap())
        );
    }

    #[test]
    fn import_zero_clears_existing_slot() {
        let (mut table, mut keypair) = populated();
        import_config(
            r#"{"pairedDevices":{"addr":["0","0","0","0","0"]}}"#,
            &mut table,
            &mut keypair,
        )
        .unwrap();
        assert!(table.iter().all(|s| s.is_empty()));
    }

    #[test]
    fn personal_keys_round_trip() {
        let (table, keypair) = populated();
        let json = export_config(&table, &keypair, true).unwrap();
        let mut fresh = Keypair::generate(&Uid::new("ZZZZ"));
        let mut fresh_table = PeerTable::new();
        import_config(&json, &mut fresh_table, &mut fresh).unwrap();
        assert_eq!(fresh.public_bytes(), keypair.public_bytes());
        assert_eq!(fresh.secret_bytes(), keypair.secret_bytes());
    }

    #[test]
    fn malformed_document_is_rejected() {
        let keypair = Keypair::generate(&Uid::new("AAAA"));
        let mut table = PeerTable::new();
        assert!(import_devices("not json", &mut table, &keypair).is_err());
        assert!(import_devices(
            r#"{"addr":["9QQQQ","0","0","0","0"]}"#,
            &mut table,
            &keypair
        )
        .is_err());
    }
}
