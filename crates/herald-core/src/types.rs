use serde::{Deserialize, Serialize};

/// Bound on previous ratchet states retained per peer device.
pub const MAX_PREVIOUS_SESSIONS: usize = 10;
/// Bound on skipped message keys retained per session.
pub const MAX_SKIP: u64 = 1000;
/// Bound on buffered out-of-order sync records per source device.
pub const SYNC_REORDER_LIMIT: usize = 64;
/// One-time pre-key pool is replenished below this count.
pub const MIN_PRE_KEYS: u32 = 20;
/// Verification codes and provisioning handshakes expire after this window.
pub const VERIFICATION_WINDOW_SECS: u64 = 300;

/// A peer device address: stable account identity plus per-device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub peer: String,
    pub device_id: u32,
}

impl Address {
    pub fn new(peer: impl Into<String>, device_id: u32) -> Self {
        Self {
            peer: peer.into(),
            device_id,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.peer, self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationState {
    Unregistered,
    Registered,
    LinkedDevice,
}

/// A secondary device sharing the account identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedDevice {
    pub device_id: u32,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<u64>,
}

pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) mod serde_bytes_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("expected 32 bytes"));
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(array)
    }
}

pub(crate) mod serde_option_bytes_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_str(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                if bytes.len() != 32 {
                    return Err(serde::de::Error::custom("expected 32 bytes"));
                }
                let mut array = [0u8; 32];
                array.copy_from_slice(&bytes);
                Ok(Some(array))
            }
            None => Ok(None),
        }
    }
}

pub(crate) mod serde_hashmap_u64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(map: &HashMap<u64, [u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map_serializer = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            map_serializer.serialize_entry(k, &hex::encode(v))?;
        }
        map_serializer.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<u64, [u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: HashMap<u64, String> = HashMap::deserialize(deserializer)?;
        map.into_iter()
            .map(|(k, v)| {
                let bytes = hex::decode(&v).map_err(serde::de::Error::custom)?;
                if bytes.len() != 32 {
                    return Err(serde::de::Error::custom("expected 32 bytes"));
                }
                let mut array = [0u8; 32];
                array.copy_from_slice(&bytes);
                Ok((k, array))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_joins_peer_and_device() {
        let addr = Address::new("+15550100", 2);
        assert_eq!(addr.to_string(), "+15550100.2");
    }

    #[test]
    fn address_serializes_with_camel_case() {
        let addr = Address::new("alice", 1);
        let json = serde_json::to_string(&addr).unwrap();
        assert!(json.contains("\"deviceId\""));
        assert!(!json.contains("\"device_id\""));
    }

    #[test]
    fn linked_device_omits_absent_last_sync() {
        let device = LinkedDevice {
            device_id: 2,
            created_at: 1700000000,
            last_sync: None,
        };
        let json = serde_json::to_string(&device).unwrap();
        assert!(!json.contains("lastSync"));
    }
}
