//! Shared wire encoding helpers.
//!
//! All protocol bodies are JSON; raw byte fields travel as base64 strings,
//! matching the update log's canonical encoding.

/// Base64 (standard alphabet, padded) helpers.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::{DecodeError, Engine};

    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
        STANDARD.decode(s)
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::b64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::b64::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "super::base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn bytes_roundtrip_as_base64() {
        let probe = Probe {
            data: vec![0, 1, 2, 0xff],
        };
        let json = serde_json::to_string(&probe).unwrap();
        assert_eq!(json, r#"{"data":"AAEC/w=="}"#);
        let back: Probe = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, probe.data);
    }
}
