//! The broadcast topic: gossip envelope encoding and topic derivation.
//!
//! Messages are `"<kind>\n" ‖ payload`. Kind `update` carries a signed
//! update's JSON; `request_latest_update` has an empty payload and asks
//! whoever hears it to re-broadcast the newest update they hold.

use ed25519_dalek::VerifyingKey;
use iroh_gossip::proto::TopicId;

pub const KIND_UPDATE: &str = "update";
pub const KIND_REQUEST_LATEST_UPDATE: &str = "request_latest_update";

/// The vault's broadcast topic is derived from the master public key, so
/// every bound device lands on the same topic without coordination.
pub fn topic_id(master_pub: &VerifyingKey) -> TopicId {
    TopicId::from_bytes(master_pub.to_bytes())
}

/// Frame a broadcast message.
pub fn encode_envelope(kind: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(kind.len() + 1 + payload.len());
    out.extend_from_slice(kind.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

/// Split a broadcast message into kind and payload. `None` for frames
/// without a newline or a non-UTF-8 kind.
pub fn parse_envelope(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let pos = bytes.iter().position(|&b| b == b'\n')?;
    let kind = std::str::from_utf8(&bytes[..pos]).ok()?;
    Some((kind, &bytes[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let framed = encode_envelope(KIND_UPDATE, b"{\"update\":\"...\"}");
        let (kind, payload) = parse_envelope(&framed).unwrap();
        assert_eq!(kind, KIND_UPDATE);
        assert_eq!(payload, b"{\"update\":\"...\"}");
    }

    #[test]
    fn empty_payload_envelope() {
        let framed = encode_envelope(KIND_REQUEST_LATEST_UPDATE, b"");
        let (kind, payload) = parse_envelope(&framed).unwrap();
        assert_eq!(kind, KIND_REQUEST_LATEST_UPDATE);
        assert!(payload.is_empty());
    }

    #[test]
    fn missing_newline_is_rejected() {
        assert!(parse_envelope(b"no-newline-here").is_none());
    }
}
