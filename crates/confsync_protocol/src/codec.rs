//! JSON codec for protocol messages.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a message as a JSON body.
pub fn encode_json<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decodes a message from a JSON body.
///
/// An empty body is rejected explicitly so callers get a clearer error than
/// serde's "EOF while parsing".
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::Decode("empty body".into()));
    }
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_body_rejected() {
        let result: ProtocolResult<HashMap<String, String>> = decode_json(b"  \n");
        assert!(matches!(result, Err(ProtocolError::Decode(msg)) if msg == "empty body"));
    }

    #[test]
    fn malformed_body_rejected() {
        let result: ProtocolResult<HashMap<String, String>> = decode_json(b"{\"foo\":");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn encode_then_decode_map() {
        let mut map = HashMap::new();
        map.insert("foo".to_string(), "bar".to_string());
        let bytes = encode_json(&map).unwrap();
        let decoded: HashMap<String, String> = decode_json(&bytes).unwrap();
        assert_eq!(decoded, map);
    }
}
