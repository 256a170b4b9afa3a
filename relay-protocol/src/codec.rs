//! JSON text encoding for envelopes.
//!
//! One envelope per transport message; framing belongs to the transport.

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::MAX_ENVELOPE_SIZE;

/// Encodes envelopes into JSON text.
pub struct Encoder;

impl Encoder {
    /// Encodes an envelope.
    pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(envelope)?;
        check_size(text.len())?;
        Ok(text)
    }
}

/// Decodes envelopes from JSON text or UTF-8 bytes.
pub struct Decoder;

impl Decoder {
    /// Decodes an envelope from text.
    pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
        check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }

    /// Decodes an envelope from bytes, which must be UTF-8.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::decode(text)
    }
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge {
            size,
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decode_command() {
        let env = Decoder::decode(r#"{"name":"message subscribe","data":{"roomId":"R1"}}"#).unwrap();
        assert_eq!(env.name(), "message subscribe");
        assert_eq!(env.data()["roomId"], "R1");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Decoder::decode("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            Decoder::decode(r#"["room add"]"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(matches!(
            Decoder::decode_bytes(&[0xff, 0xfe, 0x00]),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_decode_unknown_fields_tolerated() {
        let env = Decoder::decode(r#"{"name":"room add","data":null,"id":42}"#).unwrap();
        assert_eq!(env.name(), "room add");
    }

    #[test]
    fn test_encode_too_large() {
        let env = Envelope::new("message add", json!({"body": "x".repeat(MAX_ENVELOPE_SIZE)}));
        assert!(matches!(
            Encoder::encode(&env),
            Err(ProtocolError::EnvelopeTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_too_large() {
        let text = format!(
            r#"{{"name":"message add","data":"{}"}}"#,
            "x".repeat(MAX_ENVELOPE_SIZE)
        );
        assert!(matches!(
            Decoder::decode(&text),
            Err(ProtocolError::EnvelopeTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_any_name_and_string_payload_survive(name in ".{0,64}", body in ".{0,256}") {
            let env = Envelope::new(name, json!({"body": body}));
            let text = Encoder::encode(&env).unwrap();
            prop_assert_eq!(Decoder::decode(&text).unwrap(), env);
        }
    }
}
