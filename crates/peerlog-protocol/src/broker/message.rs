use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Payload of a relay envelope exchanged by brokers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BrokerMessage {
    /// Transport signaling data; `initiator` is the sender's role.
    Signal { initiator: bool, data: Bytes },
}

impl BrokerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_carries_type_tag() {
        let msg = BrokerMessage::Signal {
            initiator: true,
            data: Bytes::from_static(b"offer"),
        };
        let bytes = msg.to_bytes().unwrap();
        // Named encoding keeps the tag and field names on the wire.
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("type"));
        assert!(text.contains("signal"));
        assert!(text.contains("initiator"));
        assert_eq!(BrokerMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_type_is_rejected() {
        #[derive(Serialize)]
        struct Other {
            r#type: &'static str,
        }
        let bytes = rmp_serde::to_vec_named(&Other { r#type: "hello" }).unwrap();
        assert!(matches!(
            BrokerMessage::from_bytes(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));
    }
}
