use serde::{Deserialize, Serialize};

use super::messages::WireMessage;
use crate::error::Result;

/// Byte encoding used on the transport. Every robot in a team must use the
/// same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Compact binary.
    Postcard,
    /// Human-readable; convenient when sniffing traffic.
    #[default]
    Json,
}

impl WireFormat {
    pub fn encode(self, message: &WireMessage) -> Result<Vec<u8>> {
        Ok(match self {
            WireFormat::Postcard => postcard::to_allocvec(message)?,
            WireFormat::Json => serde_json::to_vec(message)?,
        })
    }

    pub fn decode(self, bytes: &[u8]) -> Result<WireMessage> {
        Ok(match self {
            WireFormat::Postcard => postcard::from_bytes(bytes)?,
            WireFormat::Json => serde_json::from_slice(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoopClosingError;
    use crate::exchange::messages::{MeasurementKind, MeasurementMsg};
    use crate::geometry::Sim3;

    fn measurement() -> WireMessage {
        WireMessage::Measurement(MeasurementMsg::new(
            2,
            MeasurementKind::Odometry,
            10,
            11,
            &Sim3::identity(),
        ))
    }

    #[test]
    fn test_both_formats_decode_what_they_encode() {
        for format in [WireFormat::Postcard, WireFormat::Json] {
            let bytes = format.encode(&measurement()).unwrap();
            assert_eq!(format.decode(&bytes).unwrap(), measurement());
        }
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = WireFormat::Json.decode(b"{not json").unwrap_err();
        assert!(matches!(err, LoopClosingError::Serialization(_)));
    }
}
