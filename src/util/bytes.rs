//! Serde adapter for byte payloads stored in JSON records.
//!
//! Payloads are arbitrary bytes, so they are written as standard base64
//! strings rather than JSON arrays of numbers.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

pub fn serialize<S>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(value))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(|err| D::Error::custom(format!("invalid base64 payload: {err}")))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        #[serde(with = "crate::util::bytes")]
        data: Bytes,
    }

    #[test]
    fn payload_is_written_as_base64() {
        let record = Record {
            data: Bytes::from_static(b"hello"),
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert_eq!(json, r#"{"data":"aGVsbG8="}"#);
    }

    #[test]
    fn rejects_invalid_base64() {
        let result = serde_json::from_str::<Record>(r#"{"data":"***"}"#);
        assert!(result.is_err());
    }
}
