use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use crate::protocol::UNKNOWN_PAYLOAD;
use crate::types::ScanRecord;

/// Older scanners: raw response bytes, base64 on the wire
pub const V1: u8 = 1;

/// Newer scanners: response already decoded to a string
pub const V2: u8 = 2;

/// A scan result as published by a scanner, before payload decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanMessage {
    pub ip: String,
    pub port: u32,
    pub service: String,
    pub timestamp: i64,
    pub data_version: u8,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unsupported data version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed v{version} payload: {source}")]
    Malformed {
        version: u8,
        #[source]
        source: serde_json::Error,
    },

    #[error("empty v{0} payload")]
    Empty(u8),

    #[error("v1 payload is not valid UTF-8")]
    NotUtf8(#[source] std::string::FromUtf8Error),
}

#[derive(Deserialize)]
struct V1Data {
    #[serde(deserialize_with = "base64_bytes")]
    response_bytes_utf8: Vec<u8>,
}

#[derive(Deserialize)]
struct V2Data {
    response_str: String,
}

fn base64_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// One decoded payload per supported wire version.
/// New formats are added as variants here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPayload {
    V1(Vec<u8>),
    V2(String),
}

impl ScanPayload {
    pub fn parse(version: u8, data: &Value) -> Result<Self, PayloadError> {
        let malformed = |source| PayloadError::Malformed { version, source };
        match version {
            V1 => V1Data::deserialize(data)
                .map(|v1| Self::V1(v1.response_bytes_utf8))
                .map_err(malformed),
            V2 => V2Data::deserialize(data)
                .map(|v2| Self::V2(v2.response_str))
                .map_err(malformed),
            other => Err(PayloadError::UnsupportedVersion(other)),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Self::V1(_) => V1,
            Self::V2(_) => V2,
        }
    }

    /// The response as text. An empty response counts as undecodable.
    pub fn into_text(self) -> Result<String, PayloadError> {
        let version = self.version();
        let text = match self {
            Self::V1(bytes) => String::from_utf8(bytes).map_err(PayloadError::NotUtf8)?,
            Self::V2(text) => text,
        };
        if text.is_empty() {
            return Err(PayloadError::Empty(version));
        }
        Ok(text)
    }
}

/// Decode a versioned payload into its response text.
pub fn decode_payload(version: u8, data: &Value) -> Result<String, PayloadError> {
    ScanPayload::parse(version, data).and_then(ScanPayload::into_text)
}

impl ScanMessage {
    /// Convert into a storable record. A payload that cannot be decoded is
    /// replaced by the "unknown" placeholder; the record is still ingested.
    pub fn into_record(self) -> ScanRecord {
        let data = match decode_payload(self.data_version, &self.data) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    "Undecodable payload for [Service: {}, IP: {}, Port: {}]: {}",
                    self.service,
                    self.ip,
                    self.port,
                    e
                );
                UNKNOWN_PAYLOAD.to_string()
            }
        };

        ScanRecord {
            service: self.service,
            ip: self.ip,
            port: self.port,
            timestamp: self.timestamp,
            version: self.data_version,
            data,
        }
    }
}
