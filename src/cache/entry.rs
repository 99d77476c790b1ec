//! Stored response representation and its MessagePack encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::{Response, StatusCode, http::Recorded};

/// A captured response as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CacheEntry {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StoreError> {
        rmp_serde::from_slice(raw).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Rebuilds the response exactly as it was captured.
    pub fn into_response(self) -> Result<Response, StoreError> {
        let status = StatusCode::from_u16(self.status)
            .ok_or_else(|| StoreError::Codec(format!("unknown status code {}", self.status)))?;
        let mut response = Response::new(status).body_bytes(self.body);
        for (name, value) in self.headers {
            response.add_header(name, value);
        }
        Ok(response)
    }
}

impl From<Recorded> for CacheEntry {
    fn from(recorded: Recorded) -> Self {
        let body = recorded.body();
        Self {
            status: recorded.status.as_u16(),
            headers: Vec::from(recorded.headers),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::sink::mirror;

    #[test]
    fn entry_survives_the_codec_byte_for_byte() {
        let original = Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .header("Set-Cookie", "a=1")
            .header("Set-Cookie", "b=2")
            .body_bytes(vec![0_u8, 159, 146, 150, 255]);
        let (_, recorded) = mirror(original.clone());

        let raw = CacheEntry::from(recorded).encode().unwrap();
        let restored = CacheEntry::decode(&raw).unwrap().into_response().unwrap();

        assert_eq!(restored.status(), original.status());
        assert_eq!(restored.headers(), original.headers());
        assert_eq!(restored.body_ref(), original.body_ref());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            CacheEntry::decode(b"\xc1not msgpack"),
            Err(StoreError::Codec(_))
        ));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let entry = CacheEntry {
            status: 299,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        assert!(matches!(entry.into_response(), Err(StoreError::Codec(_))));
    }
}
