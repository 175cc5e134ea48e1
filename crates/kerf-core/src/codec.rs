//! CBOR encode/decode helpers for the kerf wire types.
//!
//! Every websocket message carries exactly one CBOR value (a transport
//! frame before encryption, an envelope inside a reassembled message),
//! so no length prefix is needed.

use crate::error::KerfResult;
use std::io::Cursor;

/// Encode a serializable value into CBOR bytes.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> KerfResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode CBOR bytes into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> KerfResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}
