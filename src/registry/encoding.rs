//! Discovery metadata carried in DNS TXT records.
//!
//! Metadata is JSON, zlib-compressed, hex-encoded and split into strings of
//! at most [`TXT_CHUNK_LEN`] characters. Decoding concatenates the strings in
//! order and reverses the pipeline.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::Endpoint;
use crate::{Error, Result};

/// Maximum length of one DNS TXT character-string.
pub const TXT_CHUNK_LEN: usize = 255;

/// Metadata announced for a single node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TxtRecord {
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Methods exposed by the service.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Node metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Encode a record into TXT strings.
pub fn encode(txt: &TxtRecord) -> Result<Vec<String>> {
    let json = serde_json::to_vec(txt)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| Error::Codec(format!("zlib: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Codec(format!("zlib: {e}")))?;

    Ok(chunk(&hex::encode(compressed)))
}

/// Decode TXT strings produced by [`encode`].
pub fn decode<S: AsRef<str>>(fields: &[S]) -> Result<TxtRecord> {
    let encoded: String = fields.iter().map(AsRef::as_ref).collect();

    let compressed = hex::decode(encoded).map_err(|e| Error::Codec(format!("hex: {e}")))?;

    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| Error::Codec(format!("zlib: {e}")))?;

    Ok(serde_json::from_slice(&json)?)
}

/// Split an ASCII string into [`TXT_CHUNK_LEN`]-sized pieces.
pub fn chunk(encoded: &str) -> Vec<String> {
    if encoded.len() <= TXT_CHUNK_LEN {
        return vec![encoded.to_string()];
    }
    encoded
        .as_bytes()
        .chunks(TXT_CHUNK_LEN)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(metadata_len: usize) -> TxtRecord {
        // Pseudo-random filler so zlib cannot squash it.
        let mut seed: u32 = 0x9e37_79b9;
        let filler: String = (0..metadata_len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                char::from(b'a' + (seed % 26) as u8)
            })
            .collect();

        TxtRecord {
            service: "greeter".into(),
            version: "1.0.0".into(),
            endpoints: vec![Endpoint::named("Greeter.Hello")],
            metadata: HashMap::from([("blob".to_string(), filler)]),
        }
    }

    #[test]
    fn roundtrip_single_chunk() {
        let txt = TxtRecord {
            service: "greeter".into(),
            version: "latest".into(),
            ..Default::default()
        };
        let fields = encode(&txt).unwrap();
        assert_eq!(fields.len(), 1);
        assert!(fields[0].len() <= TXT_CHUNK_LEN);
        assert_eq!(decode(&fields).unwrap(), txt);
    }

    #[test]
    fn roundtrip_many_chunks() {
        let txt = record(2_000);
        let fields = encode(&txt).unwrap();
        assert!(fields.len() > 2);
        assert!(fields.iter().all(|f| f.len() <= TXT_CHUNK_LEN));
        assert!(fields[..fields.len() - 1]
            .iter()
            .all(|f| f.len() == TXT_CHUNK_LEN));
        assert_eq!(decode(&fields).unwrap(), txt);
    }

    #[test]
    fn chunk_boundaries() {
        for (len, expected) in [(0, 1), (255, 1), (256, 2), (510, 2), (511, 3)] {
            let s = "f".repeat(len);
            let parts = chunk(&s);
            assert_eq!(parts.len(), expected, "len {len}");
            assert_eq!(parts.concat(), s);
            assert!(parts.iter().all(|p| p.len() <= TXT_CHUNK_LEN));
        }
        let parts = chunk(&"a".repeat(256));
        assert_eq!(parts[0].len(), 255);
        assert_eq!(parts[1].len(), 1);
    }

    #[test]
    fn uses_pascal_case_keys() {
        let txt = record(0);
        let json = serde_json::to_value(&txt).unwrap();
        assert_eq!(json["Service"], "greeter");
        assert_eq!(json["Version"], "1.0.0");
        assert!(json.get("Endpoints").is_some());
    }

    #[test]
    fn corrupt_input_is_rejected() {
        assert!(matches!(decode(&["zz"]), Err(Error::Codec(_))));
        // Valid hex, not zlib.
        assert!(matches!(decode(&["deadbeef"]), Err(Error::Codec(_))));
    }
}
