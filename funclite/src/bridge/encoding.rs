//! Named encodings used when strings and bytes cross the bridge.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use funclite_shared::{FuncliteError, FuncliteResult};

/// Decode a guest string into bytes under a named encoding.
pub fn decode_string(data: &str, encoding: &str) -> FuncliteResult<Vec<u8>> {
    match canonical(encoding)? {
        Enc::Utf8 => Ok(data.as_bytes().to_vec()),
        Enc::Base64 => BASE64
            .decode(data.trim())
            .map_err(|_| FuncliteError::InvalidArgument("invalid base64 data".into())),
        Enc::Hex => hex::decode(data.trim())
            .map_err(|_| FuncliteError::InvalidArgument("invalid hex data".into())),
        Enc::Latin1 => Ok(data.chars().map(|c| (c as u32 & 0xff) as u8).collect()),
        Enc::Ascii => Ok(data.chars().map(|c| (c as u32 & 0x7f) as u8).collect()),
    }
}

/// Encode bytes into a guest string under a named encoding.
pub fn encode_bytes(bytes: &[u8], encoding: &str) -> FuncliteResult<String> {
    match canonical(encoding)? {
        Enc::Utf8 => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Enc::Base64 => Ok(BASE64.encode(bytes)),
        Enc::Hex => Ok(hex::encode(bytes)),
        Enc::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        Enc::Ascii => Ok(bytes.iter().map(|&b| (b & 0x7f) as char).collect()),
    }
}

#[derive(Clone, Copy)]
enum Enc {
    Utf8,
    Base64,
    Hex,
    Latin1,
    Ascii,
}

fn canonical(encoding: &str) -> FuncliteResult<Enc> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(Enc::Utf8),
        "base64" => Ok(Enc::Base64),
        "hex" => Ok(Enc::Hex),
        "latin1" | "binary" => Ok(Enc::Latin1),
        "ascii" => Ok(Enc::Ascii),
        other => Err(FuncliteError::InvalidArgument(format!(
            "unknown encoding: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_and_hex_round_trip() {
        let bytes = b"funclite\x00\xff";
        let b64 = encode_bytes(bytes, "base64").unwrap();
        assert_eq!(decode_string(&b64, "base64").unwrap(), bytes);
        let hexed = encode_bytes(bytes, "hex").unwrap();
        assert_eq!(decode_string(&hexed, "hex").unwrap(), bytes);
    }

    #[test]
    fn latin1_preserves_high_bytes() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let s = encode_bytes(&bytes, "latin1").unwrap();
        assert_eq!(decode_string(&s, "binary").unwrap(), bytes);
    }

    #[test]
    fn unknown_encoding_is_invalid_argument() {
        assert!(decode_string("x", "utf-16le").is_err());
        assert!(encode_bytes(b"x", "wat").is_err());
    }
}
