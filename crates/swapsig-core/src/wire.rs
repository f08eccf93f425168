//! Canonical binary wire codec.
//!
//! Every protocol message carries `{protocol, type, from, to?, payload, timestamp,
//! messageId}`. Field encoding is fixed: curve points are 33-byte compressed form
//! (prefix 0x02/0x03), scalars are 32-byte big-endian, and byte strings/messages are
//! length-prefixed. No message may exceed [`MAX_MESSAGE_SIZE`].

use bitcoin::secp256k1::PublicKey;
use thiserror::Error;

/// Hard size cap for any encoded wire message. Exceeding it is an `Oversized` error,
/// which in `swapsig-security` additionally triggers the peer-ban path.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated while decoding {0}")]
    Truncated(&'static str),
    #[error("compressed point has wrong prefix byte {0:#04x}")]
    WrongPointPrefix(u8),
    #[error("invalid curve point encoding: {0}")]
    InvalidPoint(String),
    #[error("message exceeds {MAX_MESSAGE_SIZE} byte cap: got {0}")]
    Oversized(usize),
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("length prefix {0} exceeds remaining buffer")]
    LengthOverrun(u32),
}

/// Encode a compressed secp256k1 point: 33 bytes, first byte 0x02 or 0x03.
pub fn encode_point(point: &PublicKey) -> [u8; 33] {
    point.serialize()
}

/// Decode a compressed secp256k1 point, validating length and prefix byte.
pub fn decode_point(bytes: &[u8]) -> Result<PublicKey, WireError> {
    if bytes.len() != 33 {
        return Err(WireError::Truncated("compressed point"));
    }
    match bytes[0] {
        0x02 | 0x03 => {}
        other => return Err(WireError::WrongPointPrefix(other)),
    }
    PublicKey::from_slice(bytes).map_err(|e| WireError::InvalidPoint(e.to_string()))
}

/// Encode a 32-byte big-endian scalar, zero-padding on the left if shorter.
pub fn encode_scalar(scalar: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let start = 32usize.saturating_sub(scalar.len());
    out[start..].copy_from_slice(&scalar[scalar.len().saturating_sub(32)..]);
    out
}

/// Append a length-prefixed (u32 LE) byte string to `buf`.
pub fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

/// Read a length-prefixed byte string starting at `*cursor`, advancing it.
pub fn read_bytes<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], WireError> {
    if buf.len() < *cursor + 4 {
        return Err(WireError::Truncated("length prefix"));
    }
    let len = u32::from_le_bytes(buf[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    let len = len as usize;
    if buf.len() < *cursor + len {
        return Err(WireError::LengthOverrun(len as u32));
    }
    let data = &buf[*cursor..*cursor + len];
    *cursor += len;
    Ok(data)
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_bytes(buf, s.as_bytes());
}

fn read_str<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a str, WireError> {
    let bytes = read_bytes(buf, cursor)?;
    std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
}

/// The envelope every protocol message travels in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub protocol: String,
    pub msg_type: String,
    pub from: String,
    pub to: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub message_id: String,
}

impl WireMessage {
    /// Serialize to the canonical byte encoding. Deterministic: same fields always
    /// produce the same bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        write_str(&mut buf, &self.protocol);
        write_str(&mut buf, &self.msg_type);
        write_str(&mut buf, &self.from);
        match &self.to {
            Some(to) => {
                buf.push(1);
                write_str(&mut buf, to);
            }
            None => buf.push(0),
        }
        write_bytes(&mut buf, &self.payload);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        write_str(&mut buf, &self.message_id);

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized(buf.len()));
        }
        Ok(buf)
    }

    /// Decode a canonical-encoding byte buffer back into a [`WireMessage`].
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::Oversized(buf.len()));
        }
        let mut cursor = 0usize;
        let protocol = read_str(buf, &mut cursor)?.to_string();
        let msg_type = read_str(buf, &mut cursor)?.to_string();
        let from = read_str(buf, &mut cursor)?.to_string();

        if buf.len() <= cursor {
            return Err(WireError::Truncated("to-field discriminant"));
        }
        let has_to = buf[cursor];
        cursor += 1;
        let to = if has_to == 1 {
            Some(read_str(buf, &mut cursor)?.to_string())
        } else {
            None
        };

        let payload = read_bytes(buf, &mut cursor)?.to_vec();

        if buf.len() < cursor + 8 {
            return Err(WireError::Truncated("timestamp"));
        }
        let timestamp = u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;

        let message_id = read_str(buf, &mut cursor)?.to_string();

        Ok(WireMessage {
            protocol,
            msg_type,
            from,
            to,
            payload,
            timestamp,
            message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LongTermKeypair;

    fn sample() -> WireMessage {
        WireMessage {
            protocol: "swapsig/musig2".to_string(),
            msg_type: "NONCE_SHARE".to_string(),
            from: "peer-a".to_string(),
            to: Some("peer-b".to_string()),
            payload: vec![1, 2, 3, 4, 5],
            timestamp: 1_700_000_000,
            message_id: "msg-1".to_string(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let msg = sample();
        let bytes = msg.encode().unwrap();
        let decoded = WireMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_with_no_destination() {
        let mut msg = sample();
        msg.to = None;
        let bytes = msg.encode().unwrap();
        let decoded = WireMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn point_roundtrip() {
        let kp = LongTermKeypair::generate();
        let encoded = encode_point(&kp.public_key());
        assert_eq!(encoded.len(), 33);
        assert!(encoded[0] == 0x02 || encoded[0] == 0x03);
        let decoded = decode_point(&encoded).unwrap();
        assert_eq!(decoded, kp.public_key());
    }

    #[test]
    fn point_wrong_prefix_rejected() {
        let mut bytes = [0u8; 33];
        bytes[0] = 0x04;
        assert_eq!(
            decode_point(&bytes),
            Err(WireError::WrongPointPrefix(0x04))
        );
    }

    #[test]
    fn point_wrong_length_rejected() {
        let bytes = [0u8; 10];
        assert_eq!(decode_point(&bytes), Err(WireError::Truncated("compressed point")));
    }

    #[test]
    fn scalar_zero_pads() {
        let short = [0xff, 0xee];
        let encoded = encode_scalar(&short);
        assert_eq!(encoded.len(), 32);
        assert_eq!(&encoded[30..], &short[..]);
        assert!(encoded[..30].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_message_rejected() {
        let mut msg = sample();
        msg.payload = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(msg.encode(), Err(WireError::Oversized(_))));
    }

    #[test]
    fn message_at_cap_accepted() {
        let mut msg = sample();
        let overhead = sample().encode().unwrap().len() - sample().payload.len();
        msg.payload = vec![0u8; MAX_MESSAGE_SIZE - overhead];
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded.len(), MAX_MESSAGE_SIZE);
        assert!(WireMessage::decode(&encoded).is_ok());
    }

    #[test]
    fn truncated_buffer_rejected() {
        let msg = sample();
        let mut bytes = msg.encode().unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(WireMessage::decode(&bytes).is_err());
    }

    #[test]
    fn length_overrun_rejected() {
        let mut buf = Vec::new();
        write_str(&mut buf, "p");
        let bad_len_offset = buf.len();
        buf.extend_from_slice(&[1, 0, 0, 0]);
        let _ = bad_len_offset;
        let mut cursor = 0;
        let _ = read_str(&buf, &mut cursor).unwrap();
        assert!(read_bytes(&buf, &mut cursor).is_err());
    }
}
