// [[AXON]]/apps/kernel-server/src/protocol/binary.rs
// Purpose: Fixed 24-byte binary framing for the mcp.v1.binary subprotocol.
// Architecture: Protocol Layer
// Dependencies: std

use super::{methods, Frame, FrameKind, ProtocolError};

/// "MCPW" in big-endian.
pub const MAGIC: u32 = 0x4D43_5057;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 24;
pub const MAX_PAYLOAD: usize = 1024 * 1024;

pub const FLAG_COMPRESSED: u16 = 0x0001;

/// The fixed header preceding every binary payload:
/// magic u32 | version u8 | type u8 | flags u16 | sequence u64 |
/// method_id u16 | reserved u16 | payload_size u32. All big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub version: u8,
    pub kind: FrameKind,
    pub flags: u16,
    pub sequence: u64,
    pub method_id: u16,
    pub payload_size: u32,
}

impl BinaryHeader {
    pub fn write(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.kind.wire_byte();
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf[16..18].copy_from_slice(&self.method_id.to_be_bytes());
        // bytes 18..20 reserved, zero
        buf[20..24].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated(buf.len()));
        }
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = buf[4];
        if version != VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        let kind = FrameKind::from_wire_byte(buf[5])?;
        let flags = u16::from_be_bytes([buf[6], buf[7]]);
        let sequence = u64::from_be_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let method_id = u16::from_be_bytes([buf[16], buf[17]]);
        let payload_size = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        if payload_size as usize > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                got: payload_size as usize,
                limit: MAX_PAYLOAD,
            });
        }
        Ok(BinaryHeader {
            version,
            kind,
            flags,
            sequence,
            method_id,
            payload_size,
        })
    }
}

/// Encode a frame for the binary wire. The payload is the JSON body minus
/// the fields the header already carries.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let method_id = match &frame.method {
        Some(m) => methods::method_to_id(m)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown method {}", m)))?,
        None => 0,
    };
    let payload = match frame.kind {
        FrameKind::Ping | FrameKind::Pong => Vec::new(),
        _ => {
            let body = serde_json::json!({
                "params": frame.params,
                "result": frame.result,
                "error": frame.error,
            });
            serde_json::to_vec(&body).map_err(|e| ProtocolError::Malformed(e.to_string()))?
        }
    };
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            got: payload.len(),
            limit: MAX_PAYLOAD,
        });
    }
    let header = BinaryHeader {
        version: VERSION,
        kind: frame.kind,
        flags: 0,
        sequence: frame.id.unwrap_or(0),
        method_id,
        payload_size: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.write());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_frame(buf: &[u8]) -> Result<Frame, ProtocolError> {
    let header = BinaryHeader::parse(buf)?;
    if header.flags & FLAG_COMPRESSED != 0 {
        return Err(ProtocolError::CompressionUnsupported);
    }
    let payload = &buf[HEADER_LEN..];
    if payload.len() != header.payload_size as usize {
        return Err(ProtocolError::Malformed(format!(
            "payload size mismatch: header says {}, got {}",
            header.payload_size,
            payload.len()
        )));
    }

    let method = if header.method_id != 0 {
        Some(
            methods::id_to_method(header.method_id)
                .ok_or(ProtocolError::UnknownMethodId(header.method_id))?
                .to_string(),
        )
    } else {
        None
    };

    let (params, result, error) = if payload.is_empty() {
        (None, None, None)
    } else {
        let body: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let pick = |k: &str| {
            let v = body.get(k).cloned().unwrap_or(serde_json::Value::Null);
            if v.is_null() {
                None
            } else {
                Some(v)
            }
        };
        let error = match pick("error") {
            Some(v) => Some(
                serde_json::from_value(v).map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            ),
            None => None,
        };
        (pick("params"), pick("result"), error)
    };

    let id = match header.kind {
        FrameKind::Request | FrameKind::Response => Some(header.sequence),
        FrameKind::Error => (header.sequence != 0).then_some(header.sequence),
        _ => None,
    };

    let frame = Frame {
        id,
        kind: header.kind,
        method,
        params,
        result,
        error,
    };
    frame.validate()?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_round_trip() {
        let header = BinaryHeader {
            version: VERSION,
            kind: FrameKind::Request,
            flags: 0,
            sequence: 0x0102_0304_0506_0708,
            method_id: 12,
            payload_size: 512,
        };
        let parsed = BinaryHeader::parse(&header.write()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_round_trip_all_kinds() {
        for kind in [
            FrameKind::Request,
            FrameKind::Response,
            FrameKind::Notification,
            FrameKind::Error,
            FrameKind::Ping,
            FrameKind::Pong,
        ] {
            let header = BinaryHeader {
                version: VERSION,
                kind,
                flags: FLAG_COMPRESSED,
                sequence: 42,
                method_id: 0,
                payload_size: 0,
            };
            assert_eq!(BinaryHeader::parse(&header.write()).unwrap(), header);
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let header = BinaryHeader {
            version: VERSION,
            kind: FrameKind::Ping,
            flags: 0,
            sequence: 0,
            method_id: 0,
            payload_size: 0,
        };
        let mut buf = header.write();
        buf[0] = 0xFF;
        assert!(matches!(
            BinaryHeader::parse(&buf),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let header = BinaryHeader {
            version: VERSION,
            kind: FrameKind::Request,
            flags: 0,
            sequence: 1,
            method_id: 1,
            payload_size: (MAX_PAYLOAD + 1) as u32,
        };
        assert!(matches!(
            BinaryHeader::parse(&header.write()),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            BinaryHeader::parse(&[0u8; 10]),
            Err(ProtocolError::Truncated(10))
        ));
    }

    #[test]
    fn frame_round_trip_request() {
        let frame = Frame::request(9, "tools/call", json!({"tool": "github.list_repos"}));
        let encoded = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn frame_round_trip_ping() {
        let encoded = encode_frame(&Frame::ping()).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(decode_frame(&encoded).unwrap(), Frame::ping());
    }

    #[test]
    fn compressed_flag_rejected() {
        let frame = Frame::request(1, "ping", json!({}));
        let mut encoded = encode_frame(&frame).unwrap();
        encoded[7] |= FLAG_COMPRESSED as u8;
        assert!(matches!(
            decode_frame(&encoded),
            Err(ProtocolError::CompressionUnsupported)
        ));
    }
}
