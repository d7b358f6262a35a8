//! The on-wire frame format shared by every fabric.
//!
//! ```text
//!  0        1        2        3        4               4+L
//! +--------+--------+--------+--------+----- payload -----+
//! |  type  |      length     |   streamid (u16)  |  ...   |
//! +--------+--------+--------+--------+-------------------+
//!    u8         u16                u16
//! ```
//!
//! `length` is the payload length in bytes, not counting the 5-byte header.
//! All multi-byte fields are big-endian. The numeric type codes below are
//! part of the wire compatibility surface and must not be renumbered.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FabricError, Result};

const HEADER_LEN: usize = 5;

/// Frame type discriminants, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Syn = 0x01,
    Result = 0x02,
    Data = 0x03,
    Wnd = 0x04,
    Fin = 0x05,
    Rst = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = FabricError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Syn),
            0x02 => Ok(FrameType::Result),
            0x03 => Ok(FrameType::Data),
            0x04 => Ok(FrameType::Wnd),
            0x05 => Ok(FrameType::Fin),
            0x06 => Ok(FrameType::Rst),
            other => Err(FabricError::UnknownFrameType(other)),
        }
    }
}

/// A decoded fabric frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Dial request: network tag (u8-length-prefixed) + address (u16-length-prefixed).
    Syn {
        stream_id: u16,
        network: String,
        address: String,
    },
    /// Reply to a SYN. `error_code` of `ERR_NONE` (0) means accepted.
    Result { stream_id: u16, error_code: u32 },
    /// Opaque application bytes.
    Data { stream_id: u16, payload: Bytes },
    /// Flow-control credit: the peer may send `credit` more bytes.
    Wnd { stream_id: u16, credit: u32 },
    /// Half-close: sender will not write any more data on this stream.
    Fin { stream_id: u16 },
    /// Hard reset: abandon the stream immediately, in both directions.
    Rst { stream_id: u16 },
}

impl Frame {
    pub fn stream_id(&self) -> u16 {
        match self {
            Frame::Syn { stream_id, .. }
            | Frame::Result { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::Wnd { stream_id, .. }
            | Frame::Fin { stream_id }
            | Frame::Rst { stream_id } => *stream_id,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Syn { .. } => FrameType::Syn,
            Frame::Result { .. } => FrameType::Result,
            Frame::Data { .. } => FrameType::Data,
            Frame::Wnd { .. } => FrameType::Wnd,
            Frame::Fin { .. } => FrameType::Fin,
            Frame::Rst { .. } => FrameType::Rst,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Frame::Syn {
                network, address, ..
            } => {
                buf.put_u8(network.len() as u8);
                buf.put_slice(network.as_bytes());
                buf.put_u16(address.len() as u16);
                buf.put_slice(address.as_bytes());
            }
            Frame::Result { error_code, .. } => buf.put_u32(*error_code),
            Frame::Data { payload, .. } => buf.put_slice(payload),
            Frame::Wnd { credit, .. } => buf.put_u32(*credit),
            Frame::Fin { .. } | Frame::Rst { .. } => {}
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Syn {
                network, address, ..
            } => 1 + network.len() + 2 + address.len(),
            Frame::Result { .. } => 4,
            Frame::Data { payload, .. } => payload.len(),
            Frame::Wnd { .. } => 4,
            Frame::Fin { .. } | Frame::Rst { .. } => 0,
        }
    }

    /// Encode this frame, header included, into a single contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let len = self.payload_len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
        buf.put_u8(self.frame_type() as u8);
        buf.put_u16(len as u16);
        buf.put_u16(self.stream_id());
        self.encode_payload(&mut buf);
        buf.freeze()
    }
}

/// Write one frame atomically to `writer`. Callers are responsible for
/// serializing concurrent writers (see the fabric's write lock) — this
/// function issues a single `write_all` of the fully encoded frame so no
/// caller-visible interleaving can occur below that lock.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.encode())?;
    writer.flush()?;
    Ok(())
}

/// Read and decode one frame from `reader`.
///
/// `max_payload` bounds the accepted `length` field; a frame claiming a
/// longer payload is a protocol error (`FrameTooLarge`) rather than an
/// attempt to read an unbounded amount of attacker-controlled data.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: usize) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let frame_type = FrameType::try_from(header[0])?;
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let stream_id = u16::from_be_bytes([header[3], header[4]]);

    if len > max_payload {
        return Err(FabricError::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut payload = payload.as_slice();

    match frame_type {
        FrameType::Syn => {
            if payload.is_empty() {
                return Err(FabricError::Malformed("SYN missing network tag length".into()));
            }
            let tag_len = payload.get_u8() as usize;
            if payload.len() < tag_len {
                return Err(FabricError::Malformed("SYN network tag truncated".into()));
            }
            let network = String::from_utf8(payload[..tag_len].to_vec())
                .map_err(|e| FabricError::Malformed(e.to_string()))?;
            payload.advance(tag_len);

            if payload.len() < 2 {
                return Err(FabricError::Malformed("SYN missing address length".into()));
            }
            let addr_len = payload.get_u16() as usize;
            if payload.len() != addr_len {
                return Err(FabricError::Malformed("SYN address length mismatch".into()));
            }
            let address = String::from_utf8(payload.to_vec())
                .map_err(|e| FabricError::Malformed(e.to_string()))?;

            Ok(Frame::Syn {
                stream_id,
                network,
                address,
            })
        }
        FrameType::Result => {
            if payload.len() != 4 {
                return Err(FabricError::FrameTooShort {
                    expected: 4,
                    actual: payload.len(),
                });
            }
            Ok(Frame::Result {
                stream_id,
                error_code: payload.get_u32(),
            })
        }
        FrameType::Data => Ok(Frame::Data {
            stream_id,
            payload: Bytes::copy_from_slice(payload),
        }),
        FrameType::Wnd => {
            if payload.len() != 4 {
                return Err(FabricError::FrameTooShort {
                    expected: 4,
                    actual: payload.len(),
                });
            }
            Ok(Frame::Wnd {
                stream_id,
                credit: payload.get_u32(),
            })
        }
        FrameType::Fin => {
            if !payload.is_empty() {
                return Err(FabricError::Malformed("FIN must carry no payload".into()));
            }
            Ok(Frame::Fin { stream_id })
        }
        FrameType::Rst => {
            if !payload.is_empty() {
                return Err(FabricError::Malformed("RST must carry no payload".into()));
            }
            Ok(Frame::Rst { stream_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut buf = std::io::Cursor::new(Vec::new());
        write_frame(&mut buf, &frame).unwrap();
        buf.set_position(0);
        let decoded = read_frame(&mut buf, 1 << 20).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_syn() {
        roundtrip(Frame::Syn {
            stream_id: 7,
            network: "tcp".into(),
            address: "127.0.0.1:9000".into(),
        });
    }

    #[test]
    fn roundtrip_result() {
        roundtrip(Frame::Result {
            stream_id: 7,
            error_code: 3,
        });
    }

    #[test]
    fn roundtrip_data() {
        roundtrip(Frame::Data {
            stream_id: 42,
            payload: Bytes::from_static(b"hello world"),
        });
    }

    #[test]
    fn roundtrip_data_empty_payload() {
        roundtrip(Frame::Data {
            stream_id: 42,
            payload: Bytes::new(),
        });
    }

    #[test]
    fn roundtrip_wnd() {
        roundtrip(Frame::Wnd {
            stream_id: 1,
            credit: 65536,
        });
    }

    #[test]
    fn roundtrip_fin_and_rst() {
        roundtrip(Frame::Fin { stream_id: 5 });
        roundtrip(Frame::Rst { stream_id: 5 });
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = vec![0xEE, 0x00, 0x00, 0x00, 0x01];
        let mut cursor = std::io::Cursor::new(&mut buf);
        let err = read_frame(&mut cursor, 1024).unwrap_err();
        assert!(matches!(err, FabricError::UnknownFrameType(0xEE)));
    }

    #[test]
    fn oversized_length_is_rejected() {
        // Claims a 100-byte DATA payload against a 16-byte cap.
        let mut buf = vec![0x03, 0x00, 100, 0x00, 0x01];
        let mut cursor = std::io::Cursor::new(&mut buf);
        let err = read_frame(&mut cursor, 16).unwrap_err();
        assert!(matches!(err, FabricError::FrameTooLarge { .. }));
    }

    #[test]
    fn truncated_payload_is_io_error() {
        // Header claims 10 bytes of payload but none follow.
        let buf = vec![0x03u8, 0x00, 0x0A, 0x00, 0x01];
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 1024).unwrap_err();
        assert!(matches!(err, FabricError::Io(_)));
    }

    #[test]
    fn exact_type_codes_are_normative() {
        assert_eq!(FrameType::Syn as u8, 0x01);
        assert_eq!(FrameType::Result as u8, 0x02);
        assert_eq!(FrameType::Data as u8, 0x03);
        assert_eq!(FrameType::Wnd as u8, 0x04);
        assert_eq!(FrameType::Fin as u8, 0x05);
        assert_eq!(FrameType::Rst as u8, 0x06);
    }
}
