//! Wire format (§6.1): a 24-byte little-endian header followed by payload.
//! Field names mirror the independent Rust KCP port in the reference pack
//! (`conv`, `frg`, `wnd`, `ts`, `sn`, `una`) rather than the Go original's
//! abbreviated names, since that's the idiom this crate's readers expect.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::{CMD_ACK, CMD_PUSH, CMD_WASK, CMD_WINS, IKCP_OVERHEAD};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Push = CMD_PUSH,
    Ack = CMD_ACK,
    Wask = CMD_WASK,
    Wins = CMD_WINS,
}

impl Cmd {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            CMD_PUSH => Some(Cmd::Push),
            CMD_ACK => Some(Cmd::Ack),
            CMD_WASK => Some(Cmd::Wask),
            CMD_WINS => Some(Cmd::Wins),
            _ => None,
        }
    }
}

/// One KCP segment: header plus payload. `resendts`/`rto`/`fastack`/`xmit`
/// are bookkeeping fields used only while the segment lives in `snd_buf`
/// (§3); they are not part of the wire encoding.
#[derive(Debug, Clone)]
pub struct Segment {
    pub conv: u32,
    pub cmd: Cmd,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: Bytes,

    pub resendts: u32,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
}

impl Segment {
    pub fn new(conv: u32, cmd: Cmd, data: Bytes) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            data,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        IKCP_OVERHEAD + self.data.len()
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.conv);
        out.put_u8(self.cmd as u8);
        out.put_u8(self.frg);
        out.put_u16_le(self.wnd);
        out.put_u32_le(self.ts);
        out.put_u32_le(self.sn);
        out.put_u32_le(self.una);
        out.put_u32_le(self.data.len() as u32);
        out.put_slice(&self.data);
    }

    /// Decodes one segment from the front of `buf`, advancing it past the
    /// header and payload. Returns `MalformedSegment` if the buffer is
    /// shorter than the declared header + payload length.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < IKCP_OVERHEAD {
            return Err(Error::MalformedSegment("short header"));
        }
        let mut hdr = &buf[..IKCP_OVERHEAD];
        let conv = hdr.read_u32::<LittleEndian>().unwrap();
        let cmd_raw = hdr.read_u8().unwrap();
        let frg = hdr.read_u8().unwrap();
        let wnd = hdr.read_u16::<LittleEndian>().unwrap();
        let ts = hdr.read_u32::<LittleEndian>().unwrap();
        let sn = hdr.read_u32::<LittleEndian>().unwrap();
        let una = hdr.read_u32::<LittleEndian>().unwrap();
        let len = hdr.read_u32::<LittleEndian>().unwrap() as usize;

        let cmd = Cmd::from_u8(cmd_raw).ok_or(Error::MalformedSegment("unknown cmd"))?;
        if buf.len() < IKCP_OVERHEAD + len {
            return Err(Error::MalformedSegment("payload shorter than declared len"));
        }

        buf.advance(IKCP_OVERHEAD);
        let data = buf.split_to(len);

        Ok(Segment {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            data,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        })
    }
}

/// Prepends the 16-byte stream UUID to an already-encoded segment batch,
/// producing one outbound datagram (§4.6 Output).
pub fn frame_datagram(uuid: &[u8; 16], segments_encoded: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(16 + segments_encoded.len());
    out.put_slice(uuid);
    out.put_slice(segments_encoded);
    out
}

/// Splits an inbound datagram into its UUID prefix and segment-stream tail.
/// A datagram shorter than `16 + IKCP_OVERHEAD` is not a valid frame.
pub fn split_datagram(datagram: Bytes) -> Result<([u8; 16], Bytes)> {
    if datagram.len() < 16 + IKCP_OVERHEAD {
        return Err(Error::MalformedSegment("datagram shorter than uuid + header"));
    }
    let mut datagram = datagram;
    let uuid_bytes = datagram.split_to(16);
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&uuid_bytes);
    Ok((uuid, datagram))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_push_segment() {
        let seg = Segment {
            conv: 0xAABBCCDD,
            cmd: Cmd::Push,
            frg: 3,
            wnd: 32,
            ts: 1234,
            sn: 7,
            una: 2,
            data: Bytes::from_static(b"hello"),
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        };
        let mut buf = BytesMut::new();
        seg.encode(&mut buf);
        assert_eq!(buf.len(), IKCP_OVERHEAD + 5);

        let mut bytes = buf.freeze();
        let decoded = Segment::decode(&mut bytes).unwrap();
        assert_eq!(decoded.conv, seg.conv);
        assert_eq!(decoded.cmd, Cmd::Push);
        assert_eq!(decoded.frg, 3);
        assert_eq!(decoded.sn, 7);
        assert_eq!(&decoded.data[..], b"hello");
        assert!(bytes.is_empty());
    }

    #[test]
    fn rejects_truncated_header() {
        let short = Bytes::from_static(&[0u8; 10]);
        let mut short = short;
        assert!(Segment::decode(&mut short).is_err());
    }
}
