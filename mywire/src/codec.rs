//! Splitting payloads into frames and reassembling them again
//!
//! A frame is a 3 byte little-endian length and a 1 byte sequence id followed by
//! the body. Payloads of 0xFFFFFF bytes or more are split over multiple frames, the
//! last frame of a payload is always shorter than 0xFFFFFF, if needed empty.
//!
//! With compression enabled the framed byte stream is cut into compressed packages
//! with a 7 byte header: compressed length (3), sequence id (1), uncompressed length (3).
//! An uncompressed length of 0 means the body is sent as is.
use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::error::{ConnectionErrorContent, ConnectionResult};

/// The largest body a single frame can carry
pub const MAX_FRAME_LEN: usize = 0xFF_FFFF;

/// Length of the header of a frame
pub const FRAME_HEADER_LEN: usize = 4;

/// Length of the header of a compressed package
pub const COMPRESSED_HEADER_LEN: usize = 7;

/// Chunks shorter than this are not worth compressing
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Read a little-endian u24 from the beginning of b
#[inline]
fn u24(b: &[u8]) -> usize {
    usize::from(b[0]) | usize::from(b[1]) << 8 | usize::from(b[2]) << 16
}

/// Write a frame header
#[inline]
fn put_header(out: &mut BytesMut, len: usize, seq: u8) {
    out.put_uint_le(len as u64, 3);
    out.put_u8(seq);
}

/// Append payload to out as one or more frames, advancing seq once per frame
pub fn encode_payload(payload: &[u8], seq: &mut u8, out: &mut BytesMut) {
    out.reserve(payload.len() + FRAME_HEADER_LEN * (payload.len() / MAX_FRAME_LEN + 1));
    for chunk in payload.chunks(MAX_FRAME_LEN) {
        put_header(out, chunk.len(), *seq);
        out.put_slice(chunk);
        *seq = seq.wrapping_add(1);
    }
    if payload.len() % MAX_FRAME_LEN == 0 {
        // Either the payload is empty, or it ended exactly on a frame boundary
        put_header(out, 0, *seq);
        *seq = seq.wrapping_add(1);
    }
}

/// Location of a complete payload at the start of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSpan {
    /// Number of buffer bytes taken up by the frames of the payload
    pub consumed: usize,
    /// Number of frames the payload is split over
    pub frames: usize,
    /// Length of the reassembled payload
    pub len: usize,
    /// Sequence id expected for the frame following the payload
    pub next_seq: u8,
}

impl PayloadSpan {
    /// Return the payload without copying if it consists of a single frame
    pub fn single<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        (self.frames == 1).then(|| &buf[FRAME_HEADER_LEN..self.consumed])
    }

    /// Append the concatenated bodies of all frames of the payload to out
    pub fn copy_body(&self, buf: &[u8], out: &mut Vec<u8>) {
        out.reserve(self.len);
        let mut pos = 0;
        for _ in 0..self.frames {
            let len = u24(&buf[pos..]);
            pos += FRAME_HEADER_LEN;
            out.extend_from_slice(&buf[pos..pos + len]);
            pos += len;
        }
    }
}

/// Find a complete payload at the start of buf
///
/// Returns `Ok(None)` if more bytes are needed. Every frame must carry the
/// expected sequence id, otherwise [ConnectionErrorContent::OutOfOrder] is returned.
pub fn scan_payload(buf: &[u8], expected_seq: u8) -> ConnectionResult<Option<PayloadSpan>> {
    let mut pos = 0;
    let mut seq = expected_seq;
    let mut frames = 0;
    let mut len = 0;
    loop {
        let Some(header) = buf.get(pos..pos + FRAME_HEADER_LEN) else {
            return Ok(None);
        };
        let frame_len = u24(header);
        if header[3] != seq {
            return Err(ConnectionErrorContent::OutOfOrder {
                expected: seq,
                got: header[3],
            }
            .into());
        }
        if buf.len() < pos + FRAME_HEADER_LEN + frame_len {
            return Ok(None);
        }
        pos += FRAME_HEADER_LEN + frame_len;
        seq = seq.wrapping_add(1);
        frames += 1;
        len += frame_len;
        if frame_len < MAX_FRAME_LEN {
            return Ok(Some(PayloadSpan {
                consumed: pos,
                frames,
                len,
                next_seq: seq,
            }));
        }
    }
}

/// Append data to out as compressed packages, advancing comp_seq once per package
pub fn encode_compressed(data: &[u8], comp_seq: &mut u8, out: &mut BytesMut) -> ConnectionResult<()> {
    for chunk in data.chunks(MAX_FRAME_LEN) {
        let mut compressed = None;
        if chunk.len() >= MIN_COMPRESS_LENGTH {
            let mut e = ZlibEncoder::new(Vec::with_capacity(chunk.len() / 2), Compression::default());
            e.write_all(chunk)?;
            let c = e.finish()?;
            if c.len() < chunk.len() {
                compressed = Some(c);
            }
        }
        match compressed {
            Some(c) => {
                put_header(out, c.len(), *comp_seq);
                out.put_uint_le(chunk.len() as u64, 3);
                out.put_slice(&c);
            }
            None => {
                put_header(out, chunk.len(), *comp_seq);
                out.put_uint_le(0, 3);
                out.put_slice(chunk);
            }
        }
        *comp_seq = comp_seq.wrapping_add(1);
    }
    Ok(())
}

/// Location of a complete compressed package at the start of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedSpan {
    /// Number of buffer bytes taken up by the package
    pub consumed: usize,
    /// Length the body inflates to, 0 if the body is not compressed
    pub uncompressed_len: usize,
}

/// Find a complete compressed package at the start of buf
pub fn scan_compressed(buf: &[u8], expected_seq: u8) -> ConnectionResult<Option<CompressedSpan>> {
    let Some(header) = buf.get(..COMPRESSED_HEADER_LEN) else {
        return Ok(None);
    };
    let len = u24(header);
    if header[3] != expected_seq {
        return Err(ConnectionErrorContent::OutOfOrder {
            expected: expected_seq,
            got: header[3],
        }
        .into());
    }
    if buf.len() < COMPRESSED_HEADER_LEN + len {
        return Ok(None);
    }
    Ok(Some(CompressedSpan {
        consumed: COMPRESSED_HEADER_LEN + len,
        uncompressed_len: u24(&header[4..]),
    }))
}

/// Append the inflated body of the compressed package described by span to out
pub fn inflate_compressed(buf: &[u8], span: CompressedSpan, out: &mut BytesMut) -> ConnectionResult<()> {
    let body = &buf[COMPRESSED_HEADER_LEN..span.consumed];
    if span.uncompressed_len == 0 {
        out.put_slice(body);
        return Ok(());
    }
    let mut inflated = Vec::with_capacity(span.uncompressed_len);
    // Read one byte past the announced length so an oversized body is detected without inflating all of it
    ZlibDecoder::new(body)
        .take(span.uncompressed_len as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| ConnectionErrorContent::ProtocolError(format!("Invalid compressed package: {e}")))?;
    if inflated.len() != span.uncompressed_len {
        return Err(ConnectionErrorContent::ProtocolError(format!(
            "Compressed package inflated to {} bytes, expected {}",
            inflated.len(),
            span.uncompressed_len
        ))
        .into());
    }
    out.put_slice(&inflated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    /// Encode a payload and decode it again
    fn round_trip(payload: &[u8]) -> (Vec<u8>, PayloadSpan) {
        let mut seq = 0;
        let mut out = BytesMut::new();
        encode_payload(payload, &mut seq, &mut out);
        let span = scan_payload(&out, 0).unwrap().expect("complete payload");
        assert_eq!(span.consumed, out.len());
        assert_eq!(span.next_seq, seq);
        let mut body = Vec::new();
        span.copy_body(&out, &mut body);
        (body, span)
    }

    #[test]
    fn frame_round_trip() {
        for len in [
            0,
            1,
            250,
            MAX_FRAME_LEN - 1,
            MAX_FRAME_LEN,
            MAX_FRAME_LEN + 1,
            2 * MAX_FRAME_LEN,
        ] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let (body, span) = round_trip(&payload);
            assert_eq!(body.len(), len);
            assert!(body == payload, "payload of {len} bytes differs");
            assert_eq!(span.frames, len / MAX_FRAME_LEN + 1);
        }
    }

    #[test]
    fn exact_multiple_gets_empty_terminator() {
        let payload = vec![7u8; MAX_FRAME_LEN];
        let mut seq = 3;
        let mut out = BytesMut::new();
        encode_payload(&payload, &mut seq, &mut out);
        assert_eq!(out.len(), MAX_FRAME_LEN + 2 * FRAME_HEADER_LEN);
        assert_eq!(&out[MAX_FRAME_LEN + 4..], &[0, 0, 0, 4]);
        assert_eq!(seq, 5);
    }

    #[test]
    fn split_payload_two_frames() {
        let payload = vec![1u8; 0x100_0001];
        let mut seq = 0;
        let mut out = BytesMut::new();
        encode_payload(&payload, &mut seq, &mut out);
        assert_eq!(&out[..4], &[0xFF, 0xFF, 0xFF, 0]);
        assert_eq!(&out[MAX_FRAME_LEN + 4..MAX_FRAME_LEN + 8], &[2, 0, 0, 1]);
        let span = scan_payload(&out, 0).unwrap().unwrap();
        assert_eq!(span.frames, 2);
        assert_eq!(span.len, 0x100_0001);
        assert!(span.single(&out).is_none());
    }

    #[test]
    fn incomplete_payload() {
        let mut seq = 0;
        let mut out = BytesMut::new();
        encode_payload(b"hello world", &mut seq, &mut out);
        for cut in 0..out.len() {
            assert_eq!(scan_payload(&out[..cut], 0).unwrap(), None);
        }
        let span = scan_payload(&out, 0).unwrap().unwrap();
        assert_eq!(span.single(&out), Some(&b"hello world"[..]));
    }

    #[test]
    fn sequence_mismatch() {
        let mut seq = 5;
        let mut out = BytesMut::new();
        encode_payload(b"abc", &mut seq, &mut out);
        let e = scan_payload(&out, 4).unwrap_err();
        assert!(matches!(
            e.content(),
            ConnectionErrorContent::OutOfOrder {
                expected: 4,
                got: 5
            }
        ));
        // Continuation frames are checked as well
        let payload = vec![0u8; MAX_FRAME_LEN + 10];
        let mut seq = 0;
        let mut out = BytesMut::new();
        encode_payload(&payload, &mut seq, &mut out);
        out[MAX_FRAME_LEN + 7] = 9;
        assert!(scan_payload(&out, 0).is_err());
    }

    #[test]
    fn sequence_wraps() {
        let mut seq = 255;
        let mut out = BytesMut::new();
        encode_payload(b"x", &mut seq, &mut out);
        assert_eq!(seq, 0);
        assert_eq!(scan_payload(&out, 255).unwrap().unwrap().next_seq, 0);
    }

    #[test]
    fn compressed_round_trip() {
        for data in [
            b"short".to_vec(),
            "SELECT 1 FROM dual WHERE 1=1 AND 2=2 AND 3=3 AND 4=4 AND 5=5 AND 6=6"
                .repeat(100)
                .into_bytes(),
        ] {
            let mut comp_seq = 0;
            let mut out = BytesMut::new();
            encode_compressed(&data, &mut comp_seq, &mut out).unwrap();
            assert_eq!(comp_seq, 1);
            let span = scan_compressed(&out, 0).unwrap().unwrap();
            assert_eq!(span.consumed, out.len());
            if data.len() < MIN_COMPRESS_LENGTH {
                assert_eq!(span.uncompressed_len, 0);
            } else {
                assert_eq!(span.uncompressed_len, data.len());
                assert!(out.len() < data.len());
            }
            let mut inflated = BytesMut::new();
            inflate_compressed(&out, span, &mut inflated).unwrap();
            assert_eq!(&inflated[..], &data[..]);
        }
    }

    #[test]
    fn oversized_inflation_rejected() {
        let mut e = ZlibEncoder::new(Vec::new(), Compression::best());
        e.write_all(&vec![0u8; 1 << 20]).unwrap();
        let body = e.finish().unwrap();
        let mut buf = BytesMut::new();
        put_header(&mut buf, body.len(), 0);
        buf.put_uint_le(64, 3);
        buf.put_slice(&body);

        let span = scan_compressed(&buf, 0).unwrap().unwrap();
        assert_eq!(span.uncompressed_len, 64);
        let mut inflated = BytesMut::new();
        assert!(inflate_compressed(&buf, span, &mut inflated).is_err());
        assert!(inflated.is_empty());
    }

    #[test]
    fn compressed_sequence_mismatch() {
        let mut comp_seq = 1;
        let mut out = BytesMut::new();
        encode_compressed(b"abc", &mut comp_seq, &mut out).unwrap();
        assert!(scan_compressed(&out, 0).is_err());
        assert_eq!(scan_compressed(&out[..6], 1).unwrap(), None);
    }
}
