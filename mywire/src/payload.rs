//! Send and receive whole payloads over a [Stream]
use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsConnector, rustls::pki_types::ServerName};
use tracing::trace;

use crate::{
    codec::{self, FRAME_HEADER_LEN},
    error::{ConnectionErrorContent, ConnectionResult},
    package_writer::PackageWriter,
    stream::Stream,
};

/// Bytes to make room for before reading from the stream
const READ_CHUNK: usize = 16 * 1024;

/// State of the compressed protocol
struct Compression {
    /// Sequence id of the next compressed package
    seq: u8,
    /// Compressed bytes read from the stream but not yet inflated
    raw: BytesMut,
    /// Scratch buffer holding the framed payload before compression
    framed: BytesMut,
}

/// Reads and writes payloads, handling framing, sequence ids and compression
///
/// Reads are cancel-safe: bytes read from the stream are kept in the buffers
/// until a whole payload is available. Writes are composed into a buffer
/// first, so a dropped [PayloadHandler::send] can be resumed by calling it again.
pub(crate) struct PayloadHandler {
    /// The stream to read from and write to
    stream: Stream,
    /// Framed bytes read from the stream (inflated if compression is on)
    read_buf: BytesMut,
    /// Number of bytes in read_buf belonging to the last returned payload
    skip_on_read: usize,
    /// Payloads spanning more than one frame are copied together here
    assembled: Vec<u8>,
    /// True if the last returned payload lives in assembled
    last_assembled: bool,
    /// The payload being composed
    payload: BytesMut,
    /// Bytes ready to be written to the stream
    out: BytesMut,
    /// Sequence id of the next frame
    seq: u8,
    /// Present once compression has been enabled
    compression: Option<Compression>,
}

impl PayloadHandler {
    /// Construct a new handler on top of stream
    pub(crate) fn new(stream: Stream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            skip_on_read: 0,
            assembled: Vec::new(),
            last_assembled: false,
            payload: BytesMut::with_capacity(1024),
            out: BytesMut::with_capacity(1024),
            seq: 0,
            compression: None,
        }
    }

    /// Reset sequence ids at the start of a new command
    pub(crate) fn start_command(&mut self) {
        self.seq = 0;
        if let Some(c) = &mut self.compression {
            c.seq = 0;
        }
    }

    /// Start composing a new payload
    pub(crate) fn compose(&mut self) -> PackageWriter<'_> {
        self.payload.clear();
        PackageWriter::new(&mut self.payload)
    }

    /// Frame the composed payload and queue it for sending
    pub(crate) fn finalize(&mut self) -> ConnectionResult<()> {
        trace!(len = self.payload.len(), seq = self.seq, "Queue payload");
        match &mut self.compression {
            None => codec::encode_payload(&self.payload, &mut self.seq, &mut self.out),
            Some(c) => {
                c.framed.clear();
                codec::encode_payload(&self.payload, &mut self.seq, &mut c.framed);
                codec::encode_compressed(&c.framed, &mut c.seq, &mut self.out)?;
            }
        }
        Ok(())
    }

    /// Return true if there are queued bytes that have not been written
    pub(crate) fn has_unsent(&self) -> bool {
        !self.out.is_empty()
    }

    /// Write all queued bytes to the stream
    ///
    /// The returned future is cancel-safe, calling send again continues where it stopped
    pub(crate) async fn send(&mut self) -> ConnectionResult<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.stream.write_all_buf(&mut self.out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read more framed bytes into read_buf
    async fn fill(&mut self) -> ConnectionResult<()> {
        match &mut self.compression {
            None => {
                self.read_buf.reserve(READ_CHUNK);
                if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            }
            Some(c) => loop {
                if let Some(span) = codec::scan_compressed(&c.raw, c.seq)? {
                    c.seq = c.seq.wrapping_add(1);
                    codec::inflate_compressed(&c.raw, span, &mut self.read_buf)?;
                    c.raw.advance(span.consumed);
                    return Ok(());
                }
                c.raw.reserve(READ_CHUNK);
                if self.stream.read_buf(&mut c.raw).await? == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            },
        }
        Ok(())
    }

    /// Read the next payload
    ///
    /// The returned slice is valid until the next call to read.
    /// The returned future is cancel-safe.
    pub(crate) async fn read(&mut self) -> ConnectionResult<&[u8]> {
        self.read_buf.advance(self.skip_on_read);
        self.skip_on_read = 0;
        self.last_assembled = false;
        loop {
            if let Some(span) = codec::scan_payload(&self.read_buf, self.seq)? {
                self.seq = span.next_seq;
                self.skip_on_read = span.consumed;
                trace!(len = span.len, frames = span.frames, "Read payload");
                self.last_assembled = span.frames != 1;
                if span.frames == 1 {
                    return Ok(&self.read_buf[FRAME_HEADER_LEN..span.consumed]);
                }
                self.assembled.clear();
                span.copy_body(&self.read_buf, &mut self.assembled);
                return Ok(&self.assembled);
            }
            self.fill().await?;
        }
    }

    /// The payload returned by the last call to [Self::read]
    pub(crate) fn last_payload(&self) -> &[u8] {
        if self.last_assembled {
            &self.assembled
        } else {
            self.read_buf
                .get(FRAME_HEADER_LEN..self.skip_on_read)
                .unwrap_or_default()
        }
    }

    /// Compress everything sent and received from now on
    pub(crate) fn enable_compression(&mut self) {
        self.compression = Some(Compression {
            seq: 0,
            raw: BytesMut::with_capacity(READ_CHUNK),
            framed: BytesMut::new(),
        });
    }

    /// Return true if compression has been enabled
    pub(crate) fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Return true if the underlying stream is encrypted or local
    pub(crate) fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    /// Return true if the underlying stream is plain TCP
    pub(crate) fn is_tcp(&self) -> bool {
        self.stream.is_tcp()
    }

    /// Perform a TLS handshake, all queued bytes must have been sent
    pub(crate) async fn upgrade_tls(
        self,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> ConnectionResult<Self> {
        if !self.out.is_empty() || self.read_buf.len() > self.skip_on_read {
            return Err(ConnectionErrorContent::ProtocolError(
                "Unexpected data before TLS handshake".to_string(),
            )
            .into());
        }
        let stream = self.stream.upgrade(connector, server_name).await?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            skip_on_read: 0,
            last_assembled: false,
            ..self
        })
    }

    /// Shut down the write side of the stream
    pub(crate) async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
