use std::io::{self, Read, Write};

use log::debug;
use thiserror::Error;

/// Maximum number of payload bytes handed to a single write.
pub const CHUNK_SIZE: usize = 1024;

/// End-of-message marker written after the last payload chunk.
pub const TERMINATOR: &[u8; 2] = b"\n\n";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read from peer: {0}")]
    Read(#[source] io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("failed to write to peer: {0}")]
    Write(#[source] io::Error),
    #[error("short write, {written} of {expected} bytes sent")]
    ShortWrite { written: usize, expected: usize },
}

/// Split `message` into at most `chunk_size`-byte pieces.
///
/// An empty message yields no chunks.
///
/// # Panics
/// If `chunk_size` is zero.
pub fn encode(message: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    assert!(chunk_size > 0);
    message.chunks(chunk_size).collect()
}

/// Write `message` as chunks followed by [`TERMINATOR`].
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &[u8],
    chunk_size: usize,
) -> Result<(), TransportError> {
    let expected = message.len() + TERMINATOR.len();
    let mut written = 0;

    for chunk in encode(message, chunk_size)
        .into_iter()
        .chain(std::iter::once(&TERMINATOR[..]))
    {
        let sent = write_chunk(writer, chunk)?;
        written += sent;
        // later chunks would leave a gap in the peer's payload
        if sent < chunk.len() {
            return Err(TransportError::ShortWrite { written, expected });
        }
    }
    writer.flush().map_err(TransportError::Write)
}

/// Writes one chunk, retrying partial writes until the writer stops accepting bytes.
fn write_chunk<W: Write>(writer: &mut W, chunk: &[u8]) -> Result<usize, TransportError> {
    let mut sent = 0;
    while sent < chunk.len() {
        match writer.write(&chunk[sent..]) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Write(e)),
        }
    }
    Ok(sent)
}

/// Read from `reader` until [`TERMINATOR`] shows up and return everything before it.
///
/// The terminator may straddle two reads. Bytes that arrive after the
/// terminator within the same read are discarded.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut message = Vec::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => return Err(TransportError::PeerClosed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Read(e)),
        };

        // one byte of overlap catches a terminator split across reads
        let scan_from = message.len().saturating_sub(TERMINATOR.len() - 1);
        message.extend_from_slice(&buffer[..n]);

        if let Some(pos) = message[scan_from..]
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
        {
            let end = scan_from + pos;
            let trailing = message.len() - end - TERMINATOR.len();
            if trailing > 0 {
                debug!("discarding {trailing} bytes received after the terminator");
            }
            message.truncate(end);
            return Ok(message);
        }
    }
}

/// A framed, bidirectional byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    chunk_size: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn write_message(&mut self, message: &[u8]) -> Result<(), TransportError> {
        write_message(&mut self.stream, message, self.chunk_size)
    }

    pub fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        read_message(&mut self.stream)
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}
