//! Sequenced packet I/O over a byte stream.
//!
//! Both the server side (client connections) and the backend driver speak
//! through a `PacketStream`. It owns the sequence counter: every packet read
//! must carry the expected sequence id, every packet written takes the next
//! one, and callers reset it to zero at command boundaries.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use sqlshim_core::Error;
use sqlshim_core::error::{ConnectionError, ConnectionErrorKind};

use crate::protocol::MAX_PACKET_SIZE;

/// A stream framed into MySQL packets.
#[derive(Debug)]
pub struct PacketStream<S> {
    stream: S,
    sequence_id: u8,
}

impl<S> PacketStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence_id: 0,
        }
    }

    /// Sequence id the next packet will carry.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Start a new command/response cycle.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Swap the underlying transport, keeping the sequence counter.
    ///
    /// Used when a connection upgrades to TLS mid-handshake.
    pub fn map_stream<T>(self, f: impl FnOnce(S) -> Result<T, Error>) -> Result<PacketStream<T>, Error> {
        Ok(PacketStream {
            stream: f(self.stream)?,
            sequence_id: self.sequence_id,
        })
    }
}

impl<S: Read + Write> PacketStream<S> {
    /// Read one logical packet, joining continuation packets.
    pub fn read_packet(&mut self) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .map_err(|e| disconnected("Failed to read packet header", e))?;

            let [l0, l1, l2, sequence_id] = header;
            if sequence_id != self.sequence_id {
                return Err(Error::protocol(format!(
                    "invalid packet sequence: expected {}, got {}",
                    self.sequence_id, sequence_id
                )));
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);

            let len = u32::from_le_bytes([l0, l1, l2, 0]) as usize;
            if len > 0 {
                let start = payload.len();
                payload.resize(start + len, 0);
                self.stream
                    .read_exact(&mut payload[start..])
                    .map_err(|e| disconnected("Failed to read packet payload", e))?;
            }

            if len < MAX_PACKET_SIZE {
                break;
            }
        }
        Ok(payload)
    }

    /// Write one logical packet, splitting it if needed, and flush.
    ///
    /// A payload that fills its last frame exactly is followed by an empty
    /// frame so the reader knows it ended.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut packet = Vec::with_capacity(payload.len() + 4);
        let mut chunks = payload.chunks(MAX_PACKET_SIZE);
        loop {
            let chunk = chunks.next().unwrap_or_default();
            let len = (chunk.len() as u32).to_le_bytes();
            packet.extend_from_slice(&[len[0], len[1], len[2], self.sequence_id]);
            packet.extend_from_slice(chunk);
            self.sequence_id = self.sequence_id.wrapping_add(1);
            if chunk.len() < MAX_PACKET_SIZE {
                break;
            }
        }

        self.stream
            .write_all(&packet)
            .map_err(|e| disconnected("Failed to write packet", e))?;
        self.stream
            .flush()
            .map_err(|e| disconnected("Failed to flush stream", e))
    }
}

fn disconnected(context: &str, err: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("{}: {}", context, err),
        source: Some(Box::new(err)),
    })
}
