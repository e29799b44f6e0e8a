//! Payload encoding.
//!
//! [`PacketWriter`] builds one payload; framing and sequence ids are the
//! job of [`PacketStream`](super::PacketStream).

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::NULL_MARKER;

/// Growable payload buffer with the protocol's integer and string encodings.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Length-encoded integer: one byte below 251, otherwise a 0xFC, 0xFD or
    /// 0xFE prefix followed by 2, 3 or 8 bytes.
    pub fn write_lenenc_int(&mut self, value: u64) {
        match value {
            0..=250 => self.write_u8(value as u8),
            251..=0xFFFF => {
                self.write_u8(0xFC);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.write_u8(0xFD);
                self.write_bytes(&(value as u32).to_le_bytes()[..3]);
            }
            _ => {
                self.write_u8(0xFE);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.write_bytes(data);
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    /// Text-row field: the NULL marker, or the length-encoded value.
    pub fn write_lenenc_field(&mut self, value: Option<&[u8]>) {
        match value {
            Some(data) => self.write_lenenc_bytes(data),
            None => self.write_u8(NULL_MARKER),
        }
    }

    pub fn write_null_bytes(&mut self, data: &[u8]) {
        self.write_bytes(data);
        self.write_u8(0);
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.write_null_bytes(s.as_bytes());
    }

    /// Exactly `len` bytes of `s`: truncated, or padded with NULs.
    pub fn write_fixed_string(&mut self, s: &str, len: usize) {
        let bytes = &s.as_bytes()[..s.len().min(len)];
        self.write_bytes(bytes);
        self.write_zeros(len - bytes.len());
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(f: impl FnOnce(&mut PacketWriter)) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        f(&mut writer);
        writer.into_bytes()
    }

    #[test]
    fn test_fixed_width_integers() {
        let bytes = written(|w| {
            w.write_u8(0x42);
            w.write_u16_le(0x1234);
            w.write_u32_le(0x1234_5678);
            w.write_u64_le(0x0807_0605_0403_0201);
        });
        assert_eq!(
            bytes,
            [0x42, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_write_lenenc_int_boundaries() {
        assert_eq!(written(|w| w.write_lenenc_int(250)), [250]);
        assert_eq!(written(|w| w.write_lenenc_int(251)), [0xFC, 251, 0]);
        assert_eq!(written(|w| w.write_lenenc_int(0xFFFF)), [0xFC, 0xFF, 0xFF]);
        assert_eq!(
            written(|w| w.write_lenenc_int(0x1_0000)),
            [0xFD, 0x00, 0x00, 0x01]
        );
        assert_eq!(
            written(|w| w.write_lenenc_int(0x100_0000)),
            [0xFE, 0, 0, 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_strings() {
        assert_eq!(written(|w| w.write_null_string("root")), b"root\0");
        assert_eq!(written(|w| w.write_lenenc_string("ok")), [2, b'o', b'k']);
        assert_eq!(written(|w| w.write_fixed_string("HY", 5)), b"HY\0\0\0");
        assert_eq!(written(|w| w.write_fixed_string("4200012", 5)), b"42000");
    }

    #[test]
    fn test_write_lenenc_field() {
        let bytes = written(|w| {
            w.write_lenenc_field(None);
            w.write_lenenc_field(Some(b"1"));
            w.write_lenenc_field(Some(b""));
        });
        assert_eq!(bytes, [0xFB, 0x01, b'1', 0x00]);
    }
}
