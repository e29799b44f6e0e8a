//! Payload decoding.
//!
//! [`PacketReader`] is a cursor over one packet payload. Reads return `None`
//! when the payload is too short, so each caller picks its own error for a
//! truncated packet (usually [`malformed_packet`](super::malformed_packet)).

use crate::protocol::{EOF_HEADER, ERR_HEADER, EofPacket, ErrPacket, NULL_MARKER, OK_HEADER, OkPacket};

/// Cursor over a single payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consume exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_bytes(N)?.try_into().ok()
    }

    pub fn skip(&mut self, n: usize) -> bool {
        self.read_bytes(n).is_some()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    /// Length-encoded integer. The NULL marker (0xFB) and 0xFF are not
    /// integers and yield `None`.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_u8()? {
            first @ 0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self
                .take::<3>()
                .map(|[a, b, c]| u64::from(u32::from_le_bytes([a, b, c, 0]))),
            0xFE => self.read_u64_le(),
            _ => None,
        }
    }

    pub fn read_lenenc_slice(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_slice().map(lossy)
    }

    /// Text-row field: `Some(None)` is SQL NULL, `None` means truncated.
    pub fn read_lenenc_field(&mut self) -> Option<Option<&'a [u8]>> {
        if self.peek()? == NULL_MARKER {
            self.pos += 1;
            return Some(None);
        }
        self.read_lenenc_slice().map(Some)
    }

    /// Bytes up to a NUL, which is consumed. `None` without a terminator.
    pub fn read_null_bytes(&mut self) -> Option<&'a [u8]> {
        let rest = self.data.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    /// Like [`read_null_bytes`](Self::read_null_bytes), but a missing
    /// terminator takes the rest of the payload.
    pub fn read_null_string(&mut self) -> Option<String> {
        match self.read_null_bytes() {
            Some(bytes) => Some(lossy(bytes)),
            None => Some(self.read_rest_string()),
        }
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        self.read_bytes(len).map(lossy)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        self.pos = self.data.len();
        rest
    }

    pub fn read_rest_string(&mut self) -> String {
        lossy(self.read_rest())
    }

    /// OK packet body; a leading 0x00 header byte is skipped if present.
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        self.skip_header(OK_HEADER);
        Some(OkPacket {
            affected_rows: self.read_lenenc_int()?,
            last_insert_id: self.read_lenenc_int()?,
            status_flags: self.read_u16_le()?,
            warnings: self.read_u16_le()?,
            info: self.read_rest_string(),
        })
    }

    /// ERR packet body. The `#` plus SQLSTATE block is optional.
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        self.skip_header(ERR_HEADER);
        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.pos += 1;
            self.read_string(5)?
        } else {
            String::new()
        };
        Some(ErrPacket {
            error_code,
            sql_state,
            error_message: self.read_rest_string(),
        })
    }

    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        self.skip_header(EOF_HEADER);
        Some(EofPacket {
            warnings: self.read_u16_le()?,
            status_flags: self.read_u16_le()?,
        })
    }

    fn skip_header(&mut self, header: u8) {
        if self.peek() == Some(header) {
            self.pos += 1;
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
