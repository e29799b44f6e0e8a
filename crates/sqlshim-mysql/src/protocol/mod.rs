//! Wire-level building blocks shared by the server and the backend driver.
//!
//! Every packet is a 3-byte little-endian payload length, a sequence id and
//! the payload. [`PacketStream`] does the framing; [`PacketReader`] and
//! [`PacketWriter`] decode and encode payloads.

pub mod framing;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use framing::PacketStream;
pub use prepared::{
    ExecuteHeader, StmtPrepareOk, bind_params, build_stmt_close_packet, build_stmt_execute_packet,
    build_stmt_prepare_packet, build_stmt_reset_packet, malformed_packet, parse_execute_header,
    parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::PacketWriter;

use sqlshim_core::error::QueryError;

/// Largest payload one frame carries; longer payloads continue in the next.
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Protocol version announced in the initial handshake.
pub const PROTOCOL_VERSION: u8 = 10;

/// First payload byte of an OK packet.
pub const OK_HEADER: u8 = 0x00;
/// First payload byte of an AuthMoreData packet.
pub const MORE_DATA_HEADER: u8 = 0x01;
/// NULL marker in text rows.
pub const NULL_MARKER: u8 = 0xFB;
/// First payload byte of an EOF packet and of an AuthSwitchRequest.
pub const EOF_HEADER: u8 = 0xFE;
/// First payload byte of an ERR packet.
pub const ERR_HEADER: u8 = 0xFF;

/// Capability flags exchanged in the handshake.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Announced to clients. `CLIENT_SSL` is added when TLS is configured.
    pub const DEFAULT_SERVER_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

    /// Requested from the backend. Results come back with EOF framing, one
    /// result set per command, which is how they are relayed.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// Commands the shim dispatches or sends. Any other command byte goes to
/// [`Handler::handle_other_command`](crate::server::Handler::handle_other_command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    Ping = 0x0e,
    BinlogDump = 0x12,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    BinlogDumpGtid = 0x1e,
}

impl Command {
    const ALL: [Command; 14] = [
        Command::Quit,
        Command::InitDb,
        Command::Query,
        Command::FieldList,
        Command::Ping,
        Command::BinlogDump,
        Command::RegisterSlave,
        Command::StmtPrepare,
        Command::StmtExecute,
        Command::StmtSendLongData,
        Command::StmtClose,
        Command::StmtReset,
        Command::SetOption,
        Command::BinlogDumpGtid,
    ];

    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|&c| c as u8 == byte)
    }
}

pub mod server_status {
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
}

/// Collation ids.
pub mod charset {
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;
}

/// Decoded OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Decoded ERR packet; `sql_state` is empty for pre-4.1 style errors.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    /// Convert into the shared error type, keeping code and state.
    pub fn into_query_error(self) -> QueryError {
        let sqlstate = if self.sql_state.is_empty() {
            None
        } else {
            Some(self.sql_state)
        };
        QueryError {
            code: self.error_code,
            sqlstate,
            message: self.error_message,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}
