//! Response encoding.
//!
//! Every dispatched command produces exactly one [`Response`]; the encoder
//! maps each variant onto its wire packets.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use sqlshim_core::error::codes;
use sqlshim_core::{Error, FieldValue, Result};

use super::handler::BinlogStream;
use crate::backend::{QueryResult, ResultSet};
use crate::protocol::{
    EOF_HEADER, ERR_HEADER, OK_HEADER, OkPacket, PacketStream, PacketWriter, StmtPrepareOk,
};
use crate::types::{ColumnDef, FieldType, encode_text_row};

/// Outcome of one dispatched command.
pub enum Response {
    /// Nothing is written (COM_QUIT, COM_STMT_CLOSE, COM_STMT_SEND_LONG_DATA)
    None,
    Eof,
    Error(Error),
    /// Bare OK with no affected rows
    Ok,
    /// OK summary or result set, as returned by the handler
    Result(QueryResult),
    /// COM_FIELD_LIST column definitions
    FieldList(Vec<ColumnDef>),
    /// A single text row
    FieldValues(Vec<FieldValue>),
    Prepared {
        statement_id: u32,
        params: u16,
        columns: u16,
    },
    BinlogStream(BinlogStream),
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::None => f.write_str("None"),
            Response::Eof => f.write_str("Eof"),
            Response::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Response::Ok => f.write_str("Ok"),
            Response::Result(r) => f.debug_tuple("Result").field(r).finish(),
            Response::FieldList(defs) => f.debug_tuple("FieldList").field(defs).finish(),
            Response::FieldValues(values) => f.debug_tuple("FieldValues").field(values).finish(),
            Response::Prepared {
                statement_id,
                params,
                columns,
            } => f
                .debug_struct("Prepared")
                .field("statement_id", statement_id)
                .field("params", params)
                .field("columns", columns)
                .finish(),
            Response::BinlogStream(_) => f.write_str("BinlogStream"),
        }
    }
}

impl From<Result<QueryResult>> for Response {
    fn from(result: Result<QueryResult>) -> Self {
        match result {
            Ok(r) => Response::Result(r),
            Err(e) => Response::Error(e),
        }
    }
}

impl Response {
    /// Write the response. `status` is the connection's server status.
    pub fn write_to<S: Read + Write>(self, stream: &mut PacketStream<S>, status: u16) -> Result<()> {
        match self {
            Response::None => Ok(()),
            Response::Eof => stream.write_packet(&eof_payload(0, status)),
            Response::Error(e) => stream.write_packet(&error_payload(&e)),
            Response::Ok => stream.write_packet(&ok_payload(&OkPacket {
                affected_rows: 0,
                last_insert_id: 0,
                status_flags: status,
                warnings: 0,
                info: String::new(),
            })),
            Response::Result(result) => write_query_result(stream, result, status),
            Response::FieldList(defs) => {
                for def in &defs {
                    stream.write_packet(&def.encode())?;
                }
                stream.write_packet(&eof_payload(0, status))
            }
            Response::FieldValues(values) => {
                let text: Vec<_> = values.iter().map(FieldValue::to_text).collect();
                stream.write_packet(&encode_text_row(&text))
            }
            Response::Prepared {
                statement_id,
                params,
                columns,
            } => write_prepared(stream, statement_id, params, columns, status),
            Response::BinlogStream(events) => write_binlog_stream(stream, events, status),
        }
    }
}

/// OK packet payload (protocol 4.1).
pub fn ok_payload(ok: &OkPacket) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(11 + ok.info.len());
    writer.write_u8(OK_HEADER);
    writer.write_lenenc_int(ok.affected_rows);
    writer.write_lenenc_int(ok.last_insert_id);
    writer.write_u16_le(ok.status_flags);
    writer.write_u16_le(ok.warnings);
    writer.write_bytes(ok.info.as_bytes());
    writer.into_bytes()
}

pub fn eof_payload(warnings: u16, status: u16) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(EOF_HEADER);
    writer.write_u16_le(warnings);
    writer.write_u16_le(status);
    writer.into_bytes()
}

pub fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(9 + message.len());
    writer.write_u8(ERR_HEADER);
    writer.write_u16_le(code);
    writer.write_u8(b'#');
    writer.write_fixed_string(sqlstate, 5);
    writer.write_bytes(message.as_bytes());
    writer.into_bytes()
}

/// ERR payload for any error. Errors without a MySQL number become
/// ER_UNKNOWN_ERROR carrying their display text.
pub fn error_payload(err: &Error) -> Vec<u8> {
    match err {
        Error::Query(q) => err_payload(
            q.code,
            q.sqlstate
                .as_deref()
                .unwrap_or_else(|| codes::default_sqlstate(q.code)),
            &q.message,
        ),
        Error::AccessDenied(denied) => err_payload(
            codes::ER_ACCESS_DENIED_ERROR,
            codes::default_sqlstate(codes::ER_ACCESS_DENIED_ERROR),
            &denied.to_string(),
        ),
        other => err_payload(
            codes::ER_UNKNOWN_ERROR,
            codes::default_sqlstate(codes::ER_UNKNOWN_ERROR),
            &other.to_string(),
        ),
    }
}

/// AuthMoreData payload.
pub fn auth_more_data_payload(data: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + data.len());
    writer.write_u8(crate::protocol::MORE_DATA_HEADER);
    writer.write_bytes(data);
    writer.into_bytes()
}

/// AuthSwitchRequest payload.
pub fn auth_switch_payload(plugin: &str, salt: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(2 + plugin.len() + salt.len() + 1);
    writer.write_u8(EOF_HEADER);
    writer.write_null_string(plugin);
    writer.write_null_bytes(salt);
    writer.into_bytes()
}

fn pick_status(reported: u16, status: u16) -> u16 {
    if reported == 0 { status } else { reported }
}

fn write_query_result<S: Read + Write>(
    stream: &mut PacketStream<S>,
    result: QueryResult,
    status: u16,
) -> Result<()> {
    match result.result_set {
        None => stream.write_packet(&ok_payload(&OkPacket {
            affected_rows: result.affected_rows,
            last_insert_id: result.last_insert_id,
            status_flags: pick_status(result.status_flags, status),
            warnings: result.warnings,
            info: result.info,
        })),
        Some(rs) => write_result_set(stream, &rs, status),
    }
}

fn write_result_set<S: Read + Write>(
    stream: &mut PacketStream<S>,
    rs: &ResultSet,
    status: u16,
) -> Result<()> {
    let mut writer = PacketWriter::with_capacity(9);
    writer.write_lenenc_int(rs.columns.len() as u64);
    stream.write_packet(writer.as_bytes())?;

    for col in &rs.columns {
        stream.write_packet(&col.encode())?;
    }
    stream.write_packet(&eof_payload(0, status))?;

    for row in &rs.rows {
        stream.write_packet(row)?;
    }

    if !rs.streaming {
        stream.write_packet(&eof_payload(rs.warnings, pick_status(rs.status_flags, status)))?;
    }
    Ok(())
}

fn write_prepared<S: Read + Write>(
    stream: &mut PacketStream<S>,
    statement_id: u32,
    params: u16,
    columns: u16,
    status: u16,
) -> Result<()> {
    let ok = StmtPrepareOk {
        statement_id,
        num_columns: columns,
        num_params: params,
        warnings: 0,
    };
    stream.write_packet(&ok.encode())?;

    if params > 0 {
        let param = ColumnDef::new("?", FieldType::VarString).encode();
        for _ in 0..params {
            stream.write_packet(&param)?;
        }
        stream.write_packet(&eof_payload(0, status))?;
    }

    if columns > 0 {
        let column = ColumnDef::new("", FieldType::Decimal).encode();
        for _ in 0..columns {
            stream.write_packet(&column)?;
        }
        stream.write_packet(&eof_payload(0, status))?;
    }
    Ok(())
}

fn write_binlog_stream<S: Read + Write>(
    stream: &mut PacketStream<S>,
    events: BinlogStream,
    status: u16,
) -> Result<()> {
    for event in events {
        match event {
            Ok(event) => {
                let mut payload = Vec::with_capacity(1 + event.len());
                payload.push(OK_HEADER);
                payload.extend_from_slice(&event);
                stream.write_packet(&payload)?;
            }
            Err(e) => {
                tracing::warn!(error = %e, "binlog stream failed");
                return stream.write_packet(&error_payload(&e));
            }
        }
    }
    stream.write_packet(&eof_payload(0, status))
}
