//! MySQL prepared statement (binary protocol) codec.
//!
//! Both halves of COM_STMT_PREPARE / COM_STMT_EXECUTE live here:
//!
//! - the client side used by the backend driver: command payload builders and
//!   the COM_STMT_PREPARE_OK parser
//! - the server side used by the command dispatcher: the prepare-OK encoder
//!   and the COM_STMT_EXECUTE parameter decoder
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: Client sends COM_STMT_PREPARE with SQL
//!    - Server returns statement ID, param count, column count
//!    - Server sends param column definitions (if any)
//!    - Server sends result column definitions (if any)
//!
//! 2. **Execute**: Client sends COM_STMT_EXECUTE with statement ID + binary params
//!    - Server returns result set (binary protocol) or OK packet
//!
//! 3. **Close**: Client sends COM_STMT_CLOSE with statement ID
//!    - No server response
//!
//! # References
//!
//! - [COM_STMT_PREPARE](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_stmt_prepare.html)
//! - [COM_STMT_EXECUTE](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_stmt_execute.html)

#![allow(clippy::cast_possible_truncation)]

use sqlshim_core::error::{QueryError, codes};
use sqlshim_core::{Error, Value};

use super::{Command, PacketReader, PacketWriter};
use crate::types::FieldType;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Unique statement identifier (used in execute/close)
    pub statement_id: u32,
    /// Number of columns in result set (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of parameters (placeholders) in the SQL
    pub num_params: u16,
    /// Number of warnings generated during prepare
    pub warnings: u16,
}

impl StmtPrepareOk {
    /// Encode the COM_STMT_PREPARE_OK payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(12);
        writer.write_u8(0x00);
        writer.write_u32_le(self.statement_id);
        writer.write_u16_le(self.num_columns);
        writer.write_u16_le(self.num_params);
        writer.write_u8(0x00);
        writer.write_u16_le(self.warnings);
        writer.into_bytes()
    }
}

/// Build a COM_STMT_PREPARE payload.
pub fn build_stmt_prepare_packet(sql: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + sql.len());
    writer.write_u8(Command::StmtPrepare as u8);
    writer.write_bytes(sql);
    writer.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// The execute packet format is:
/// - Command byte (0x17)
/// - Statement ID (4 bytes, little-endian)
/// - Flags (1 byte): 0x00 = no cursor
/// - Iteration count (4 bytes, always 1)
/// - NULL bitmap (if num_params > 0)
/// - New params bound flag (1 byte)
/// - Parameter types and values (if new_params_bound = 1)
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(64 + params.len() * 16);

    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    // CURSOR_TYPE_NO_CURSOR
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);

        // New params bound: we always send types
        writer.write_u8(1);

        for param in params {
            writer.write_u8(value_to_field_type(param) as u8);
            writer.write_u8(if param.is_unsigned() { 0x80 } else { 0x00 });
        }

        for param in params {
            encode_binary_param(&mut writer, param);
        }
    }

    writer.into_bytes()
}

/// Build a COM_STMT_CLOSE payload. The server does not answer it.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(Command::StmtClose as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Build a COM_STMT_RESET payload.
pub fn build_stmt_reset_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(Command::StmtReset as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Parse a COM_STMT_PREPARE_OK response.
///
/// # Format
///
/// - Status: 0x00 (1 byte)
/// - Statement ID (4 bytes)
/// - Number of columns (2 bytes)
/// - Number of parameters (2 bytes)
/// - Reserved: 0x00 (1 byte)
/// - Warning count (2 bytes)
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    if data.len() < 12 || data[0] != 0x00 {
        return None;
    }

    Some(StmtPrepareOk {
        statement_id: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
        num_columns: u16::from_le_bytes([data[5], data[6]]),
        num_params: u16::from_le_bytes([data[7], data[8]]),
        warnings: u16::from_le_bytes([data[10], data[11]]),
    })
}

fn value_to_field_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::TinyInt(_) | Value::UTinyInt(_) => FieldType::Tiny,
        Value::SmallInt(_) | Value::USmallInt(_) => FieldType::Short,
        Value::Int(_) | Value::UInt(_) => FieldType::Long,
        Value::BigInt(_) | Value::UBigInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Bytes(_) => FieldType::VarString,
    }
}

fn encode_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        // Carried by the NULL bitmap
        Value::Null => {}
        Value::TinyInt(v) => writer.write_u8(*v as u8),
        Value::UTinyInt(v) => writer.write_u8(*v),
        Value::SmallInt(v) => writer.write_u16_le(*v as u16),
        Value::USmallInt(v) => writer.write_u16_le(*v),
        Value::Int(v) => writer.write_u32_le(*v as u32),
        Value::UInt(v) => writer.write_u32_le(*v),
        Value::BigInt(v) => writer.write_u64_le(*v as u64),
        Value::UBigInt(v) => writer.write_u64_le(*v),
        Value::Float(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::Double(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
    }
}

/// Fixed header of a COM_STMT_EXECUTE request, command byte excluded.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteHeader<'a> {
    pub statement_id: u32,
    pub flags: u8,
    pub iteration_count: u32,
    /// NULL bitmap, new-params-bound flag, types and values
    pub params: &'a [u8],
}

/// Parse the fixed part of a COM_STMT_EXECUTE request.
pub fn parse_execute_header(data: &[u8]) -> Result<ExecuteHeader<'_>, Error> {
    let mut reader = PacketReader::new(data);
    let statement_id = reader.read_u32_le().ok_or_else(malformed_packet)?;
    let flags = reader.read_u8().ok_or_else(malformed_packet)?;
    let iteration_count = reader.read_u32_le().ok_or_else(malformed_packet)?;
    Ok(ExecuteHeader {
        statement_id,
        flags,
        iteration_count,
        params: reader.read_rest(),
    })
}

/// Decode COM_STMT_EXECUTE parameters into `args`.
///
/// `param_types` holds the (type, flag) pairs last sent for this statement;
/// it is replaced when the client sets new-params-bound and reused
/// otherwise. Parameters marked in `long_data` were supplied through
/// COM_STMT_SEND_LONG_DATA and carry no value bytes.
pub fn bind_params(
    data: &[u8],
    args: &mut [Value],
    param_types: &mut Option<Vec<u8>>,
    long_data: &[bool],
) -> Result<(), Error> {
    let num_params = args.len();
    if num_params == 0 {
        return Ok(());
    }

    let mut reader = PacketReader::new(data);
    let null_bitmap = reader.read_bytes(num_params.div_ceil(8)).ok_or_else(malformed_packet)?;

    let new_params_bound = reader.read_u8().ok_or_else(malformed_packet)?;
    if new_params_bound == 1 {
        let types = reader.read_bytes(num_params * 2).ok_or_else(malformed_packet)?;
        *param_types = Some(types.to_vec());
    }
    let types = param_types.as_deref().ok_or_else(malformed_packet)?;
    if types.len() < num_params * 2 {
        return Err(malformed_packet());
    }

    for (i, arg) in args.iter_mut().enumerate() {
        if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
            *arg = Value::Null;
            continue;
        }
        if long_data.get(i).copied().unwrap_or(false) {
            continue;
        }

        let type_code = types[i * 2];
        let unsigned = types[i * 2 + 1] & 0x80 != 0;
        let field_type = FieldType::try_from_u8(type_code).ok_or_else(|| unknown_type(type_code))?;
        *arg = decode_binary_param(&mut reader, field_type, unsigned)
            .ok_or_else(|| unknown_type(type_code))??;
    }

    Ok(())
}

/// `None` if the type has no binary parameter encoding.
fn decode_binary_param(
    reader: &mut PacketReader<'_>,
    field_type: FieldType,
    unsigned: bool,
) -> Option<Result<Value, Error>> {
    let value = match field_type {
        FieldType::Null => Some(Value::Null),
        FieldType::Tiny => reader.read_u8().map(|v| {
            if unsigned {
                Value::UTinyInt(v)
            } else {
                Value::TinyInt(v as i8)
            }
        }),
        FieldType::Short | FieldType::Year => reader.read_u16_le().map(|v| {
            if unsigned {
                Value::USmallInt(v)
            } else {
                Value::SmallInt(v as i16)
            }
        }),
        FieldType::Int24 | FieldType::Long => reader.read_u32_le().map(|v| {
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i32)
            }
        }),
        FieldType::LongLong => reader.read_u64_le().map(|v| {
            if unsigned {
                Value::UBigInt(v)
            } else {
                Value::BigInt(v as i64)
            }
        }),
        FieldType::Float => reader.read_u32_le().map(|bits| Value::Float(f32::from_bits(bits))),
        FieldType::Double => reader
            .read_u64_le()
            .map(|bits| Value::Double(f64::from_bits(bits))),
        t if t.is_lenenc_param() => reader
            .read_lenenc_field()
            .map(|field| field.map_or(Value::Null, |b| Value::Bytes(b.to_vec()))),
        _ => return None,
    };
    Some(value.ok_or_else(malformed_packet))
}

/// ER_MALFORMED_PACKET, raised for truncated or inconsistent command payloads.
pub fn malformed_packet() -> Error {
    Error::Query(QueryError::with_default_state(
        codes::ER_MALFORMED_PACKET,
        "Malformed communication packet.",
    ))
}

fn unknown_type(code: u8) -> Error {
    Error::Custom(format!("Stmt Unknown FieldType {}", code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute_params(payload: &[u8]) -> &[u8] {
        // command byte + id + flags + iteration count
        &payload[10..]
    }

    #[test]
    fn test_build_stmt_prepare_packet() {
        let payload = build_stmt_prepare_packet(b"SELECT * FROM users WHERE id = ?");
        assert_eq!(payload[0], Command::StmtPrepare as u8);
        assert_eq!(&payload[1..], b"SELECT * FROM users WHERE id = ?");
    }

    #[test]
    fn test_build_stmt_close_packet() {
        let payload = build_stmt_close_packet(42);
        assert_eq!(payload, vec![Command::StmtClose as u8, 42, 0, 0, 0]);
        assert_eq!(build_stmt_reset_packet(7)[0], Command::StmtReset as u8);
    }

    #[test]
    fn test_prepare_ok_encode_parse() {
        let ok = StmtPrepareOk {
            statement_id: 1,
            num_columns: 3,
            num_params: 2,
            warnings: 0,
        };
        let data = ok.encode();
        assert_eq!(
            data,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(parse_stmt_prepare_ok(&data), Some(ok));

        assert!(parse_stmt_prepare_ok(&[0x00, 0x01]).is_none());
        let mut bad = data;
        bad[0] = 0xFF;
        assert!(parse_stmt_prepare_ok(&bad).is_none());
    }

    #[test]
    fn test_execute_header() {
        let payload = build_stmt_execute_packet(9, &[]);
        let header = parse_execute_header(&payload[1..]).unwrap();
        assert_eq!(header.statement_id, 9);
        assert_eq!(header.flags, 0);
        assert_eq!(header.iteration_count, 1);
        assert!(header.params.is_empty());

        assert!(parse_execute_header(&[1, 0, 0]).is_err());
    }

    #[test]
    fn test_bind_params_from_client_encoding() {
        let params = vec![
            Value::Int(-42),
            Value::UBigInt(u64::MAX),
            Value::Null,
            Value::from("hello"),
            Value::Double(2.5),
            Value::UTinyInt(200),
        ];
        let payload = build_stmt_execute_packet(1, &params);

        let mut args = vec![Value::Null; params.len()];
        let mut types = None;
        bind_params(execute_params(&payload), &mut args, &mut types, &[]).unwrap();
        assert_eq!(args, params);
        assert_eq!(types.as_ref().map(Vec::len), Some(12));
    }

    #[test]
    fn test_bind_params_reuses_previous_types() {
        let payload = build_stmt_execute_packet(1, &[Value::Int(1)]);
        let mut args = vec![Value::Null];
        let mut types = None;
        bind_params(execute_params(&payload), &mut args, &mut types, &[]).unwrap();

        // null bitmap, new-params-bound = 0, value only
        let data = [0x00, 0x00, 7, 0, 0, 0];
        bind_params(&data, &mut args, &mut types, &[]).unwrap();
        assert_eq!(args, vec![Value::Int(7)]);

        // no stored types at all is malformed
        let mut fresh = None;
        let err = bind_params(&data, &mut args, &mut fresh, &[]).unwrap_err();
        assert_eq!(err.mysql_code(), Some(codes::ER_MALFORMED_PACKET));
    }

    #[test]
    fn test_bind_params_errors() {
        let mut args = vec![Value::Null];
        let mut types = None;

        // unknown type code
        let data = [0x00, 0x01, 0x20, 0x00, 1];
        let err = bind_params(&data, &mut args, &mut types, &[]).unwrap_err();
        assert_eq!(err.to_string(), "Stmt Unknown FieldType 32");

        // JSON has no parameter encoding
        let data = [0x00, 0x01, 0xF5, 0x00, 1, b'1'];
        assert!(bind_params(&data, &mut args, &mut None, &[]).is_err());

        // LONGLONG with only 4 value bytes
        let data = [0x00, 0x01, 0x08, 0x00, 1, 2, 3, 4];
        let err = bind_params(&data, &mut args, &mut None, &[]).unwrap_err();
        assert_eq!(err.mysql_code(), Some(codes::ER_MALFORMED_PACKET));
    }

    #[test]
    fn test_bind_params_null_and_long_data() {
        let mut args = vec![Value::Bytes(b"streamed".to_vec()), Value::Int(5)];
        // param 0 came from long data, param 1 is NULL in the bitmap
        let data = [0b10, 0x01, 0xFC, 0x00, 0x03, 0x00];
        bind_params(&data, &mut args, &mut None, &[true, false]).unwrap();
        assert_eq!(args, vec![Value::Bytes(b"streamed".to_vec()), Value::Null]);
    }

    #[test]
    fn test_bind_params_lenenc_null() {
        let mut args = vec![Value::Int(1)];
        let data = [0x00, 0x01, 0xFD, 0x00, 0xFB];
        bind_params(&data, &mut args, &mut None, &[]).unwrap();
        assert_eq!(args, vec![Value::Null]);
    }
}
