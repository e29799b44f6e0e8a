//! MySQL type system and column metadata.
//!
//! This module provides:
//! - MySQL field type codes
//! - Column definition packets, parsed from the backend and dumped to clients
//! - Text-protocol row decoding into typed fields and row re-encoding
//!
//! # MySQL Type System
//!
//! MySQL uses field type codes in result sets and binary protocol.
//! The encoding differs between text protocol (all strings) and
//! binary protocol (type-specific binary encoding).

#![allow(clippy::cast_possible_truncation)]

use sqlshim_core::{Error, FieldValue};

use crate::protocol::{PacketReader, PacketWriter};

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// DECIMAL (MYSQL_TYPE_DECIMAL)
    Decimal = 0x00,
    /// TINYINT (MYSQL_TYPE_TINY)
    Tiny = 0x01,
    /// SMALLINT (MYSQL_TYPE_SHORT)
    Short = 0x02,
    /// INT (MYSQL_TYPE_LONG)
    Long = 0x03,
    /// FLOAT (MYSQL_TYPE_FLOAT)
    Float = 0x04,
    /// DOUBLE (MYSQL_TYPE_DOUBLE)
    Double = 0x05,
    /// NULL (MYSQL_TYPE_NULL)
    Null = 0x06,
    /// TIMESTAMP (MYSQL_TYPE_TIMESTAMP)
    Timestamp = 0x07,
    /// BIGINT (MYSQL_TYPE_LONGLONG)
    LongLong = 0x08,
    /// MEDIUMINT (MYSQL_TYPE_INT24)
    Int24 = 0x09,
    /// DATE (MYSQL_TYPE_DATE)
    Date = 0x0A,
    /// TIME (MYSQL_TYPE_TIME)
    Time = 0x0B,
    /// DATETIME (MYSQL_TYPE_DATETIME)
    DateTime = 0x0C,
    /// YEAR (MYSQL_TYPE_YEAR)
    Year = 0x0D,
    /// NEWDATE (MYSQL_TYPE_NEWDATE) - internal use
    NewDate = 0x0E,
    /// VARCHAR (MYSQL_TYPE_VARCHAR)
    VarChar = 0x0F,
    /// BIT (MYSQL_TYPE_BIT)
    Bit = 0x10,
    /// TIMESTAMP2 (MYSQL_TYPE_TIMESTAMP2)
    Timestamp2 = 0x11,
    /// DATETIME2 (MYSQL_TYPE_DATETIME2)
    DateTime2 = 0x12,
    /// TIME2 (MYSQL_TYPE_TIME2)
    Time2 = 0x13,
    /// JSON (MYSQL_TYPE_JSON)
    Json = 0xF5,
    /// NEWDECIMAL (MYSQL_TYPE_NEWDECIMAL)
    NewDecimal = 0xF6,
    /// ENUM (MYSQL_TYPE_ENUM)
    Enum = 0xF7,
    /// SET (MYSQL_TYPE_SET)
    Set = 0xF8,
    /// TINYBLOB (MYSQL_TYPE_TINY_BLOB)
    TinyBlob = 0xF9,
    /// MEDIUMBLOB (MYSQL_TYPE_MEDIUM_BLOB)
    MediumBlob = 0xFA,
    /// LONGBLOB (MYSQL_TYPE_LONG_BLOB)
    LongBlob = 0xFB,
    /// BLOB (MYSQL_TYPE_BLOB)
    Blob = 0xFC,
    /// VARCHAR (MYSQL_TYPE_VAR_STRING)
    VarString = 0xFD,
    /// CHAR (MYSQL_TYPE_STRING)
    String = 0xFE,
    /// GEOMETRY (MYSQL_TYPE_GEOMETRY)
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type code, rejecting unknown codes.
    pub fn try_from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => return None,
        })
    }

    /// Parse a field type from column metadata; unknown codes read as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        Self::try_from_u8(value).unwrap_or(FieldType::String)
    }

    /// Check if this is an integer type.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// Check if this is a floating-point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    /// Types whose binary-protocol parameter value is a length-encoded string.
    #[must_use]
    pub const fn is_lenenc_param(self) -> bool {
        matches!(
            self,
            FieldType::Decimal
                | FieldType::NewDecimal
                | FieldType::VarChar
                | FieldType::Bit
                | FieldType::Enum
                | FieldType::Set
                | FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::VarString
                | FieldType::String
                | FieldType::Geometry
                | FieldType::Date
                | FieldType::NewDate
                | FieldType::Timestamp
                | FieldType::DateTime
                | FieldType::Time
        )
    }
}

/// Column definition flags the shim reads or sets.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const UNSIGNED: u16 = 32;
}

/// Column definition packet (Protocol::ColumnDefinition41).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Schema (database) name
    pub schema: Vec<u8>,
    /// Table name (or alias)
    pub table: Vec<u8>,
    /// Original table name
    pub org_table: Vec<u8>,
    /// Column name (or alias)
    pub name: Vec<u8>,
    /// Original column name
    pub org_name: Vec<u8>,
    /// Character set number
    pub charset: u16,
    /// Column length
    pub column_length: u32,
    /// Column type
    pub column_type: FieldType,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
    /// Default value, only present in COM_FIELD_LIST responses
    pub default_value: Option<Vec<u8>>,
}

impl ColumnDef {
    /// A bare column with the given name and type.
    pub fn new(name: impl Into<Vec<u8>>, column_type: FieldType) -> Self {
        Self {
            schema: Vec::new(),
            table: Vec::new(),
            org_table: Vec::new(),
            name: name.into(),
            org_name: Vec::new(),
            charset: 0,
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
            default_value: None,
        }
    }

    /// Column name as UTF-8 (lossy).
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Check if the column is unsigned.
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Parse a column definition packet.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut reader = PacketReader::new(data);
        let mut lenenc = |what: &str| {
            reader
                .read_lenenc_slice()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::protocol(format!("Missing {} in column definition", what)))
        };

        let _catalog = lenenc("catalog")?;
        let schema = lenenc("schema")?;
        let table = lenenc("table")?;
        let org_table = lenenc("org_table")?;
        let name = lenenc("name")?;
        let org_name = lenenc("org_name")?;

        // Length of fixed fields
        let _fixed_len = reader.read_lenenc_int();

        let charset = reader
            .read_u16_le()
            .ok_or_else(|| Error::protocol("Missing charset"))?;
        let column_length = reader
            .read_u32_le()
            .ok_or_else(|| Error::protocol("Missing column_length"))?;
        let column_type = FieldType::from_u8(
            reader
                .read_u8()
                .ok_or_else(|| Error::protocol("Missing column_type"))?,
        );
        let flags = reader
            .read_u16_le()
            .ok_or_else(|| Error::protocol("Missing flags"))?;
        let decimals = reader
            .read_u8()
            .ok_or_else(|| Error::protocol("Missing decimals"))?;

        // Filler, then the COM_FIELD_LIST default value if any
        reader.skip(2);
        let default_value = if reader.is_empty() {
            None
        } else {
            reader.read_lenenc_slice().map(<[u8]>::to_vec)
        };

        Ok(ColumnDef {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
            default_value,
        })
    }

    /// Encode the column definition packet payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(
            48 + self.schema.len()
                + self.table.len()
                + self.org_table.len()
                + self.name.len()
                + self.org_name.len(),
        );
        writer.write_lenenc_bytes(b"def");
        writer.write_lenenc_bytes(&self.schema);
        writer.write_lenenc_bytes(&self.table);
        writer.write_lenenc_bytes(&self.org_table);
        writer.write_lenenc_bytes(&self.name);
        writer.write_lenenc_bytes(&self.org_name);
        writer.write_u8(0x0c);
        writer.write_u16_le(self.charset);
        writer.write_u32_le(self.column_length);
        writer.write_u8(self.column_type as u8);
        writer.write_u16_le(self.flags);
        writer.write_u8(self.decimals);
        writer.write_zeros(2);
        if let Some(default) = &self.default_value {
            writer.write_lenenc_bytes(default);
        }
        writer.into_bytes()
    }
}

/// Decode a text-protocol row into typed fields.
pub fn decode_text_row(data: &[u8], columns: &[ColumnDef]) -> Result<Vec<FieldValue>, Error> {
    let mut reader = PacketReader::new(data);
    let mut values = Vec::with_capacity(columns.len());

    for col in columns {
        let field = reader
            .read_lenenc_field()
            .ok_or_else(|| Error::protocol(format!("Truncated row at column {}", col.name_str())))?;
        let value = match field {
            None => FieldValue::Null,
            Some(raw) => decode_text_value(col, raw)?,
        };
        values.push(value);
    }

    Ok(values)
}

fn decode_text_value(col: &ColumnDef, raw: &[u8]) -> Result<FieldValue, Error> {
    let parse_err = || {
        Error::protocol(format!(
            "Invalid {:?} value in column {}",
            col.column_type,
            col.name_str()
        ))
    };

    if col.column_type.is_integer() {
        let text = std::str::from_utf8(raw).map_err(|_| parse_err())?;
        return if col.is_unsigned() {
            text.parse().map(FieldValue::Unsigned).map_err(|_| parse_err())
        } else {
            text.parse().map(FieldValue::Signed).map_err(|_| parse_err())
        };
    }

    if col.column_type.is_float() {
        let text = std::str::from_utf8(raw).map_err(|_| parse_err())?;
        return text.parse().map(FieldValue::Float).map_err(|_| parse_err());
    }

    Ok(FieldValue::String(raw.to_vec()))
}

/// Encode a text-protocol row: NULL marker or length-encoded string per field.
pub fn encode_text_row(values: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(values.len() * 8);
    for value in values {
        writer.write_lenenc_field(value.as_deref());
    }
    writer.into_bytes()
}
