//! Command dispatch and the prepared statement lifecycle.

use std::io::{Read, Write};

use sqlshim_core::error::{ConnectionError, ConnectionErrorKind, QueryError, codes};
use sqlshim_core::{CredentialProvider, Error, Result};

use super::conn::Conn;
use super::handler::{BinlogDumpGtidRequest, BinlogDumpRequest, Handler, ReplicationHandler};
use super::response::Response;
use super::stmt::Stmt;
use crate::protocol::{Command, PacketReader, bind_params, malformed_packet, parse_execute_header};

impl<S, H> Conn<S, H>
where
    S: Read + Write,
    H: Handler + CredentialProvider,
{
    /// Read one command, dispatch it and write its response.
    ///
    /// Errors that leave the connection unusable (I/O, protocol, malformed
    /// packets) are reported to the client and close the connection; other
    /// errors only produce an ERR packet.
    pub fn handle_command(&mut self) -> Result<()> {
        let data = match self.stream.read_packet() {
            Ok(data) => data,
            Err(e) => {
                self.closed = true;
                return Err(e);
            }
        };

        let response = self.dispatch(&data);

        let fatal = match &response {
            Response::Error(e) if is_fatal(e) => {
                tracing::warn!(connection_id = self.connection_id, error = %e, "closing connection");
                Some(e.to_string())
            }
            Response::Error(e) => {
                tracing::debug!(connection_id = self.connection_id, error = %e, "command failed");
                None
            }
            _ => None,
        };

        let written = response.write_to(&mut self.stream, self.status);
        self.stream.reset_sequence();

        if let Err(e) = written {
            self.closed = true;
            return Err(e);
        }
        if let Some(message) = fatal {
            self.closed = true;
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message,
                source: None,
            }));
        }
        Ok(())
    }

    fn dispatch(&mut self, data: &[u8]) -> Response {
        let Some((&cmd, payload)) = data.split_first() else {
            return Response::Error(malformed_packet());
        };
        let command = Command::from_u8(cmd);
        tracing::debug!(connection_id = self.connection_id, command = ?command, "dispatch");

        match command {
            Some(Command::Quit) => {
                self.closed = true;
                Response::None
            }
            Some(Command::Query) => self
                .handler
                .handle_query(payload, &self.current_db, self.connection_id)
                .into(),
            Some(Command::Ping) => ok_or_error(self.handler.handle_ping()),
            Some(Command::InitDb) => {
                let db = match identifier(payload, "database name") {
                    Ok(db) => db,
                    Err(e) => return Response::Error(e),
                };
                match self.handler.use_db(db) {
                    Ok(()) => {
                        self.current_db = db.to_string();
                        Response::Ok
                    }
                    Err(e) => Response::Error(e),
                }
            }
            Some(Command::FieldList) => {
                let (table, wildcard) = match payload.iter().position(|&b| b == 0) {
                    Some(nul) => (&payload[..nul], &payload[nul + 1..]),
                    None => (payload, &[][..]),
                };
                let names = identifier(table, "table name")
                    .and_then(|table| Ok((table, identifier(wildcard, "field wildcard")?)));
                let result = names
                    .and_then(|(table, wildcard)| self.handler.handle_field_list(table, wildcard));
                match result {
                    Ok(defs) => Response::FieldList(defs),
                    Err(e) => Response::Error(e),
                }
            }
            Some(Command::StmtPrepare) => self.handle_stmt_prepare(payload),
            Some(Command::StmtExecute) => self.handle_stmt_execute(payload),
            Some(Command::StmtSendLongData) => {
                self.handle_stmt_send_long_data(payload);
                Response::None
            }
            Some(Command::StmtReset) => self.handle_stmt_reset(payload),
            Some(Command::StmtClose) => {
                self.handle_stmt_close(payload);
                Response::None
            }
            Some(Command::SetOption) => match self.handler.handle_other_command(cmd, payload) {
                Ok(()) => Response::Eof,
                Err(e) => Response::Error(e),
            },
            Some(
                command @ (Command::RegisterSlave | Command::BinlogDump | Command::BinlogDumpGtid),
            ) if self.has_replication => match self.handler.replication() {
                Some(replication) => replicate(replication, command, payload),
                None => ok_or_error(self.handler.handle_other_command(cmd, payload)),
            },
            _ => ok_or_error(self.handler.handle_other_command(cmd, payload)),
        }
    }

    fn handle_stmt_prepare(&mut self, payload: &[u8]) -> Response {
        self.last_stmt_id += 1;
        let id = self.last_stmt_id;

        match self.handler.handle_stmt_prepare(payload) {
            Ok((params, columns, context)) => {
                tracing::debug!(
                    connection_id = self.connection_id,
                    statement_id = id,
                    params,
                    columns,
                    "statement prepared"
                );
                self.stmts
                    .insert(id, Stmt::new(id, payload, params, columns, context));
                Response::Prepared {
                    statement_id: id,
                    params,
                    columns,
                }
            }
            Err(e) => Response::Error(e),
        }
    }

    fn handle_stmt_execute(&mut self, payload: &[u8]) -> Response {
        let header = match parse_execute_header(payload) {
            Ok(header) => header,
            Err(e) => return Response::Error(e),
        };

        let Some(stmt) = self.stmts.get_mut(&header.statement_id) else {
            return Response::Error(unknown_stmt(header.statement_id, "stmt_execute"));
        };

        if header.flags != 0 {
            return Response::Error(Error::Query(QueryError::with_default_state(
                codes::ER_UNKNOWN_ERROR,
                format!("unsupported flag {}", header.flags),
            )));
        }

        let response = match bind_params(
            header.params,
            &mut stmt.args,
            &mut stmt.param_types,
            &stmt.long_data,
        ) {
            Ok(()) => self
                .handler
                .handle_stmt_execute(&mut stmt.context, &stmt.query, &stmt.args)
                .into(),
            Err(e) => Response::Error(e),
        };

        stmt.reset_params();
        response
    }

    /// COM_STMT_SEND_LONG_DATA never answers, not even with an error.
    fn handle_stmt_send_long_data(&mut self, payload: &[u8]) {
        if payload.len() < 6 {
            return;
        }
        let mut reader = PacketReader::new(payload);
        let (Some(id), Some(param_id)) = (reader.read_u32_le(), reader.read_u16_le()) else {
            return;
        };
        if let Some(stmt) = self.stmts.get_mut(&id) {
            stmt.append_long_data(param_id, reader.read_rest());
        }
    }

    fn handle_stmt_reset(&mut self, payload: &[u8]) -> Response {
        let Some(id) = PacketReader::new(payload).read_u32_le() else {
            return Response::Error(malformed_packet());
        };
        match self.stmts.get_mut(&id) {
            Some(stmt) => {
                stmt.reset_params();
                Response::Ok
            }
            None => Response::Error(unknown_stmt(id, "stmt_reset")),
        }
    }

    /// COM_STMT_CLOSE never answers.
    fn handle_stmt_close(&mut self, payload: &[u8]) {
        let Some(id) = PacketReader::new(payload).read_u32_le() else {
            return;
        };
        let Some(stmt) = self.stmts.remove(&id) else {
            return;
        };
        if let Err(e) = self.handler.handle_stmt_close(stmt.context) {
            tracing::warn!(
                connection_id = self.connection_id,
                statement_id = id,
                error = %e,
                "failed to close statement"
            );
        }
    }
}

fn replicate(replication: &mut dyn ReplicationHandler, command: Command, payload: &[u8]) -> Response {
    let result = match command {
        Command::RegisterSlave => replication.register_slave(payload).map(|()| Response::Ok),
        Command::BinlogDump => parse_binlog_dump(payload)
            .and_then(|request| replication.binlog_dump(request))
            .map(Response::BinlogStream),
        _ => parse_binlog_dump_gtid(payload)
            .and_then(|request| replication.binlog_dump_gtid(request))
            .map(Response::BinlogStream),
    };
    result.unwrap_or_else(Response::Error)
}

/// Parse a COM_BINLOG_DUMP payload (command byte excluded).
pub fn parse_binlog_dump(data: &[u8]) -> Result<BinlogDumpRequest> {
    let mut reader = PacketReader::new(data);
    let position = reader.read_u32_le().ok_or_else(malformed_packet)?;
    let flags = reader.read_u16_le().ok_or_else(malformed_packet)?;
    let server_id = reader.read_u32_le().ok_or_else(malformed_packet)?;
    let file_name = reader.read_rest_string();
    Ok(BinlogDumpRequest {
        position,
        flags,
        server_id,
        file_name,
    })
}

/// Parse a COM_BINLOG_DUMP_GTID payload (command byte excluded).
pub fn parse_binlog_dump_gtid(data: &[u8]) -> Result<BinlogDumpGtidRequest> {
    let mut reader = PacketReader::new(data);
    let flags = reader.read_u16_le().ok_or_else(malformed_packet)?;
    let server_id = reader.read_u32_le().ok_or_else(malformed_packet)?;
    let name_len = reader.read_u32_le().ok_or_else(malformed_packet)? as usize;
    let file_name = reader.read_string(name_len).ok_or_else(malformed_packet)?;
    let position = reader.read_u64_le().ok_or_else(malformed_packet)?;
    let gtid_data = match reader.read_u32_le() {
        Some(len) => reader
            .read_bytes(len as usize)
            .ok_or_else(malformed_packet)?
            .to_vec(),
        None => Vec::new(),
    };
    Ok(BinlogDumpGtidRequest {
        flags,
        server_id,
        file_name,
        position,
        gtid_data,
    })
}

/// Names travel as UTF-8; anything else is refused rather than rewritten.
fn identifier<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| {
        Error::Query(QueryError::with_default_state(
            codes::ER_UNKNOWN_ERROR,
            format!("invalid {}: not valid UTF-8", what),
        ))
    })
}

fn ok_or_error(result: Result<()>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error(e),
    }
}

fn unknown_stmt(id: u32, command: &str) -> Error {
    Error::Query(QueryError::with_default_state(
        codes::ER_UNKNOWN_STMT_HANDLER,
        format!(
            "Unknown prepared statement handler ({}) given to {}",
            id, command
        ),
    ))
}

/// Errors after which the connection cannot continue. Arguments that fail
/// to decode (an unknown binary type code, say) only fail the command.
fn is_fatal(err: &Error) -> bool {
    err.is_connection_error() || err.mysql_code() == Some(codes::ER_MALFORMED_PACKET)
}
