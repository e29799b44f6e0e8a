//! Per-connection command handler.

use sqlshim_core::error::{QueryError, codes};
use sqlshim_core::{Error, Result, Value};

use crate::backend::QueryResult;
use crate::types::ColumnDef;

/// Sink for the commands a [`Conn`](super::Conn) dispatches.
///
/// One handler instance serves exactly one client connection, so methods
/// take `&mut self` and need no internal locking.
pub trait Handler: Send {
    /// Backend state attached to a prepared statement, released once
    /// through [`handle_stmt_close`](Handler::handle_stmt_close).
    type StmtContext: Send;

    /// Switch the default database. Also called during the handshake, before
    /// authentication, when the client names a database.
    fn use_db(&mut self, db: &str) -> Result<()>;

    /// Run a COM_QUERY. `query` holds the statement bytes as received, in
    /// the client's character set.
    fn handle_query(&mut self, query: &[u8], current_db: &str, connection_id: u32)
    -> Result<QueryResult>;

    fn handle_field_list(&mut self, table: &str, wildcard: &str) -> Result<Vec<ColumnDef>>;

    /// Prepare `query`, returning its parameter count, column count and
    /// statement context.
    fn handle_stmt_prepare(&mut self, query: &[u8]) -> Result<(u16, u16, Self::StmtContext)>;

    fn handle_stmt_execute(
        &mut self,
        context: &mut Self::StmtContext,
        query: &[u8],
        args: &[Value],
    ) -> Result<QueryResult>;

    fn handle_stmt_close(&mut self, context: Self::StmtContext) -> Result<()>;

    fn handle_ping(&mut self) -> Result<()> {
        Ok(())
    }

    /// Commands without a dedicated hook, including COM_SET_OPTION.
    fn handle_other_command(&mut self, cmd: u8, _data: &[u8]) -> Result<()> {
        Err(unsupported_command(cmd))
    }

    /// Runs once after the client authenticated and received its OK.
    fn authenticated(&mut self, _capability: u32) -> Result<()> {
        Ok(())
    }

    /// Replication support, if this handler offers it.
    fn replication(&mut self) -> Option<&mut dyn ReplicationHandler> {
        None
    }
}

/// Raw binlog event payloads, streamed to a replica in order.
pub type BinlogStream = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// COM_BINLOG_DUMP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDumpRequest {
    pub position: u32,
    pub flags: u16,
    pub server_id: u32,
    pub file_name: String,
}

/// COM_BINLOG_DUMP_GTID request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDumpGtidRequest {
    pub flags: u16,
    pub server_id: u32,
    pub file_name: String,
    pub position: u64,
    /// Encoded GTID set
    pub gtid_data: Vec<u8>,
}

/// Optional capability for handlers that can act as a replication source.
pub trait ReplicationHandler {
    /// COM_REGISTER_SLAVE; the raw payload after the command byte.
    fn register_slave(&mut self, data: &[u8]) -> Result<()>;

    fn binlog_dump(&mut self, request: BinlogDumpRequest) -> Result<BinlogStream>;

    fn binlog_dump_gtid(&mut self, request: BinlogDumpGtidRequest) -> Result<BinlogStream>;
}

/// ER_UNKNOWN_ERROR for a command nobody handles.
pub fn unsupported_command(cmd: u8) -> Error {
    Error::Query(QueryError::with_default_state(
        codes::ER_UNKNOWN_ERROR,
        format!("command {} is not supported now", cmd),
    ))
}
