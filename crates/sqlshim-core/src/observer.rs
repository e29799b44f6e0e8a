//! Query observer interface.
//!
//! The observer decides, per query, whether the proxy relays the backend's
//! answer untouched, filters it row by row, or refuses to run the statement
//! at all. Policy lives entirely behind this trait.

use serde::Serialize;

use crate::error::Result;

/// Wire dialect the query arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    MySql,
    Postgres,
}

/// What to do with a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Disposition {
    /// Execute verbatim and return the backend result unmodified.
    Passthrough,
    /// Execute verbatim, then filter and rewrite each returned row.
    TransformResponse,
    /// Do not touch the backend; answer with an error.
    AccessDenied,
}

/// Row counts reported once per observed query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    /// Rows handed to the row transform.
    pub selector_rows: u64,
    /// Rows admitted and sent to the client.
    pub returned_rows: u64,
    /// Rows dropped by the row transform.
    pub denied_rows: u64,
}

/// Policy hook consulted on every COM_QUERY.
///
/// `Transform` is the opaque per-query context produced by
/// [`handle_query`](Observer::handle_query). The proxy passes it back by
/// reference for every row and the summary, then hands ownership to
/// [`cleanup_transformer_execution`](Observer::cleanup_transformer_execution)
/// exactly once.
pub trait Observer: Send + Sync {
    type Transform: Send;

    fn handle_query(
        &self,
        db_type: DatabaseType,
        query: &str,
        current_db: &str,
        connection_id: u32,
    ) -> Result<(Disposition, Self::Transform)>;

    /// Decide whether a row reaches the client.
    ///
    /// `values` holds the text rendering of each field (`None` for NULL) and
    /// may be rewritten in place; admitted rows are re-encoded from it.
    fn transform_data_row(
        &self,
        column_names: &[String],
        values: &mut [Option<Vec<u8>>],
        transform: &Self::Transform,
        returned_so_far: u64,
    ) -> Result<bool>;

    fn transform_summary(&self, transform: &Self::Transform, summary: TransformSummary);

    fn cleanup_transformer_execution(&self, transform: Self::Transform);

    fn notify_schema_selected(&self, db_name: &str);
}

/// Observer that lets every query through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughObserver;

impl Observer for PassthroughObserver {
    type Transform = ();

    fn handle_query(
        &self,
        _db_type: DatabaseType,
        _query: &str,
        _current_db: &str,
        _connection_id: u32,
    ) -> Result<(Disposition, ())> {
        Ok((Disposition::Passthrough, ()))
    }

    fn transform_data_row(
        &self,
        _column_names: &[String],
        _values: &mut [Option<Vec<u8>>],
        _transform: &(),
        _returned_so_far: u64,
    ) -> Result<bool> {
        Ok(true)
    }

    fn transform_summary(&self, _transform: &(), _summary: TransformSummary) {}

    fn cleanup_transformer_execution(&self, _transform: ()) {}

    fn notify_schema_selected(&self, db_name: &str) {
        tracing::debug!(db = db_name, "schema selected");
    }
}
