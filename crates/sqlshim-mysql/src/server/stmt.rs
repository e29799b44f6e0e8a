//! Server-side prepared statement state.

use sqlshim_core::Value;

/// A statement prepared by a client on this connection.
#[derive(Debug)]
pub struct Stmt<C> {
    pub id: u32,
    /// Statement text exactly as the client sent it
    pub query: Vec<u8>,
    pub params: u16,
    pub columns: u16,
    /// Bound arguments, one per parameter
    pub args: Vec<Value>,
    /// Parameters filled through COM_STMT_SEND_LONG_DATA since the last reset
    pub long_data: Vec<bool>,
    /// (type, flag) pairs from the last execute that bound new parameters
    pub param_types: Option<Vec<u8>>,
    pub context: C,
}

impl<C> Stmt<C> {
    pub fn new(id: u32, query: impl Into<Vec<u8>>, params: u16, columns: u16, context: C) -> Self {
        let mut stmt = Self {
            id,
            query: query.into(),
            params,
            columns,
            args: Vec::new(),
            long_data: Vec::new(),
            param_types: None,
            context,
        };
        stmt.reset_params();
        stmt
    }

    /// Clear bound arguments; the backend context is kept.
    pub fn reset_params(&mut self) {
        let n = usize::from(self.params);
        self.args = vec![Value::Null; n];
        self.long_data = vec![false; n];
    }

    /// Append a COM_STMT_SEND_LONG_DATA chunk.
    ///
    /// Ignored when `param_id` is out of range or the parameter already holds
    /// a non-byte value.
    pub fn append_long_data(&mut self, param_id: u16, chunk: &[u8]) {
        let idx = usize::from(param_id);
        let Some(arg) = self.args.get_mut(idx) else {
            return;
        };
        match arg {
            Value::Null => *arg = Value::Bytes(chunk.to_vec()),
            Value::Bytes(bytes) => bytes.extend_from_slice(chunk),
            _ => return,
        }
        self.long_data[idx] = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stmt_has_null_args() {
        let stmt = Stmt::new(1, "SELECT ?, ?", 2, 2, ());
        assert_eq!(stmt.args, vec![Value::Null, Value::Null]);
        assert_eq!(stmt.long_data, vec![false, false]);
    }

    #[test]
    fn test_append_long_data() {
        let mut stmt = Stmt::new(1, "INSERT INTO t VALUES (?)", 1, 0, ());
        stmt.append_long_data(0, b"hello ");
        stmt.append_long_data(0, b"world");
        assert_eq!(stmt.args[0], Value::Bytes(b"hello world".to_vec()));
        assert!(stmt.long_data[0]);
    }

    #[test]
    fn test_append_long_data_out_of_range_is_noop() {
        let mut stmt = Stmt::new(1, "SELECT ?", 1, 1, ());
        stmt.append_long_data(1, b"x");
        stmt.append_long_data(u16::MAX, b"x");
        assert_eq!(stmt.args, vec![Value::Null]);
        assert_eq!(stmt.long_data, vec![false]);
    }

    #[test]
    fn test_append_long_data_to_non_bytes_is_noop() {
        let mut stmt = Stmt::new(1, "SELECT ?", 1, 1, ());
        stmt.args[0] = Value::Int(5);
        stmt.append_long_data(0, b"x");
        assert_eq!(stmt.args[0], Value::Int(5));
        assert!(!stmt.long_data[0]);
    }

    #[test]
    fn test_reset_params() {
        let mut stmt = Stmt::new(1, "SELECT ?", 1, 1, ());
        stmt.append_long_data(0, b"x");
        stmt.param_types = Some(vec![0xfd, 0]);
        stmt.reset_params();
        assert_eq!(stmt.args, vec![Value::Null]);
        assert_eq!(stmt.long_data, vec![false]);
        assert!(stmt.param_types.is_some());
    }
}
