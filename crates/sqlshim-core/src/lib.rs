//! Core types and traits for the SQL shim.
//!
//! This crate holds the pieces shared between the wire protocol layer and
//! whatever supplies policy:
//!
//! - `Error` taxonomy with MySQL error numbers
//! - `Value` for bound statement arguments, `FieldValue` for decoded fields
//! - `Observer` trait consulted for every query
//! - `CredentialProvider` trait used during client authentication

pub mod credential;
pub mod error;
pub mod observer;
pub mod value;

pub use credential::{CredentialProvider, InMemoryCredentialProvider};
pub use error::{Error, Result};
pub use observer::{DatabaseType, Disposition, Observer, PassthroughObserver, TransformSummary};
pub use value::{FieldValue, Value};
