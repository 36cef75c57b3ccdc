//! Foundation types for blobdb.
//!
//! Every other blobdb crate depends on `blobdb-types`.
//!
//! # Key Types
//!
//! - [`BlobId`] -- Content-addressed identifier (the raw digest bytes of a BLOB)
//! - [`TxnId`] -- Identifier of a database transaction, as allocated by the journal

pub mod error;
pub mod id;
pub mod txn;

pub use error::TypeError;
pub use id::BlobId;
pub use txn::TxnId;
