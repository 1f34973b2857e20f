//! # dojo-core: Operational-transform engine for ScriptDojo rooms
//!
//! Socket-free building blocks of the collaborative editor:
//!
//! ```text
//!  Operation ──► transform::rebase ──► OperationLog::append ──► Document
//!   (client,       (over ops since       (next revision,          (text at
//!    base rev)      base revision)        atomic with apply)       revision)
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: Insert/Delete edits in code-point coordinates
//! - [`document`]: Text buffer with a revision counter
//! - [`oplog`]: Append-only history with a retention horizon
//! - [`transform`]: Pairwise transforms, rebasing, cursor mapping
//! - [`error`]: `OtError` taxonomy

pub mod document;
pub mod error;
pub mod oplog;
pub mod operation;
pub mod transform;

pub use document::{Document, Snapshot};
pub use error::OtError;
pub use oplog::{LogConfig, LogEntry, LogRange, OperationLog};
pub use operation::{Edit, Operation};
pub use transform::{rebase, transform, transform_pair, transform_position, validate};
