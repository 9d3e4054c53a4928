//! Core types shared by every couchtable crate: the error taxonomy, record
//! helpers, request options and operations, and the store traits that the
//! HTTP and in-memory adapters implement.

pub mod adapter;
pub mod collation;
pub mod error;
pub mod operation;
pub mod options;
pub mod record;
