#![forbid(unsafe_code)]

//! Client-side engine for Content-Length framed JSON-RPC peers over stdio,
//! plus a bounded worker pool for running independent processes.

pub mod config;
pub mod errors;
pub mod pool;
pub mod probe;
pub mod rpc;
pub mod settle;
pub mod supervisor;

pub use config::GlobalConfig;
pub use errors::{AbortCause, AbortKind, AppError, Result};
