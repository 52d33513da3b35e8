//! Command handlers. Each is a thin shim from parsed args onto the
//! backend (RPC or direct) and the sync engine.

pub mod config;
pub mod create;
pub mod daemon;
pub mod dep;
pub mod export;
pub mod import;
pub mod init;
pub mod issue;
pub mod label;
pub mod list;
pub mod sync;
pub mod validate;
