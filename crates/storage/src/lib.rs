//! In-memory multi-database engine
//!
//! A [`Store`] owns a fixed number of logical databases, a striped per-key
//! reader-writer lock map, and the command registry. Commands are dispatched
//! by name; successful mutations are forwarded to an attached append-only
//! file sink.

mod commands;
mod db;
mod entity;
mod locks;
mod store;

pub use db::Db;
pub use entity::{entity_to_cmd, expire_cmd, DataEntity};
pub use locks::LockMap;
pub use store::{AofPayload, AofSender, Store};
