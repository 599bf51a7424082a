//! Postgres-backed stores: chat history, per-chat config, blacklist and
//! generation statistics. All tables are created and migrated on startup;
//! runtime paths assume the schema is in place.

pub mod blacklist;
pub mod config_store;
pub mod db;
pub mod error;
pub mod messages;
pub mod schema;
pub mod statistics;

pub use blacklist::Blacklist;
pub use config_store::ConfigStore;
pub use error::StoreError;
pub use messages::{MediaKind, MessageStore, NewMessage, PruneReport, StoredMessage};
pub use schema::{Accepted, ParamKind, ParamSpec, ParamValue, SetRejection};
pub use statistics::Statistics;
