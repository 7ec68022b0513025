//! SQLite persistence for the staffline workflow engine.
//!
//! All access goes through [`SqliteStore::read`] or [`SqliteStore::write`],
//! which hand a [`StoreTx`] to a closure. A write closure that returns an error
//! rolls the whole transaction back, so a rejected operation leaves every row
//! exactly as it was.

mod rows;
mod store;
mod tx;

pub use store::SqliteStore;
pub use tx::{ExceptionFilter, InstanceFilter, StoreTx};
