//! Safe, shareable handles over an embedded LMDB engine.
//!
//! Environments and databases are deduplicated by path and name, one-shot
//! database writes grow the memory map and retry when it fills up,
//! transactions abort unless committed, and values can be transparently
//! compressed per database.
//!
//! ```no_run
//! use lumodb::{DbFlags, Environment, EnvironmentOptions, WriteFlags};
//!
//! # fn main() -> lumodb::Result<()> {
//! let env = Environment::instance("data.mdb", &EnvironmentOptions::default())?;
//! let users = env.database("users", false, DbFlags::empty())?;
//!
//! users.put(b"alice", b"data1", WriteFlags::empty())?;
//! assert_eq!(users.get(b"alice")?, b"data1");
//! # Ok(())
//! # }
//! ```

mod codec;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod registry;
mod transaction;
mod types;
mod value;

pub use codec::ValueCodec;
pub use constants::{
    CopyFlags, DbFlags, EnvFlags, WriteFlags, DEFAULT_GROWTH_FACTOR_MB, DEFAULT_MAX_DBS,
    DEFAULT_MAX_GROWTH_RETRIES, DEFAULT_MODE,
};
pub use cursor::{Cursor, CursorIter};
pub use database::Database;
pub use env::{Environment, EnvironmentOptions, EnvironmentRegistry};
pub use error::{Error, ErrorKind, Result};
pub use registry::HandleRegistry;
pub use transaction::{Transaction, TxnState};
pub use types::{CursorOp, EnvInfo, Stat, Version};
