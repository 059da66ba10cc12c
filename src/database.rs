use std::ffi::CString;
use std::ops::ControlFlow;
use std::os::raw::c_uint;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lmdb_sys as ffi;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::codec::ValueCodec;
use crate::constants::{DbFlags, WriteFlags};
use crate::env::Environment;
use crate::error::{Error, ErrorKind, IntoResult, Result};
use crate::transaction::Transaction;
use crate::types::{CursorOp, Stat};

/// A named key space inside an [`Environment`].
///
/// The one-shot methods (`put`, `get`, `del`, ...) each run in their own
/// transaction. Writes that hit a full map abort, grow the map and start
/// over; see [`Environment::expand`]. For atomic work across several calls
/// or databases use [`Database::transaction`] or [`Environment::transaction`].
///
/// The environment owns its databases. A handle kept after the environment
/// closes fails every call with [`ErrorKind::EnvNotOpen`].
#[derive(Debug)]
pub struct Database {
    env: Weak<Environment>,
    name: String,
    dbi: ffi::MDB_dbi,
    codec: ValueCodec,
    dropped: AtomicBool,
    /// Serializes `drop_db` calls on this handle
    lock: Mutex<()>,
}

impl Database {
    /// Open the key space inside a short bootstrap transaction.
    ///
    /// The handle only becomes usable by others once that transaction commits.
    pub(crate) fn open(env: &Arc<Environment>, name: &str, compression: bool, flags: DbFlags) -> Result<Self> {
        let readonly = env.is_readonly();
        let c_name = if name.is_empty() { None } else { Some(CString::new(name)?) };

        let mut open_flags = flags;
        if !readonly {
            open_flags |= DbFlags::CREATE;
        }

        let mut txn = Transaction::begin(Arc::clone(env), None, readonly)?;
        let mut dbi: ffi::MDB_dbi = 0;
        unsafe {
            ffi::mdb_dbi_open(
                txn.raw()?,
                c_name.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
                open_flags.bits() as c_uint,
                &mut dbi,
            )
        }
        .into_result()
        .map_err(|e| {
            Error::with_message(e.kind(), format!("unable to open LMDB database [{}]: {}", name, e.message()))
        })?;

        if dbi == 0 {
            return Err(Error::with_message(
                ErrorKind::BadDbi,
                format!("could not open LMDB database [{}]: no handle", name),
            ));
        }

        // Read-only bootstrap commits too: aborting would close the new handle
        txn.commit().map_err(|e| {
            Error::with_message(e.kind(), format!("could not commit opening of database [{}]: {}", name, e.message()))
        })?;

        debug!("opened database [{}] (dbi {}, compression={})", name, dbi, compression);

        Ok(Database {
            env: Arc::downgrade(env),
            name: name.to_string(),
            dbi,
            codec: ValueCodec::new(compression),
            dropped: AtomicBool::new(false),
            lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning environment, unless it has already closed.
    pub fn environment(&self) -> Result<Arc<Environment>> {
        self.env.upgrade().ok_or_else(|| {
            Error::with_message(
                ErrorKind::EnvNotOpen,
                format!("environment of database [{}] has been closed", self.name),
            )
        })
    }

    pub(crate) fn belongs_to(&self, env: &Arc<Environment>) -> bool {
        ptr::eq(self.env.as_ptr(), Arc::as_ptr(env))
    }

    pub fn compressed(&self) -> bool {
        self.codec.is_enabled()
    }

    pub(crate) fn dbi(&self) -> ffi::MDB_dbi {
        self.dbi
    }

    pub(crate) fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(Error::with_message(
                ErrorKind::BadDbi,
                format!("database [{}] has been deleted", self.name),
            ));
        }
        Ok(())
    }

    /// A transaction already bound to this database.
    pub fn transaction(self: &Arc<Self>, readonly: bool) -> Result<Transaction> {
        self.check_open()?;
        Transaction::begin(self.environment()?, Some(Arc::clone(self)), readonly)
    }

    /// Run `op` in a write transaction and commit, growing the map on capacity errors.
    ///
    /// The failed transaction is aborted before expanding since the map
    /// cannot grow while writers are open. If the expansion fails, or the
    /// retry budget runs out, the capacity error is returned.
    fn write_with_growth<T, F>(self: &Arc<Self>, mut op: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        let mut expansions = 0;
        loop {
            match self.attempt_write(&mut op, &mut expansions) {
                ControlFlow::Break(result) => return result,
                ControlFlow::Continue(()) => continue,
            }
        }
    }

    fn attempt_write<T, F>(self: &Arc<Self>, op: &mut F, expansions: &mut usize) -> ControlFlow<Result<T>>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        let mut txn = match self.transaction(false) {
            Ok(txn) => txn,
            Err(e) => return ControlFlow::Break(Err(e)),
        };

        let err = match op(&txn) {
            Ok(value) => match txn.commit() {
                Ok(()) => return ControlFlow::Break(Ok(value)),
                Err(e) => e,
            },
            Err(e) => e,
        };

        if !err.is_capacity() {
            return ControlFlow::Break(Err(err));
        }
        let env = Arc::clone(txn.environment());
        if *expansions >= env.max_growth_retries() {
            warn!(
                "database [{}] still full after {} expansions, giving up",
                self.name, expansions
            );
            return ControlFlow::Break(Err(err));
        }

        txn.abort();
        drop(txn);

        match env.expand() {
            Ok(()) => {
                *expansions += 1;
                ControlFlow::Continue(())
            }
            Err(e) => {
                warn!("could not expand map for database [{}]: {}", self.name, e);
                ControlFlow::Break(Err(err))
            }
        }
    }

    /// Store `value` under `key`.
    pub fn put(self: &Arc<Self>, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.write_with_growth(|txn| txn.put(key, value, flags))
    }

    /// Value stored under `key` (the first one, for sorted duplicates).
    pub fn get(self: &Arc<Self>, key: &[u8]) -> Result<Vec<u8>> {
        self.transaction(true)?.get(key)
    }

    pub fn exists(self: &Arc<Self>, key: &[u8]) -> Result<bool> {
        self.transaction(true)?.exists(key)
    }

    pub fn exists_dup(self: &Arc<Self>, key: &[u8], value: &[u8]) -> Result<bool> {
        self.transaction(true)?.exists_dup(key, value)
    }

    /// Delete `key` with all of its values.
    pub fn del(self: &Arc<Self>, key: &[u8]) -> Result<()> {
        self.write_with_growth(|txn| txn.del(key))
    }

    /// Delete a single `key`/`value` pair of a sorted-duplicates database.
    pub fn del_dup(self: &Arc<Self>, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_with_growth(|txn| txn.del_dup(key, value))
    }

    /// Number of entries, counted by walking a cursor over the whole database.
    pub fn count(self: &Arc<Self>) -> Result<usize> {
        let txn = self.transaction(true)?;
        let mut cursor = txn.cursor()?;
        let mut count = 0;
        for entry in cursor.iter() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// All keys in order.
    ///
    /// With `ignore_duplicates`, a key equal to the one listed just before it
    /// is skipped, so each key of a sorted-duplicates database appears once.
    pub fn list_keys(self: &Arc<Self>, ignore_duplicates: bool) -> Result<Vec<Vec<u8>>> {
        let txn = self.transaction(true)?;
        let mut cursor = txn.cursor()?;
        let mut keys: Vec<Vec<u8>> = Vec::new();

        for entry in cursor.iter() {
            let (key, _) = entry?;
            if ignore_duplicates && keys.last() == Some(&key) {
                continue;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Every value, one per key, in key order.
    ///
    /// Loads the whole database into memory; only meant for small ones.
    pub fn get_all(self: &Arc<Self>) -> Result<Vec<Vec<u8>>> {
        let txn = self.transaction(true)?;
        let mut cursor = txn.cursor()?;
        let mut values = Vec::new();

        let mut op = CursorOp::First;
        loop {
            match cursor.get(op) {
                Ok((_, value)) => values.push(value),
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
            op = CursorOp::NextNoDup;
        }
        Ok(values)
    }

    pub fn flags(self: &Arc<Self>) -> Result<DbFlags> {
        let flags = self.transaction(true)?.db_flags()?;
        Ok(DbFlags::from_bits_truncate(flags))
    }

    pub fn stat(self: &Arc<Self>) -> Result<Stat> {
        self.transaction(true)?.stat()
    }

    /// Remove every entry; with `delete` also remove the database itself.
    ///
    /// A deleted database is forgotten by its environment and this handle
    /// stops working.
    pub fn drop_db(self: &Arc<Self>, delete: bool) -> Result<()> {
        let _lock = self.lock.lock();
        self.write_with_growth(|txn| txn.drop_bound(delete))?;

        if delete {
            self.dropped.store(true, Ordering::Release);
            if let Some(env) = self.env.upgrade() {
                env.databases.erase(self.name.as_str());
            }
            debug!("deleted database [{}]", self.name);
        }
        Ok(())
    }
}
