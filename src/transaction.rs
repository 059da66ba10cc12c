use std::cell::Cell;
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;

use lmdb_sys as ffi;
use log::debug;

use crate::constants::{EnvFlags, WriteFlags, TXN_BEGIN_ATTEMPTS};
use crate::cursor::Cursor;
use crate::database::Database;
use crate::env::Environment;
use crate::error::{Error, ErrorKind, IntoResult, Result};
use crate::types::Stat;
use crate::value::{empty_val, to_val, to_vec};

/// Lifecycle of a transaction.
///
/// `Reset` only happens to read-only transactions and goes back to `Active`
/// through [`Transaction::renew`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Reset,
    Committed,
    Aborted,
}

/// Native transaction handle shared by a transaction and its cursors.
///
/// Cursors check the state before every call, so a cursor that outlives its
/// transaction fails with a bad-transaction error instead of touching freed
/// memory.
#[derive(Debug)]
pub(crate) struct TxnHandle {
    raw: Cell<*mut ffi::MDB_txn>,
    state: Cell<TxnState>,
}

impl TxnHandle {
    /// The native handle, if the transaction can currently be used.
    pub(crate) fn active(&self) -> Result<*mut ffi::MDB_txn> {
        match self.state.get() {
            TxnState::Active => Ok(self.raw.get()),
            state => Err(Error::with_message(
                ErrorKind::BadTxn,
                format!("transaction is not active ({:?})", state),
            )),
        }
    }

    pub(crate) fn state(&self) -> TxnState {
        self.state.get()
    }

    fn finish(&self, state: TxnState) {
        self.raw.set(ptr::null_mut());
        self.state.set(state);
    }
}

/// A unit of work against one environment.
///
/// Reads and writes go to the currently bound database, which can be switched
/// with [`use_database`](Transaction::use_database) to write to several
/// databases in one commit. Dropping a transaction that was not committed
/// aborts it.
///
/// Transactions and their cursors stay on the thread that created them.
#[derive(Debug)]
pub struct Transaction {
    env: Arc<Environment>,
    db: Option<Arc<Database>>,
    handle: Rc<TxnHandle>,
    readonly: bool,
}

impl Transaction {
    pub(crate) fn begin(env: Arc<Environment>, db: Option<Arc<Database>>, readonly: bool) -> Result<Self> {
        let flags = if readonly { EnvFlags::RDONLY.bits() } else { 0 };
        let mut attempt = 0;

        let raw = loop {
            attempt += 1;

            // Count the writer before it exists so an expansion cannot slip in between
            if !readonly {
                env.register_transaction();
            }

            let mut raw: *mut ffi::MDB_txn = ptr::null_mut();
            let rc = unsafe { ffi::mdb_txn_begin(env.raw(), ptr::null_mut(), flags as _, &mut raw) };
            if rc == 0 {
                break raw;
            }

            if !readonly {
                env.unregister_transaction();
            }

            let err = Error::from_code(rc);
            if err.kind() == ErrorKind::MapResized && attempt < TXN_BEGIN_ATTEMPTS {
                debug!("map resized by another process, re-reading size (attempt {})", attempt);
                env.detect_map_size()
                    .map_err(|e| Error::with_message(e.kind(), format!("failed to re-initialize map: {}", e.message())))?;
                continue;
            }
            return Err(err);
        };

        Ok(Transaction {
            env,
            db,
            handle: Rc::new(TxnHandle {
                raw: Cell::new(raw),
                state: Cell::new(TxnState::Active),
            }),
            readonly,
        })
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn state(&self) -> TxnState {
        self.handle.state()
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// The database reads and writes currently go to.
    pub fn database(&self) -> Option<&Arc<Database>> {
        self.db.as_ref()
    }

    /// Point subsequent operations at `db` without ending the transaction.
    pub fn use_database(&mut self, db: &Arc<Database>) -> Result<()> {
        if !db.belongs_to(&self.env) {
            return Err(Error::with_message(
                ErrorKind::BadDbi,
                format!("database [{}] belongs to another environment", db.name()),
            ));
        }
        self.db = Some(Arc::clone(db));
        Ok(())
    }

    /// Commit and end the transaction.
    ///
    /// The transaction is over whether or not the engine reports success.
    pub fn commit(&mut self) -> Result<()> {
        let raw = self.handle.active()?;
        let rc = unsafe { ffi::mdb_txn_commit(raw) };
        self.handle.finish(TxnState::Committed);
        if !self.readonly {
            self.env.unregister_transaction();
        }
        rc.into_result()
    }

    /// Discard the transaction. Does nothing if it already ended.
    pub fn abort(&mut self) {
        let state = self.handle.state();
        if matches!(state, TxnState::Committed | TxnState::Aborted) {
            return;
        }
        unsafe { ffi::mdb_txn_abort(self.handle.raw.get()) };
        self.handle.finish(TxnState::Aborted);
        if !self.readonly && state == TxnState::Active {
            self.env.unregister_transaction();
        }
    }

    /// Release the snapshot of a read-only transaction, keeping the handle for [`renew`](Transaction::renew).
    pub fn reset(&mut self) -> Result<()> {
        if !self.readonly {
            return Err(Error::with_message(ErrorKind::BadTxn, "only read-only transactions can be reset"));
        }
        let raw = self.handle.active()?;
        unsafe { ffi::mdb_txn_reset(raw) };
        self.handle.state.set(TxnState::Reset);
        Ok(())
    }

    /// Take a fresh snapshot with a previously reset read-only transaction.
    pub fn renew(&mut self) -> Result<()> {
        if !self.readonly || self.handle.state() != TxnState::Reset {
            return Err(Error::with_message(
                ErrorKind::BadTxn,
                "transaction does not exist or is not a reset read-only transaction",
            ));
        }
        unsafe { ffi::mdb_txn_renew(self.handle.raw.get()) }.into_result()?;
        self.handle.state.set(TxnState::Active);
        Ok(())
    }

    pub(crate) fn raw(&self) -> Result<*mut ffi::MDB_txn> {
        self.handle.active()
    }

    fn bound(&self) -> Result<&Arc<Database>> {
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| Error::with_message(ErrorKind::BadDbi, "no database selected for this transaction"))?;
        db.check_open()?;
        Ok(db)
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::with_message(ErrorKind::BadTxn, "transaction is read-only"));
        }
        Ok(())
    }

    /// Store `value` under `key` in the bound database.
    ///
    /// Capacity errors are returned as-is; abort, expand and retry is up to the caller.
    pub fn put(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        let txn = self.raw()?;
        let db = self.bound()?;
        self.check_writable()?;

        let encoded = db.codec().encode(value)?;
        let mut key_val = to_val(key);
        let mut data_val = to_val(&encoded);
        unsafe { ffi::mdb_put(txn, db.dbi(), &mut key_val, &mut data_val, flags.bits() as _) }.into_result()
    }

    /// Value stored under `key`, or a not-found error.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let txn = self.raw()?;
        let db = self.bound()?;

        let mut key_val = to_val(key);
        let mut data_val = empty_val();
        unsafe { ffi::mdb_get(txn, db.dbi(), &mut key_val, &mut data_val) }.into_result()?;
        let stored = unsafe { to_vec(&data_val) };
        Ok(db.codec().decode(stored))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let txn = self.raw()?;
        let db = self.bound()?;

        let mut key_val = to_val(key);
        let mut data_val = empty_val();
        match unsafe { ffi::mdb_get(txn, db.dbi(), &mut key_val, &mut data_val) }.into_result() {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the exact `key`/`value` pair is stored in a sorted-duplicates database.
    pub fn exists_dup(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut cursor = self.cursor()?;
        match cursor.get_both(key, value) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete `key` and all of its values.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let txn = self.raw()?;
        let db = self.bound()?;
        self.check_writable()?;

        let mut key_val = to_val(key);
        unsafe { ffi::mdb_del(txn, db.dbi(), &mut key_val, ptr::null_mut()) }.into_result()
    }

    /// Delete one `key`/`value` pair from a sorted-duplicates database.
    pub fn del_dup(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let txn = self.raw()?;
        let db = self.bound()?;
        self.check_writable()?;

        let encoded = db.codec().encode(value)?;
        let mut key_val = to_val(key);
        let mut data_val = to_val(&encoded);
        unsafe { ffi::mdb_del(txn, db.dbi(), &mut key_val, &mut data_val) }.into_result()
    }

    /// Open a cursor on the bound database.
    pub fn cursor(&self) -> Result<Cursor> {
        let db = self.bound()?;
        Cursor::open(Arc::clone(&self.env), Rc::clone(&self.handle), Arc::clone(db), self.readonly)
    }

    /// Statistics of the bound database as seen by this transaction.
    pub fn stat(&self) -> Result<Stat> {
        let txn = self.raw()?;
        let db = self.bound()?;

        let mut stat = MaybeUninit::<ffi::MDB_stat>::uninit();
        unsafe { ffi::mdb_stat(txn, db.dbi(), stat.as_mut_ptr()) }.into_result()?;
        Ok(Stat::from(unsafe { stat.assume_init() }))
    }

    pub(crate) fn db_flags(&self) -> Result<u32> {
        let txn = self.raw()?;
        let db = self.bound()?;

        let mut flags = 0;
        unsafe { ffi::mdb_dbi_flags(txn, db.dbi(), &mut flags) }.into_result()?;
        Ok(flags as u32)
    }

    /// Empty the bound database, and with `delete` remove it from the environment.
    pub(crate) fn drop_bound(&self, delete: bool) -> Result<()> {
        let txn = self.raw()?;
        let db = self.bound()?;
        self.check_writable()?;

        unsafe { ffi::mdb_drop(txn, db.dbi(), delete as c_int) }.into_result()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort();
    }
}
