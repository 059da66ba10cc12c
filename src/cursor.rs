use std::ptr;
use std::rc::Rc;
use std::sync::Arc;

use lmdb_sys as ffi;

use crate::constants::WriteFlags;
use crate::database::Database;
use crate::env::Environment;
use crate::error::{Error, ErrorKind, IntoResult, Result};
use crate::transaction::{TxnHandle, TxnState};
use crate::types::CursorOp;
use crate::value::{empty_val, to_val, to_vec};

/// A position inside one database, scoped to the transaction that opened it.
///
/// Keys are returned as stored; values go through the database's codec.
/// Every call fails with a bad-transaction error once the owning
/// transaction has been committed, aborted or reset.
#[derive(Debug)]
pub struct Cursor {
    cursor: *mut ffi::MDB_cursor,
    /// Keeps the engine open until the cursor is closed
    _env: Arc<Environment>,
    txn: Rc<TxnHandle>,
    db: Arc<Database>,
    readonly: bool,
}

impl Cursor {
    pub(crate) fn open(env: Arc<Environment>, txn: Rc<TxnHandle>, db: Arc<Database>, readonly: bool) -> Result<Self> {
        let raw_txn = txn.active()?;
        let mut cursor: *mut ffi::MDB_cursor = ptr::null_mut();
        unsafe { ffi::mdb_cursor_open(raw_txn, db.dbi(), &mut cursor) }
            .into_result()
            .map_err(|e| Error::with_message(e.kind(), format!("could not open LMDB cursor: {}", e.message())))?;

        Ok(Cursor {
            cursor,
            _env: env,
            txn,
            db,
            readonly,
        })
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn check(&self) -> Result<()> {
        self.txn.active()?;
        self.db.check_open()
    }

    fn check_writable(&self) -> Result<()> {
        self.check()?;
        if self.readonly {
            return Err(Error::with_message(ErrorKind::BadTxn, "cursor is read-only"));
        }
        Ok(())
    }

    /// Move with `op` and return the entry at the new position.
    pub fn get(&mut self, op: CursorOp) -> Result<(Vec<u8>, Vec<u8>)> {
        self.check()?;
        let mut key_val = empty_val();
        let mut data_val = empty_val();
        self.fetch(&mut key_val, &mut data_val, op)
    }

    /// Move with `op` relative to `key` (e.g. [`CursorOp::Set`], [`CursorOp::SetRange`]).
    pub fn get_key(&mut self, key: &[u8], op: CursorOp) -> Result<(Vec<u8>, Vec<u8>)> {
        self.check()?;
        let mut key_val = to_val(key);
        let mut data_val = empty_val();
        self.fetch(&mut key_val, &mut data_val, op)
    }

    /// Move onto the exact `key`/`value` pair of a sorted-duplicates database.
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        self.check()?;
        let encoded = self.db.codec().encode(value)?;
        let mut key_val = to_val(key);
        let mut data_val = to_val(&encoded);
        self.fetch(&mut key_val, &mut data_val, CursorOp::GetBoth)
    }

    fn fetch(
        &mut self,
        key_val: &mut ffi::MDB_val,
        data_val: &mut ffi::MDB_val,
        op: CursorOp,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        unsafe { ffi::mdb_cursor_get(self.cursor, key_val, data_val, op.to_raw() as _) }.into_result()?;
        let (key, stored) = unsafe { (to_vec(key_val), to_vec(data_val)) };
        Ok((key, self.db.codec().decode(stored)))
    }

    /// Every value stored under `key` in a sorted-duplicates database.
    ///
    /// Returns the key as found and its values in sorted order, or a
    /// not-found error when the key has none.
    pub fn get_all(&mut self, key: &[u8]) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
        let (found, first) = self.get_key(key, CursorOp::SetKey)?;
        let mut values = vec![first];

        loop {
            match self.get(CursorOp::NextDup) {
                Ok((_, value)) => values.push(value),
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
        }
        Ok((found, values))
    }

    /// Number of values under the current key.
    pub fn count(&self) -> Result<usize> {
        self.check()?;
        let mut count = 0;
        unsafe { ffi::mdb_cursor_count(self.cursor, &mut count) }.into_result()?;
        Ok(count as usize)
    }

    /// Store `key`/`value` and move the cursor onto it. No automatic growth.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_writable()?;
        let encoded = self.db.codec().encode(value)?;
        let mut key_val = to_val(key);
        let mut data_val = to_val(&encoded);
        unsafe { ffi::mdb_cursor_put(self.cursor, &mut key_val, &mut data_val, flags.bits() as _) }.into_result()
    }

    /// Delete the entry at the current position; `NODUPDATA` removes all values of the key.
    pub fn del(&mut self, flags: WriteFlags) -> Result<()> {
        self.check_writable()?;
        unsafe { ffi::mdb_cursor_del(self.cursor, flags.bits() as _) }.into_result()
    }

    /// Attach the cursor to its transaction again after a reset and renew.
    pub fn renew(&mut self) -> Result<()> {
        if !self.readonly {
            return Err(Error::with_message(
                ErrorKind::Incompatible,
                "only cursors of read-only transactions can be renewed",
            ));
        }
        let raw_txn = self.txn.active()?;
        unsafe { ffi::mdb_cursor_renew(raw_txn, self.cursor) }.into_result()
    }

    /// Iterate from the first entry to the last.
    pub fn iter(&mut self) -> CursorIter<'_> {
        CursorIter {
            cursor: self,
            op: CursorOp::First,
            done: false,
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        // Write cursors are freed by the engine when their transaction ends
        if self.readonly || self.txn.state() == TxnState::Active {
            unsafe { ffi::mdb_cursor_close(self.cursor) };
        }
    }
}

/// Entries of a cursor in key order, see [`Cursor::iter`].
pub struct CursorIter<'c> {
    cursor: &'c mut Cursor,
    op: CursorOp,
    done: bool,
}

impl Iterator for CursorIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.cursor.get(self.op);
        self.op = CursorOp::Next;
        match result {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.is_not_found() => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
