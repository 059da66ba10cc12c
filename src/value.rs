use std::ptr;
use std::slice;

use lmdb_sys as ffi;

/// Borrow a byte slice as an engine value descriptor.
///
/// The descriptor is only valid while `data` is.
pub(crate) fn to_val(data: &[u8]) -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: data.len() as _,
        mv_data: data.as_ptr() as *mut _,
    }
}

pub(crate) fn empty_val() -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: 0,
        mv_data: ptr::null_mut(),
    }
}

/// Copy the bytes a descriptor points at out of the memory map.
///
/// Results are always owned so nothing handed to callers points into the map
/// once the transaction ends.
///
/// # Safety
/// `val` must come from the engine within a still-active transaction.
pub(crate) unsafe fn to_vec(val: &ffi::MDB_val) -> Vec<u8> {
    if val.mv_data.is_null() || val.mv_size == 0 {
        return Vec::new();
    }
    slice::from_raw_parts(val.mv_data as *const u8, val.mv_size as usize).to_vec()
}
