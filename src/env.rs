use std::ffi::{CStr, CString};
use std::fs;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_uint};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};

use lazy_static::lazy_static;
use lmdb_sys as ffi;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::constants::{
    CopyFlags, DbFlags, EnvFlags, DEFAULT_GROWTH_FACTOR_MB, DEFAULT_MAX_DBS,
    DEFAULT_MAX_GROWTH_RETRIES, DEFAULT_MODE, SPACE_MULTIPLIER,
};
use crate::database::Database;
use crate::error::{Error, ErrorKind, IntoResult, Result};
use crate::registry::HandleRegistry;
use crate::transaction::Transaction;
use crate::types::{EnvInfo, Stat, Version};

lazy_static! {
    /// Flags the engine allows to be toggled on an open environment
    static ref CHANGEABLE: EnvFlags =
        EnvFlags::NOSYNC | EnvFlags::NOMETASYNC | EnvFlags::MAPASYNC | EnvFlags::NOMEMINIT;

    static ref GLOBAL_REGISTRY: EnvironmentRegistry = EnvironmentRegistry::new();
}

type EnvironmentMap = HandleRegistry<PathBuf, Weak<Environment>>;
type DatabaseMap = HandleRegistry<String, Arc<OnceCell<Arc<Database>>>>;

/// Settings applied when an environment is first opened.
///
/// A path that is already open returns the existing environment and these
/// options are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentOptions {
    pub flags: EnvFlags,
    pub mode: u32,
    /// Megabytes added to the map on every expansion; also the initial map size
    pub growth_factor_mb: usize,
    pub max_databases: u32,
    pub max_readers: Option<u32>,
    /// Expansions a one-shot database operation may trigger before giving up
    pub max_growth_retries: usize,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        EnvironmentOptions {
            flags: EnvFlags::NOSUBDIR,
            mode: DEFAULT_MODE,
            growth_factor_mb: DEFAULT_GROWTH_FACTOR_MB,
            max_databases: DEFAULT_MAX_DBS,
            max_readers: None,
            max_growth_retries: DEFAULT_MAX_GROWTH_RETRIES,
        }
    }
}

impl EnvironmentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn growth_factor_mb(mut self, megabytes: usize) -> Self {
        self.growth_factor_mb = megabytes;
        self
    }

    pub fn max_databases(mut self, max: u32) -> Self {
        self.max_databases = max;
        self
    }

    pub fn max_readers(mut self, max: u32) -> Self {
        self.max_readers = Some(max);
        self
    }

    pub fn max_growth_retries(mut self, retries: usize) -> Self {
        self.max_growth_retries = retries;
        self
    }
}

/// Environments keyed by canonical path.
///
/// Holds weak references: an environment closes when its last user lets go
/// and then removes itself from here. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    environments: Arc<EnvironmentMap>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`Environment::instance`].
    pub fn global() -> &'static EnvironmentRegistry {
        &GLOBAL_REGISTRY
    }

    /// Open the environment at `path`, or return the one already open there.
    pub fn open<P: AsRef<Path>>(&self, path: P, options: &EnvironmentOptions) -> Result<Arc<Environment>> {
        let path = canonical_path(path.as_ref(), options.flags)?;

        self.environments.upgrade_or_insert_with(path.clone(), || {
            Environment::open(path, options, Arc::downgrade(&self.environments)).map(Arc::new)
        })
    }

    pub fn contains<P: AsRef<Path>>(&self, path: P) -> bool {
        self.lookup(path).is_some()
    }

    /// Already-open environment at `path`, without opening one.
    pub fn lookup<P: AsRef<Path>>(&self, path: P) -> Option<Arc<Environment>> {
        let path = path.as_ref();
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.environments.upgrade(&key)
    }

    /// Number of entries, including environments that are mid-close.
    pub fn len(&self) -> usize {
        self.environments.size()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

/// Resolve the registry key for `path`, creating what the engine needs to exist.
fn canonical_path(path: &Path, flags: EnvFlags) -> Result<PathBuf> {
    if flags.contains(EnvFlags::NOSUBDIR) {
        if path.exists() && !path.is_file() {
            return Err(Error::with_message(
                ErrorKind::InvalidPath,
                format!("LMDB path must be a regular file: {}", path.display()),
            ));
        }
        let file_name = path.file_name().ok_or_else(|| {
            Error::with_message(ErrorKind::InvalidPath, format!("no file name in {}", path.display()))
        })?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        Ok(fs::canonicalize(parent)?.join(file_name))
    } else {
        fs::create_dir_all(path)?;
        Ok(fs::canonicalize(path)?)
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::with_message(ErrorKind::InvalidPath, format!("path contains NUL: {}", path.display())))
}

/// Closes a freshly created engine handle unless construction completes.
struct RawEnvGuard(NonNull<ffi::MDB_env>);

impl RawEnvGuard {
    fn create() -> Result<Self> {
        let mut raw: *mut ffi::MDB_env = ptr::null_mut();
        unsafe { ffi::mdb_env_create(&mut raw) }.into_result()?;
        NonNull::new(raw)
            .map(RawEnvGuard)
            .ok_or_else(|| Error::with_message(ErrorKind::EnvNotOpen, "mdb_env_create returned no handle"))
    }

    fn into_raw(self) -> NonNull<ffi::MDB_env> {
        let raw = self.0;
        std::mem::forget(self);
        raw
    }
}

impl Drop for RawEnvGuard {
    fn drop(&mut self) {
        unsafe { ffi::mdb_env_close(self.0.as_ptr()) };
    }
}

/// One memory-mapped LMDB environment.
///
/// Obtain through [`Environment::instance`] or [`EnvironmentRegistry::open`];
/// there is at most one per canonical path in a registry.
#[derive(Debug)]
pub struct Environment {
    env: NonNull<ffi::MDB_env>,
    path: PathBuf,
    flags: EnvFlags,
    /// Bytes added to the map per expansion
    growth_factor: usize,
    max_growth_retries: usize,
    /// Serializes map-size changes, copies, syncs and flag changes
    lock: Mutex<()>,
    /// Open write transactions; kept apart from `lock` so bookkeeping never waits on an expansion
    open_txns: Mutex<usize>,
    /// Every database opened here, kept until the environment closes
    pub(crate) databases: DatabaseMap,
    registry: Weak<EnvironmentMap>,
}

// The engine handle is safe to share between threads: the environment is
// opened with MDB_NOTLS and every call that mutates shared state is
// serialized through `lock`.
unsafe impl Send for Environment {}
unsafe impl Sync for Environment {}

impl Environment {
    /// Open (or reuse) the environment at `path` in the process-wide registry.
    pub fn instance<P: AsRef<Path>>(path: P, options: &EnvironmentOptions) -> Result<Arc<Environment>> {
        EnvironmentRegistry::global().open(path, options)
    }

    fn open(path: PathBuf, options: &EnvironmentOptions, registry: Weak<EnvironmentMap>) -> Result<Self> {
        let growth_factor = options.growth_factor_mb.max(1).saturating_mul(SPACE_MULTIPLIER);
        let c_path = path_to_cstring(&path)?;
        let guard = RawEnvGuard::create()?;
        let raw = guard.0.as_ptr();

        // Only a minimum: an existing, larger file keeps its size
        unsafe { ffi::mdb_env_set_mapsize(raw, growth_factor as _) }
            .into_result()
            .map_err(|e| Error::with_message(e.kind(), format!("could not allocate initial map: {}", e.message())))?;

        unsafe { ffi::mdb_env_set_maxdbs(raw, options.max_databases as _) }
            .into_result()
            .map_err(|e| Error::with_message(e.kind(), format!("could not set maximum databases: {}", e.message())))?;

        if let Some(readers) = options.max_readers {
            unsafe { ffi::mdb_env_set_maxreaders(raw, readers as _) }.into_result()?;
        }

        // Transactions are handed between call sites, so reader slots must not be tied to threads
        let flags = options.flags | EnvFlags::NOTLS;
        unsafe { ffi::mdb_env_open(raw, c_path.as_ptr(), flags.bits() as _, options.mode as _) }
            .into_result()
            .map_err(|e| {
                Error::with_message(
                    e.kind(),
                    format!("could not open LMDB environment [{}]: {}", path.display(), e.message()),
                )
            })?;

        debug!("opened LMDB environment at {} ({} MB growth)", path.display(), options.growth_factor_mb);

        Ok(Environment {
            env: guard.into_raw(),
            path,
            flags,
            growth_factor,
            max_growth_retries: options.max_growth_retries,
            lock: Mutex::new(()),
            open_txns: Mutex::new(0),
            databases: HandleRegistry::new(),
            registry,
        })
    }

    pub(crate) fn raw(&self) -> *mut ffi::MDB_env {
        self.env.as_ptr()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes added to the map by [`expand`](Environment::expand).
    pub fn growth_factor(&self) -> usize {
        self.growth_factor
    }

    pub(crate) fn max_growth_retries(&self) -> usize {
        self.max_growth_retries
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(EnvFlags::RDONLY)
    }

    /// The database named `name` ("" for the unnamed one), opening it if needed.
    ///
    /// `compression` and `flags` only apply when the database is first opened
    /// in this environment; the handle then stays the same until the
    /// environment closes or the database is deleted.
    pub fn database(self: &Arc<Self>, name: &str, compression: bool, flags: DbFlags) -> Result<Arc<Database>> {
        let db = self
            .databases
            .get_or_try_init(name.to_string(), || Database::open(self, name, compression, flags).map(Arc::new))?;

        if db.compressed() != compression {
            warn!(
                "database [{}] is already open with compression={}, ignoring compression={}",
                name,
                db.compressed(),
                compression
            );
        }
        Ok(db)
    }

    /// A transaction with no database selected; bind one with
    /// [`Transaction::use_database`] before reading or writing.
    pub fn transaction(self: &Arc<Self>, readonly: bool) -> Result<Transaction> {
        Transaction::begin(Arc::clone(self), None, readonly)
    }

    /// Copy the environment to `path`, replacing whatever is there.
    pub fn copy<P: AsRef<Path>>(&self, path: P, flags: CopyFlags) -> Result<()> {
        let _lock = self.lock.lock();
        let path = path.as_ref();

        if path.exists() {
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }

        if self.flags.contains(EnvFlags::NOSUBDIR) {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        } else {
            fs::create_dir_all(path)?;
        }

        let c_path = path_to_cstring(path)?;
        unsafe { ffi::mdb_env_copy2(self.raw(), c_path.as_ptr(), flags.bits() as _) }.into_result()?;

        info!("copied LMDB environment {} to {}", self.path.display(), path.display());
        Ok(())
    }

    /// Pick up a map size grown by another process.
    ///
    /// Refused while write transactions are open.
    pub fn detect_map_size(&self) -> Result<()> {
        let _lock = self.lock.lock();
        if self.open_transactions() != 0 {
            return Err(Error::with_message(
                ErrorKind::Operation,
                "cannot detect LMDB environment map size while transactions are open",
            ));
        }
        unsafe { ffi::mdb_env_set_mapsize(self.raw(), 0) }.into_result()?;
        debug!("re-read map size for {}", self.path.display());
        Ok(())
    }

    /// Grow the map by the growth factor.
    pub fn expand(&self) -> Result<()> {
        let pages = self.memory_to_pages(self.growth_factor)?;
        self.expand_pages(pages)
    }

    /// Grow the map by `pages` pages.
    ///
    /// Refused while write transactions are open.
    pub fn expand_pages(&self, pages: usize) -> Result<()> {
        let _lock = self.lock.lock();
        if self.open_transactions() != 0 {
            return Err(Error::with_message(
                ErrorKind::Operation,
                "cannot expand LMDB environment map size while transactions are open",
            ));
        }

        let info = self.info()?;
        let stat = self.stat()?;
        let new_size = (stat.page_size as usize)
            .checked_mul(pages)
            .and_then(|grow| grow.checked_add(info.map_size))
            .ok_or_else(|| {
                Error::with_message(
                    ErrorKind::Operation,
                    format!("cannot grow LMDB map of {} bytes by {} pages", info.map_size, pages),
                )
            })?;
        unsafe { ffi::mdb_env_set_mapsize(self.raw(), new_size as _) }.into_result()?;

        info!(
            "expanded LMDB map for {} from {} to {} bytes",
            self.path.display(),
            info.map_size,
            new_size
        );
        Ok(())
    }

    fn memory_to_pages(&self, memory: usize) -> Result<usize> {
        let page_size = self.stat()?.page_size as usize;
        Ok(memory / page_size + usize::from(memory % page_size != 0))
    }

    /// Flush buffers to disk; `force` syncs even under NOSYNC/MAPASYNC.
    pub fn flush(&self, force: bool) -> Result<()> {
        let _lock = self.lock.lock();
        unsafe { ffi::mdb_env_sync(self.raw(), force as c_int) }.into_result()
    }

    pub fn get_flags(&self) -> Result<EnvFlags> {
        let mut flags: c_uint = 0;
        unsafe { ffi::mdb_env_get_flags(self.raw(), &mut flags) }.into_result()?;
        Ok(EnvFlags::from_bits_truncate(flags as u32))
    }

    /// Toggle flags on the open environment.
    ///
    /// Only NOSYNC, NOMETASYNC, MAPASYNC and NOMEMINIT can change after open.
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::with_message(
                ErrorKind::Incompatible,
                format!("flags {:?} cannot be changed on an open environment", flags),
            ));
        }
        let _lock = self.lock.lock();
        unsafe { ffi::mdb_env_set_flags(self.raw(), flags.bits() as _, on as c_int) }.into_result()
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let mut info = MaybeUninit::<ffi::MDB_envinfo>::uninit();
        unsafe { ffi::mdb_env_info(self.raw(), info.as_mut_ptr()) }.into_result()?;
        let info = unsafe { info.assume_init() };

        Ok(EnvInfo {
            map_size: info.me_mapsize as usize,
            last_page: info.me_last_pgno as usize,
            last_txn_id: info.me_last_txnid as usize,
            max_readers: info.me_maxreaders as u32,
            num_readers: info.me_numreaders as u32,
        })
    }

    /// Current size of the memory map in bytes.
    pub fn map_size(&self) -> Result<usize> {
        Ok(self.info()?.map_size)
    }

    pub fn stat(&self) -> Result<Stat> {
        let mut stat = MaybeUninit::<ffi::MDB_stat>::uninit();
        unsafe { ffi::mdb_env_stat(self.raw(), stat.as_mut_ptr()) }.into_result()?;
        Ok(Stat::from(unsafe { stat.assume_init() }))
    }

    pub fn max_key_size(&self) -> usize {
        unsafe { ffi::mdb_env_get_maxkeysize(self.raw()) as usize }
    }

    pub fn max_readers(&self) -> Result<u32> {
        let mut readers: c_uint = 0;
        unsafe { ffi::mdb_env_get_maxreaders(self.raw(), &mut readers) }.into_result()?;
        Ok(readers as u32)
    }

    /// Number of write transactions currently open against this environment.
    ///
    /// A writer counts from the moment it asks the engine for a transaction,
    /// including while it waits for another writer to finish, so
    /// [`expand`](Environment::expand) is refused during that wait as well.
    pub fn open_transactions(&self) -> usize {
        *self.open_txns.lock()
    }

    pub(crate) fn register_transaction(&self) {
        *self.open_txns.lock() += 1;
    }

    pub(crate) fn unregister_transaction(&self) {
        let mut open = self.open_txns.lock();
        *open = open.saturating_sub(1);
    }

    /// Version of the linked LMDB library.
    pub fn version() -> Version {
        let (mut major, mut minor, mut patch): (c_int, c_int, c_int) = (0, 0, 0);
        unsafe { ffi::mdb_version(&mut major, &mut minor, &mut patch) };
        Version {
            major: major as i32,
            minor: minor as i32,
            patch: patch as i32,
        }
    }

    /// Version string reported by the linked LMDB library.
    pub fn version_string() -> String {
        let (mut major, mut minor, mut patch): (c_int, c_int, c_int) = (0, 0, 0);
        unsafe {
            let ptr = ffi::mdb_version(&mut major, &mut minor, &mut patch);
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

impl From<ffi::MDB_stat> for Stat {
    fn from(stat: ffi::MDB_stat) -> Self {
        Stat {
            page_size: stat.ms_psize as u32,
            depth: stat.ms_depth as u32,
            branch_pages: stat.ms_branch_pages as usize,
            leaf_pages: stat.ms_leaf_pages as usize,
            overflow_pages: stat.ms_overflow_pages as usize,
            entries: stat.ms_entries as usize,
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        // Transactions hold an Arc to us; databases still held by callers fail from here on
        self.databases.clear();

        if !self.is_readonly() {
            if let Err(e) = unsafe { ffi::mdb_env_sync(self.raw(), 1) }.into_result() {
                warn!("failed to flush LMDB environment {}: {}", self.path.display(), e);
            }
        }
        unsafe { ffi::mdb_env_close(self.raw()) };

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_dead(&self.path);
        }
        debug!("closed LMDB environment at {}", self.path.display());
    }
}
