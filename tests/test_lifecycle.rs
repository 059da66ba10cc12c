use lumodb::{
    CopyFlags, DbFlags, EnvFlags, Environment, EnvironmentOptions, EnvironmentRegistry, ErrorKind, WriteFlags,
};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

#[test]
fn test_same_path_same_environment() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let options = EnvironmentOptions::default();

    let first = registry.open(dir.path().join("data.mdb"), &options).unwrap();
    let second = registry.open(dir.path().join(".").join("data.mdb"), &options).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(dir.path().join("data.mdb")));

    let other = registry.open(dir.path().join("other.mdb"), &options).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_concurrent_open_yields_one_environment() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let path = dir.path().join("shared.mdb");
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let registry = registry.clone();
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let env = registry.open(&path, &EnvironmentOptions::default()).unwrap();
                let db = env.database("users", false, DbFlags::empty()).unwrap();
                (env, db)
            })
        })
        .collect();

    let opened: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (env, db) in &opened[1..] {
        assert!(Arc::ptr_eq(env, &opened[0].0));
        assert!(Arc::ptr_eq(db, &opened[0].1));
    }
}

#[test]
fn test_environment_closes_on_last_release() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let path = dir.path().join("data.mdb");

    let env = registry.open(&path, &EnvironmentOptions::default()).unwrap();
    let db = env.database("users", false, DbFlags::empty()).unwrap();
    db.put(b"alice", b"data1", WriteFlags::empty()).unwrap();

    drop(env);
    // Databases do not keep their environment open
    assert!(!registry.contains(&path));
    assert!(registry.is_empty());

    assert_eq!(db.get(b"alice").unwrap_err().kind(), ErrorKind::EnvNotOpen);
    assert_eq!(db.put(b"bob", b"data2", WriteFlags::empty()).unwrap_err().kind(), ErrorKind::EnvNotOpen);
    assert_eq!(db.environment().unwrap_err().kind(), ErrorKind::EnvNotOpen);
    drop(db);

    let reopened = registry.open(&path, &EnvironmentOptions::default()).unwrap();
    let db = reopened.database("users", false, DbFlags::empty()).unwrap();
    assert_eq!(db.get(b"alice").unwrap(), b"data1");
    assert!(Arc::ptr_eq(&db.environment().unwrap(), &reopened));
}

#[test]
fn test_database_singleton_per_name() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let env = registry.open(dir.path().join("data.mdb"), &EnvironmentOptions::default()).unwrap();

    let first = env.database("users", false, DbFlags::empty()).unwrap();
    let second = env.database("users", false, DbFlags::empty()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // Later opens keep the first settings
    let third = env.database("users", true, DbFlags::empty()).unwrap();
    assert!(Arc::ptr_eq(&first, &third));
    assert!(!third.compressed());

    let orders = env.database("orders", false, DbFlags::empty()).unwrap();
    assert!(!Arc::ptr_eq(&first, &orders));
    assert!(Arc::ptr_eq(&orders.environment().unwrap(), &env));
}

#[test]
fn test_database_kept_after_release() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let env = registry.open(dir.path().join("data.mdb"), &EnvironmentOptions::default()).unwrap();

    let db = env.database("users", false, DbFlags::empty()).unwrap();
    db.put(b"k", b"v", WriteFlags::empty()).unwrap();
    let released = Arc::downgrade(&db);
    drop(db);

    // The environment still owns the handle
    let kept = released.upgrade().unwrap();
    let db = env.database("users", false, DbFlags::empty()).unwrap();
    assert!(Arc::ptr_eq(&db, &kept));
    assert_eq!(db.get(b"k").unwrap(), b"v");

    drop((db, kept));
    drop(env);
    assert!(released.upgrade().is_none());
}

#[test]
fn test_too_many_databases() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let options = EnvironmentOptions::new().max_databases(2);
    let env = registry.open(dir.path().join("data.mdb"), &options).unwrap();

    let _a = env.database("a", false, DbFlags::empty()).unwrap();
    let _b = env.database("b", false, DbFlags::empty()).unwrap();
    let err = env.database("c", false, DbFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DbsFull);
    assert_eq!(env.open_transactions(), 0);
}

#[test]
fn test_directory_environment() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let options = EnvironmentOptions::new().flags(EnvFlags::empty());
    let path = dir.path().join("envdir");

    let env = registry.open(&path, &options).unwrap();
    let db = env.database("", false, DbFlags::empty()).unwrap();
    db.put(b"k", b"v", WriteFlags::empty()).unwrap();

    assert!(path.join("data.mdb").is_file());
    assert!(env.path().is_dir());
}

#[test]
fn test_file_path_that_is_directory_fails() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();

    let err = registry.open(dir.path(), &EnvironmentOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    assert!(registry.is_empty());
}

#[test]
fn test_read_only_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.mdb");
    {
        let registry = EnvironmentRegistry::new();
        let env = registry.open(&path, &EnvironmentOptions::default()).unwrap();
        let db = env.database("users", false, DbFlags::empty()).unwrap();
        db.put(b"alice", b"data1", WriteFlags::empty()).unwrap();
    }

    let registry = EnvironmentRegistry::new();
    let options = EnvironmentOptions::new().flags(EnvFlags::NOSUBDIR | EnvFlags::RDONLY);
    let env = registry.open(&path, &options).unwrap();
    assert!(env.is_readonly());

    let db = env.database("users", false, DbFlags::empty()).unwrap();
    assert_eq!(db.get(b"alice").unwrap(), b"data1");
    assert!(db.put(b"bob", b"data2", WriteFlags::empty()).is_err());
    assert_eq!(env.open_transactions(), 0);

    // A writer that fails to begin is not counted
    assert!(env.transaction(false).is_err());
    assert_eq!(env.open_transactions(), 0);

    // Nothing can be created in a read-only environment
    let err = env.database("missing", false, DbFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_copy_environment() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let env = registry.open(dir.path().join("data.mdb"), &EnvironmentOptions::default()).unwrap();
    let db = env.database("users", false, DbFlags::empty()).unwrap();
    db.put(b"alice", b"data1", WriteFlags::empty()).unwrap();

    let plain = dir.path().join("backup").join("plain.mdb");
    let compact = dir.path().join("backup").join("compact.mdb");
    env.copy(&plain, CopyFlags::empty()).unwrap();
    env.copy(&compact, CopyFlags::COMPACT).unwrap();
    // Copying again replaces the previous file
    env.copy(&compact, CopyFlags::COMPACT).unwrap();

    for path in [plain, compact] {
        let copy = registry.open(&path, &EnvironmentOptions::default()).unwrap();
        assert!(!Arc::ptr_eq(&copy, &env));
        let users = copy.database("users", false, DbFlags::empty()).unwrap();
        assert_eq!(users.get(b"alice").unwrap(), b"data1");
    }
}

#[test]
fn test_environment_flags_and_info() {
    let dir = TempDir::new().unwrap();
    let registry = EnvironmentRegistry::new();
    let env = registry.open(dir.path().join("data.mdb"), &EnvironmentOptions::default()).unwrap();

    let flags = env.get_flags().unwrap();
    assert!(flags.contains(EnvFlags::NOSUBDIR));
    assert!(flags.contains(EnvFlags::NOTLS));

    env.set_flags(EnvFlags::NOSYNC, true).unwrap();
    assert!(env.get_flags().unwrap().contains(EnvFlags::NOSYNC));
    env.set_flags(EnvFlags::NOSYNC, false).unwrap();
    assert!(!env.get_flags().unwrap().contains(EnvFlags::NOSYNC));

    let err = env.set_flags(EnvFlags::RDONLY, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Incompatible);

    env.flush(true).unwrap();

    let info = env.info().unwrap();
    assert_eq!(info.map_size, env.map_size().unwrap());
    assert_eq!(info.max_readers, env.max_readers().unwrap());
    assert!(env.max_key_size() > 0);
}

#[test]
fn test_global_instance() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("global.mdb");

    let first = Environment::instance(&path, &EnvironmentOptions::default()).unwrap();
    let second = Environment::instance(&path, &EnvironmentOptions::default()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(EnvironmentRegistry::global().contains(&path));

    drop(first);
    drop(second);
    assert!(!EnvironmentRegistry::global().contains(&path));
}
