use {
    std::{sync::{Arc, Barrier}, thread, time::Duration},
    visitor_counter::{
        counter::CounterService,
        error::CounterError,
        kv::{BoxedStorage, FsStorage, KVStorage, NamespacedStorage, SqliteStorage, StorageError, WithKey},
    },
};

fn assert_conditional_writes(storage: &impl KVStorage) {
    assert_eq!(Ok(()), storage.compare_and_swap(b"key", None, b"1"));
    assert_eq!(Err(StorageError::Conflict), storage.compare_and_swap(b"key", None, b"2"));
    assert_eq!(Some(b"1".to_vec()), storage.get(b"key").unwrap());

    assert_eq!(Err(StorageError::Conflict), storage.compare_and_swap(b"key", Some(&b"0"[..]), b"2"));
    assert_eq!(Some(b"1".to_vec()), storage.get(b"key").unwrap());

    assert_eq!(Ok(()), storage.compare_and_swap(b"key", Some(&b"1"[..]), b"2"));
    assert_eq!(Some(b"2".to_vec()), storage.get(b"key").unwrap());

    assert_eq!(Err(StorageError::Conflict), storage.compare_and_swap(b"other", Some(&b"2"[..]), b"3"));
    assert_eq!(None, storage.get(b"other").unwrap());
}

#[test]
fn sqlite_conditional_writes() {
    assert_conditional_writes(&SqliteStorage::in_memory().unwrap());
}

#[test]
fn fs_conditional_writes() {
    let dir = tempfile::tempdir().unwrap();
    assert_conditional_writes(&FsStorage::new(dir.path().to_path_buf()).unwrap());
}

#[test]
fn namespaced_conditional_writes() {
    let inner = BoxedStorage::new(SqliteStorage::in_memory().unwrap());
    assert_conditional_writes(&NamespacedStorage::new("visitor_count2/", inner.clone()));

    assert_eq!(Some(b"2".to_vec()), inner.get(b"visitor_count2/key").unwrap());
    assert_eq!(None, inner.get(b"key").unwrap());
}

#[test]
fn fs_storage_rejects_keys_outside_of_directory() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path().join("kv")).unwrap();

    for key in [&b"../escape"[..], &b"/etc/passwd"[..], &b""[..], &b"a/../../b"[..]] {
        match storage.get(key) {
            Err(StorageError::KeyConstraintError { .. }) => {},
            other => panic!("expected key constraint error for {key:?}, got: {other:?}"),
        }
    }

    storage.set(b"table/key", b"5").unwrap();
    assert_eq!(b"5".to_vec(), std::fs::read(dir.path().join("kv").join("table").join("key")).unwrap());
}

#[test]
fn fs_storage_leaves_no_temporary_files() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path().to_path_buf()).unwrap();

    storage.set(b"visitor", b"1").unwrap();
    storage.compare_and_swap(b"visitor", Some(&b"1"[..]), b"2").unwrap();

    let files = std::fs::read_dir(dir.path()).unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(vec!["visitor".to_owned()], files);
    assert_eq!(b"2".to_vec(), std::fs::read(dir.path().join("visitor")).unwrap());
}

#[test]
fn sqlite_reads_values_written_as_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counter.db");

    {
        let connection = rusqlite::Connection::open(&path).unwrap();
        connection.execute("create table kv (key blob primary key, value blob)", ()).unwrap();
        connection.execute("insert into kv (key, value) values (?1, ?2)", (&b"visitor"[..], "41")).unwrap();
    }

    let storage = SqliteStorage::new(&path, Duration::from_secs(1)).unwrap();
    assert_eq!(Some(b"41".to_vec()), storage.get(b"visitor").unwrap());

    let counter = CounterService::new(BoxedStorage::new(storage), &b"visitor"[..]);
    assert_eq!(42, counter.increment_and_get().unwrap());
    assert_eq!(42, counter.current().unwrap());
}

#[test]
fn sqlite_float_row_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counter.db");

    {
        let connection = rusqlite::Connection::open(&path).unwrap();
        connection.execute("create table kv (key blob primary key, value blob)", ()).unwrap();
        connection.execute("insert into kv (key, value) values (?1, ?2)", (&b"visitor"[..], 5.0_f64)).unwrap();
    }

    let storage = BoxedStorage::new(SqliteStorage::new(&path, Duration::from_secs(1)).unwrap());
    assert_eq!(Some(b"5.0".to_vec()), storage.get(b"visitor").unwrap());

    let counter = CounterService::new(storage.clone(), &b"visitor"[..]);
    assert_eq!(Err(CounterError::CorruptData { value: "5.0".to_owned() }), counter.increment_and_get());
    assert_eq!(Some(b"5.0".to_vec()), storage.get(b"visitor").unwrap());
}

#[test]
fn sqlite_instances_sharing_a_file_do_not_lose_updates() {
    const INSTANCES: usize = 4;
    const INCREMENTS_PER_INSTANCE: u64 = 20;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counter.db");
    SqliteStorage::new(&path, Duration::from_secs(5)).unwrap().with_key(b"visitor", b"0").unwrap();

    let barrier = Arc::new(Barrier::new(INSTANCES));
    let handles = (0..INSTANCES)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                // every instance opens its own connection, like separate function processes would
                let storage = BoxedStorage::new(SqliteStorage::new(&path, Duration::from_secs(5)).unwrap());
                let counter = CounterService::new(storage, &b"visitor"[..]).with_max_attempts(10_000);
                barrier.wait();
                for _ in 0..INCREMENTS_PER_INSTANCE {
                    counter.increment_and_get().unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    let storage = SqliteStorage::new(&path, Duration::from_secs(5)).unwrap();
    let expected = (INSTANCES as u64 * INCREMENTS_PER_INSTANCE).to_string();
    assert_eq!(Some(expected.into_bytes()), storage.get(b"visitor").unwrap());
}

#[test]
fn fs_storage_concurrent_increments() {
    let dir = tempfile::tempdir().unwrap();
    let storage = BoxedStorage::new(FsStorage::new(dir.path().to_path_buf()).unwrap());

    let handles = (0..4)
        .map(|_| {
            let counter = CounterService::new(storage.clone(), &b"visitor"[..]).with_max_attempts(10_000);
            thread::spawn(move || {
                for _ in 0..25 {
                    counter.increment_and_get().unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(Some(b"100".to_vec()), storage.get(b"visitor").unwrap());
}
