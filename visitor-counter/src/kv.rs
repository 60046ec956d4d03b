use {
    std::{sync::{Arc, Mutex, MutexGuard}, path::{Component, Path, PathBuf}, fs, io::{self, Write}, time::Duration},
    thiserror::Error,
    rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior, types::ValueRef},
};

pub trait KVStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Writes `value` only if the stored value is still `expected` (`None` means the key must be absent).
    /// Returns `StorageError::Conflict` and leaves the stored value as is otherwise.
    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, value: &[u8]) -> Result<(), StorageError>;
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum StorageError {
    /// Storage operation failed because of internal error in storage implementation
    /// If this happens, something is very broken (similar to 503 response in http).
    #[error("internal io error: {description}")]
    InternalError {
        description: String,
    },

    /// Storage could not serve the operation in time (locked database, unreachable backend).
    #[error("storage unavailable: {description}")]
    Unavailable {
        description: String,
    },

    /// Key used in this operation violates one of constraints set by this storage backend.
    #[error("key used in this operation violates one of constraints set by this storage backend: {description}")]
    KeyConstraintError {
        description: String,
    },

    /// Value changed since it was read, conditional write was not applied.
    #[error("conditional write conflict")]
    Conflict,
}

#[derive(Clone)]
pub struct SqliteStorage {
    connection: Arc<Mutex<Connection>>,
}

#[derive(Error, Debug)]
pub enum SqliteStorageConnectionError {
    #[error("failed to open connection: {0:?}")]
    ConnectionOpenError(rusqlite::Error),

    #[error("failed to init database: {0:?}")]
    DatabaseInitError(rusqlite::Error),
}

impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, SqliteStorageConnectionError> {
        Self::from_connection(
            Connection::open(path).map_err(SqliteStorageConnectionError::ConnectionOpenError)?,
            busy_timeout,
        )
    }

    pub fn in_memory() -> Result<Self, SqliteStorageConnectionError> {
        Self::from_connection(
            Connection::open_in_memory().map_err(SqliteStorageConnectionError::ConnectionOpenError)?,
            Duration::ZERO,
        )
    }

    fn from_connection(connection: Connection, busy_timeout: Duration) -> Result<Self, SqliteStorageConnectionError> {
        connection.busy_timeout(busy_timeout)
            .map_err(SqliteStorageConnectionError::DatabaseInitError)?;
        connection.execute("create table if not exists kv (key blob primary key, value blob)", ())
            .map_err(SqliteStorageConnectionError::DatabaseInitError)?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)) })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.connection.lock()
            .map_err(|err| StorageError::InternalError { description: format!("failed to acquire sqlite connection: {err:?}") })
    }

    /// Takes the write lock before reading, so that writers from other connections wait on the busy
    /// timeout instead of failing on lock upgrade.
    fn write(&self, query: impl FnOnce(&Transaction) -> rusqlite::Result<usize>) -> Result<usize, StorageError> {
        let mut connection = self.connection()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| sqlite_error("failed to begin sqlite transaction", err))?;
        let updated = query(&tx)
            .map_err(|err| sqlite_error("failed to execute sqlite query", err))?;
        tx.commit()
            .map_err(|err| sqlite_error("failed to commit sqlite transaction", err))?;
        Ok(updated)
    }
}

fn sqlite_error(context: &str, err: rusqlite::Error) -> StorageError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => StorageError::Unavailable {
            description: format!("{context}: {err:?}"),
        },
        _ => StorageError::InternalError { description: format!("{context}: {err:?}") },
    }
}

impl KVStorage for SqliteStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let connection = self.connection()?;
        let mut stmt = connection.prepare("select value from kv where key = ?1")
            .map_err(|err| sqlite_error("failed to prepare sqlite query", err))?;
        let mut rows = stmt.query([key])
            .map_err(|err| sqlite_error("failed to run sqlite query", err))?;

        let row = match rows.next().map_err(|err| sqlite_error("failed to read row from sqlite result", err))? {
            Some(v) => v,
            None => return Ok(None),
        };

        // rows written by other tools may hold the value as text or integer rather than blob
        let value = match row.get_ref(0).map_err(|err| sqlite_error("failed to decode sqlite result", err))? {
            ValueRef::Blob(v) | ValueRef::Text(v) => v.to_vec(),
            ValueRef::Integer(v) => v.to_string().into_bytes(),
            // keeps the fraction (`5.0`), so a float row is never taken for a count
            ValueRef::Real(v) => format!("{v:?}").into_bytes(),
            ValueRef::Null => Vec::new(),
        };

        Ok(Some(value))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.write(|tx| tx.execute("insert or replace into kv (key, value) values (?1, ?2)", (key, value)))
            .map(|_| ())
    }

    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, value: &[u8]) -> Result<(), StorageError> {
        let updated = self.write(|tx| match expected {
            Some(expected) => tx.execute(
                "update kv set value = ?3 where key = ?1 and cast(value as blob) = ?2",
                (key, expected, value),
            ),
            None => tx.execute(
                "insert into kv (key, value) values (?1, ?2) on conflict(key) do nothing",
                (key, value),
            ),
        })?;

        if updated == 0 {
            Err(StorageError::Conflict)
        } else {
            Ok(())
        }
    }
}

/// Stores every key as a file under `path`. Conditional writes are linearizable within one process only.
#[derive(Clone)]
pub struct FsStorage {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Error, Debug)]
pub enum FsStorageInitError {
    #[error("failed to create directory for filesystem storage: {0:?}")]
    FailedToCreateDirectory(std::io::Error),
}

impl FsStorage {
    pub fn new(path: PathBuf) -> Result<Self, FsStorageInitError> {
        fs::create_dir_all(&path)
            .map_err(FsStorageInitError::FailedToCreateDirectory)?;
        Ok(Self {
            path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn path_for_key(&self, key: &[u8]) -> Result<PathBuf, StorageError> {
        let key = String::from_utf8(key.to_vec())
            .map_err(|err| StorageError::KeyConstraintError {
                description: format!("should be able to decode as Utf8, got error: {err:?}"),
            })?;

        let relative = Path::new(&key);
        let is_plain_relative = relative.components().all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !is_plain_relative {
            return Err(StorageError::KeyConstraintError {
                description: format!("key should be a plain relative path, got: {key:?}"),
            });
        }

        Ok(self.path.join(relative))
    }

    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(path) {
            Ok(v) => Ok(Some(v)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::InternalError { description: format!("failed to read file: {err:?}") }),
        }
    }

    fn write(&self, path: &Path, value: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|err| StorageError::InternalError { description: format!("failed to create parent directory for FsStorage: {err:?}") })?;
            }
        }

        // readers never observe a partially written value
        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let mut file = fs::File::create(&tmp_path)
            .map_err(|err| StorageError::InternalError { description: format!("failed to create file: {err:?}") })?;
        file.write_all(value)
            .and_then(|_| file.sync_all())
            .map_err(|err| StorageError::InternalError { description: format!("failed to write file: {err:?}") })?;
        fs::rename(&tmp_path, path)
            .map_err(|err| StorageError::InternalError { description: format!("failed to move file into place: {err:?}") })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.write_lock.lock()
            .map_err(|err| StorageError::InternalError { description: format!("failed to acquire FsStorage write lock: {err:?}") })
    }
}

impl KVStorage for FsStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.read(&self.path_for_key(key)?)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for_key(key)?;
        let _guard = self.lock()?;
        self.write(&path, value)
    }

    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for_key(key)?;
        let _guard = self.lock()?;
        if self.read(&path)?.as_deref() != expected {
            return Err(StorageError::Conflict);
        }
        self.write(&path, value)
    }
}

pub struct NamespacedStorage<T> {
    namespace: Vec<u8>,
    inner: T,
}

impl<T> NamespacedStorage<T> {
    pub fn new(namespace: impl Into<Vec<u8>>, inner: T) -> Self {
        Self {
            namespace: namespace.into(),
            inner,
        }
    }

    fn namespaced_key(&self, key: &[u8]) -> Vec<u8> {
        let mut namespaced_key = Vec::with_capacity(self.namespace.len() + key.len());
        namespaced_key.extend_from_slice(&self.namespace);
        namespaced_key.extend_from_slice(key);
        namespaced_key
    }
}

impl<T: KVStorage> KVStorage for NamespacedStorage<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> { self.inner.get(&self.namespaced_key(key)) }
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> { self.inner.set(&self.namespaced_key(key), value) }
    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, value: &[u8]) -> Result<(), StorageError> {
        self.inner.compare_and_swap(&self.namespaced_key(key), expected, value)
    }
}

#[derive(Clone)]
pub struct BoxedStorage {
    inner: Arc<dyn KVStorage + Send + Sync>,
}

impl BoxedStorage {
    pub fn new<T: KVStorage + Send + Sync + 'static>(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl KVStorage for BoxedStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.inner.set(key, value)
    }

    fn compare_and_swap(&self, key: &[u8], expected: Option<&[u8]>, value: &[u8]) -> Result<(), StorageError> {
        self.inner.compare_and_swap(key, expected, value)
    }
}

pub trait WithKey: Sized {
    fn with_key(self, key: &[u8], value: &[u8]) -> Result<Self, StorageError>;
}

impl<S: KVStorage> WithKey for S {
    fn with_key(self, key: &[u8], value: &[u8]) -> Result<Self, StorageError> {
        self.set(key, value)?;
        Ok(self)
    }
}
