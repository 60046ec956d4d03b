use {
    serde::Deserialize,
    tracing::{debug, info, warn},
    crate::{
        error::CounterError,
        kv::{BoxedStorage, KVStorage, StorageError},
    },
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What `increment` does when the counter record does not exist yet.
#[derive(Deserialize, Debug, Clone, Copy, Default, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MissingRecordPolicy {
    /// First-call initialization: create the record with count 1 and return 1.
    #[default]
    Initialize,
    /// Treat a missing record as a provisioning error and return `CounterError::NotFound`.
    Fail,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Increment {
    /// Value committed to storage by this call.
    pub count: u64,
    /// Conditional writes issued, including the successful one.
    pub attempts: u32,
    /// Set when this call created the record.
    pub initialized: bool,
}

/// Increment-and-fetch over a single counter record.
///
/// Holds no counter state itself: every call reads the record, then commits `count + 1`
/// with a conditional write that only succeeds if nobody changed the record in between.
/// On conflict the whole read-modify-write is repeated, up to `max_attempts` times.
#[derive(Clone)]
pub struct CounterService {
    storage: BoxedStorage,
    key: Vec<u8>,
    max_attempts: u32,
    missing_record: MissingRecordPolicy,
}

impl CounterService {
    pub fn new(storage: BoxedStorage, key: impl Into<Vec<u8>>) -> Self {
        Self {
            storage,
            key: key.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            missing_record: MissingRecordPolicy::default(),
        }
    }

    /// Values below 1 are treated as 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_missing_record_policy(mut self, policy: MissingRecordPolicy) -> Self {
        self.missing_record = policy;
        self
    }

    pub fn increment_and_get(&self) -> Result<u64, CounterError> {
        self.increment().map(|v| v.count)
    }

    pub fn increment(&self) -> Result<Increment, CounterError> {
        for attempt in 1..=self.max_attempts {
            let current = self.storage.get(&self.key)?;

            let (next, initialized) = match current.as_deref() {
                Some(value) => {
                    let count = parse_count(value)?;
                    (count.checked_add(1).ok_or(CounterError::Overflow)?, false)
                },
                None => match self.missing_record {
                    MissingRecordPolicy::Initialize => (1, true),
                    MissingRecordPolicy::Fail => return Err(self.not_found()),
                },
            };

            match self.storage.compare_and_swap(&self.key, current.as_deref(), next.to_string().as_bytes()) {
                Ok(()) => {
                    if initialized {
                        info!(key = %self.key_str(), "counter record created by first increment");
                    }
                    return Ok(Increment {
                        count: next,
                        attempts: attempt,
                        initialized,
                    });
                },
                Err(StorageError::Conflict) => {
                    debug!(attempt, key = %self.key_str(), "counter record changed concurrently, retrying");
                },
                Err(err) => return Err(err.into()),
            }
        }

        warn!(attempts = self.max_attempts, key = %self.key_str(), "giving up on counter increment, every attempt conflicted");
        Err(CounterError::StoreUnavailable {
            reason: format!("counter update still conflicting after {} attempts", self.max_attempts),
        })
    }

    /// Committed count, without changing it.
    pub fn current(&self) -> Result<u64, CounterError> {
        match self.storage.get(&self.key)? {
            Some(value) => parse_count(&value),
            None => Err(self.not_found()),
        }
    }

    /// Out-of-band creation of the record. Never overwrites an existing one.
    pub fn provision(&self, initial: u64) -> Result<(), CounterError> {
        match self.storage.compare_and_swap(&self.key, None, initial.to_string().as_bytes()) {
            Ok(()) => {
                info!(key = %self.key_str(), initial, "counter record provisioned");
                Ok(())
            },
            Err(StorageError::Conflict) => Err(CounterError::AlreadyExists { key: self.key_str() }),
            Err(err) => Err(err.into()),
        }
    }

    fn not_found(&self) -> CounterError {
        CounterError::NotFound { key: self.key_str() }
    }

    fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Counts are stored as decimal text. Signs, whitespace and empty values are rejected.
pub fn parse_count(value: &[u8]) -> Result<u64, CounterError> {
    let corrupt = || CounterError::CorruptData { value: String::from_utf8_lossy(value).into_owned() };

    if value.is_empty() || !value.iter().all(|v| v.is_ascii_digit()) {
        return Err(corrupt());
    }

    std::str::from_utf8(value)
        .map_err(|_| corrupt())?
        .parse::<u64>()
        .map_err(|_| corrupt())
}
