use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// For compile-time keys known to pass validation.
    pub(crate) fn fixed(namespace: KeyNamespace, key: &'static str) -> Self {
        debug_assert!(Self::validate_key(key).is_ok());
        Self {
            namespace,
            key: key.to_string(),
        }
    }

    /// Storage key as the shell sees it, e.g. `mobile_current_trip`.
    pub fn raw(&self) -> String {
        format!("{}_{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be only whitespace".to_string(),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

/// Prefix shared by every key the core writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Mobile,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Mobile => "mobile",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Synchronous string blob store, the shape of browser local storage.
pub trait KvBackend {
    fn get(&self, key: &KvKey) -> Result<Option<String>, KvError>;
    fn set(&mut self, key: &KvKey, value: &str) -> Result<(), KvError>;
    fn remove(&mut self, key: &KvKey) -> Result<bool, KvError>;
}

fn check_value_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    entries: HashMap<String, String>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn raw_value(&self, raw_key: &str) -> Option<&str> {
        self.entries.get(raw_key).map(String::as_str)
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        Ok(self.entries.get(&key.raw()).cloned())
    }

    fn set(&mut self, key: &KvKey, value: &str) -> Result<(), KvError> {
        check_value_size(value)?;
        self.entries.insert(key.raw(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.entries.remove(&key.raw()).is_some())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKv;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value_size, KvBackend, KvError, KvKey, StorageErrorCode};
    use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
    use std::path::Path;

    /// SQLite-backed store for native shells.
    pub struct SqliteKv {
        conn: Connection,
    }

    impl SqliteKv {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(storage_error)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(storage_error)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(storage_error)?;
            Ok(Self { conn })
        }
    }

    impl KvBackend for SqliteKv {
        fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
            self.conn
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    params![key.raw()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(storage_error)
        }

        fn set(&mut self, key: &KvKey, value: &str) -> Result<(), KvError> {
            check_value_size(value)?;
            self.conn
                .execute(
                    r#"
                    INSERT INTO kv_store (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![key.raw(), value, chrono::Utc::now().timestamp_millis()],
                )
                .map_err(storage_error)?;
            Ok(())
        }

        fn remove(&mut self, key: &KvKey) -> Result<bool, KvError> {
            let deleted = self
                .conn
                .execute("DELETE FROM kv_store WHERE key = ?1", params![key.raw()])
                .map_err(storage_error)?;
            Ok(deleted > 0)
        }
    }

    fn storage_error(e: rusqlite::Error) -> KvError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                ErrorCode::SystemIoFailure | ErrorCode::CannotOpen => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }
}

/// A single JSON-encoded value under a fixed key.
pub struct TypedSlot<T> {
    key: KvKey,
    _phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> TypedSlot<T> {
    pub fn new(key: KvKey) -> Self {
        Self {
            key,
            _phantom: PhantomData,
        }
    }

    pub fn key(&self) -> &KvKey {
        &self.key
    }

    pub fn load<B: KvBackend + ?Sized>(&self, backend: &B) -> Result<Option<T>, KvError> {
        match backend.get(&self.key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                    key: Some(self.key.raw()),
                }),
            None => Ok(None),
        }
    }

    pub fn save<B: KvBackend + ?Sized>(&self, backend: &mut B, value: &T) -> Result<(), KvError> {
        let raw = serde_json::to_string(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(self.key.raw()),
        })?;
        backend.set(&self.key, &raw)
    }

    pub fn clear<B: KvBackend + ?Sized>(&self, backend: &mut B) -> Result<bool, KvError> {
        backend.remove(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation_empty() {
        let result = KvKey::new(KeyNamespace::Mobile, "");
        assert!(matches!(result, Err(KvError::InvalidKey { .. })));
    }

    #[test]
    fn test_key_validation_whitespace() {
        assert!(KvKey::new(KeyNamespace::Mobile, "   ").is_err());
    }

    #[test]
    fn test_key_validation_null_byte() {
        assert!(KvKey::new(KeyNamespace::Mobile, "key\0value").is_err());
    }

    #[test]
    fn test_key_validation_path_traversal() {
        assert!(KvKey::new(KeyNamespace::Mobile, "../etc/passwd").is_err());
    }

    #[test]
    fn test_key_validation_too_long() {
        let long_key = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(KvKey::new(KeyNamespace::Mobile, long_key).is_err());
    }

    #[test]
    fn test_key_namespace_prefix() {
        let key = KvKey::new(KeyNamespace::Mobile, "current_driver").unwrap();
        assert_eq!(key.raw(), "mobile_current_driver");
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::Serialization {
            message: "x".into(),
            key: None
        }
        .is_retryable());
    }

    #[test]
    fn test_memory_backend_set_get_remove() {
        let mut kv = MemoryKv::new();
        let key = KvKey::new(KeyNamespace::Mobile, "current_trip").unwrap();

        kv.set(&key, "{\"a\":1}").unwrap();
        assert_eq!(kv.get(&key).unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(kv.raw_value("mobile_current_trip"), Some("{\"a\":1}"));

        assert!(kv.remove(&key).unwrap());
        assert!(!kv.remove(&key).unwrap());
        assert!(kv.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_value_size_limit() {
        let mut kv = MemoryKv::new();
        let key = KvKey::new(KeyNamespace::Mobile, "big").unwrap();
        let result = kv.set(&key, &"x".repeat(MAX_VALUE_SIZE + 1));
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
    }

    #[test]
    fn test_typed_slot() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Marker {
            id: u64,
            name: String,
        }

        let mut kv = MemoryKv::new();
        let slot: TypedSlot<Marker> =
            TypedSlot::new(KvKey::new(KeyNamespace::Mobile, "marker").unwrap());

        assert!(slot.load(&kv).unwrap().is_none());

        let marker = Marker {
            id: 1,
            name: "bus 05".to_string(),
        };
        slot.save(&mut kv, &marker).unwrap();
        assert_eq!(slot.load(&kv).unwrap(), Some(marker));

        kv.set(slot.key(), "not json").unwrap();
        assert!(matches!(
            slot.load(&kv),
            Err(KvError::Serialization { key: Some(_), .. })
        ));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_sqlite_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");
        let key = KvKey::new(KeyNamespace::Mobile, "current_driver").unwrap();

        {
            let mut kv = SqliteKv::open(&path).unwrap();
            kv.set(&key, "first").unwrap();
            kv.set(&key, "second").unwrap();
        }

        let mut kv = SqliteKv::open(&path).unwrap();
        assert_eq!(kv.get(&key).unwrap().as_deref(), Some("second"));
        assert!(kv.remove(&key).unwrap());
        assert!(kv.get(&key).unwrap().is_none());
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_sqlite_in_memory() {
        let mut kv = SqliteKv::open_in_memory().unwrap();
        let key = KvKey::new(KeyNamespace::Mobile, "offline_queue").unwrap();
        assert!(kv.get(&key).unwrap().is_none());
        kv.set(&key, "[]").unwrap();
        assert_eq!(kv.get(&key).unwrap().as_deref(), Some("[]"));
    }
}
