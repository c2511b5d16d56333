//! Shared types for hfetch
//!
//! This crate contains the plain data structures used by both the
//! fetch engine and the CLI: attribute flags, bounded strings,
//! engine settings and persisted-file metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;

// ============================================================================
// Attribute Flags
// ============================================================================

/// Raw attribute bit-set of a fetch request.
///
/// Bit values are fixed and combinable. `APPEND`, `REPLACE` and
/// `NO_DOWNLOAD` form a mutually exclusive group; a set with more than one
/// of them is representable here but rejected when the request starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchFlags(u32);

impl FetchFlags {
    /// Keep the full body in memory and hand it to the success callback.
    pub const LOAD_TO_MEMORY: FetchFlags = FetchFlags(1);
    /// Hand each received chunk to the progress callback.
    pub const STREAM_DATA: FetchFlags = FetchFlags(2);
    /// Store the finished body in the persistent store.
    pub const PERSIST_FILE: FetchFlags = FetchFlags(4);
    /// Serve a stored copy, resuming a partial one.
    pub const APPEND: FetchFlags = FetchFlags(8);
    /// Drop any stored copy and download again.
    pub const REPLACE: FetchFlags = FetchFlags(16);
    /// Only look in the store, never go to the network.
    pub const NO_DOWNLOAD: FetchFlags = FetchFlags(32);

    const STORAGE_GROUP: u32 = 8 | 16 | 32;

    pub const fn empty() -> Self {
        FetchFlags(0)
    }

    /// Build from raw bits. Unknown bits are kept and ignored by the engine.
    pub const fn from_bits_retain(bits: u32) -> Self {
        FetchFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: FetchFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FetchFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FetchFlags) {
        self.0 &= !other.0;
    }

    /// Bits of the mutually exclusive storage group that are set
    pub const fn storage_bits(self) -> FetchFlags {
        FetchFlags(self.0 & Self::STORAGE_GROUP)
    }
}

impl BitOr for FetchFlags {
    type Output = FetchFlags;

    fn bitor(self, rhs: FetchFlags) -> FetchFlags {
        FetchFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for FetchFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(FetchFlags, &str); 6] = [
            (FetchFlags::LOAD_TO_MEMORY, "LOAD_TO_MEMORY"),
            (FetchFlags::STREAM_DATA, "STREAM_DATA"),
            (FetchFlags::PERSIST_FILE, "PERSIST_FILE"),
            (FetchFlags::APPEND, "APPEND"),
            (FetchFlags::REPLACE, "REPLACE"),
            (FetchFlags::NO_DOWNLOAD, "NO_DOWNLOAD"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join(" | "))
        }
    }
}

/// How a transfer treats a copy already present in the persistent store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Serve a complete stored copy; otherwise download from scratch.
    #[default]
    Default,
    /// Serve a complete stored copy, resume a partial one.
    Append,
    /// Delete the stored copy and download again.
    Replace,
    /// Serve a complete stored copy or fail without touching the network.
    NoDownload,
}

impl StorageMode {
    fn flag(self) -> FetchFlags {
        match self {
            StorageMode::Default => FetchFlags::empty(),
            StorageMode::Append => FetchFlags::APPEND,
            StorageMode::Replace => FetchFlags::REPLACE,
            StorageMode::NoDownload => FetchFlags::NO_DOWNLOAD,
        }
    }
}

/// Validated, typed view of [`FetchFlags`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchAttributes {
    pub load_to_memory: bool,
    pub stream_data: bool,
    pub persist_file: bool,
    pub storage_mode: StorageMode,
}

impl FetchAttributes {
    /// Convert back to the raw bit-set
    pub fn flags(&self) -> FetchFlags {
        let mut flags = self.storage_mode.flag();
        if self.load_to_memory {
            flags.insert(FetchFlags::LOAD_TO_MEMORY);
        }
        if self.stream_data {
            flags.insert(FetchFlags::STREAM_DATA);
        }
        if self.persist_file {
            flags.insert(FetchFlags::PERSIST_FILE);
        }
        flags
    }
}

/// More than one flag of the exclusive storage group was set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeConflict(pub FetchFlags);

impl fmt::Display for AttributeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "APPEND, REPLACE and NO_DOWNLOAD are mutually exclusive (got {})",
            self.0.storage_bits()
        )
    }
}

impl std::error::Error for AttributeConflict {}

impl TryFrom<FetchFlags> for FetchAttributes {
    type Error = AttributeConflict;

    fn try_from(flags: FetchFlags) -> Result<Self, Self::Error> {
        let storage_mode = match flags.storage_bits() {
            FetchFlags(0) => StorageMode::Default,
            FetchFlags(8) => StorageMode::Append,
            FetchFlags(16) => StorageMode::Replace,
            FetchFlags(32) => StorageMode::NoDownload,
            _ => return Err(AttributeConflict(flags)),
        };

        Ok(Self {
            load_to_memory: flags.contains(FetchFlags::LOAD_TO_MEMORY),
            stream_data: flags.contains(FetchFlags::STREAM_DATA),
            persist_file: flags.contains(FetchFlags::PERSIST_FILE),
            storage_mode,
        })
    }
}

// ============================================================================
// Bounded Strings
// ============================================================================

/// Size of the request method buffer, terminator included
pub const REQUEST_METHOD_CAPACITY: usize = 32;

/// Size of the destination path buffer, terminator included
pub const PATH_MAX: usize = 4096;

/// HTTP method name, at most 31 bytes
pub type RequestMethod = BoundedString<REQUEST_METHOD_CAPACITY>;

/// Key into the persistent store, at most `PATH_MAX - 1` bytes
pub type DestinationPath = BoundedString<PATH_MAX>;

/// Why a value was refused by [`BoundedString::new`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedStringError {
    TooLong { len: usize, max: usize },
    InteriorNul,
}

impl fmt::Display for BoundedStringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundedStringError::TooLong { len, max } => {
                write!(f, "value is {} bytes long, at most {} allowed", len, max)
            }
            BoundedStringError::InteriorNul => write!(f, "value contains a NUL byte"),
        }
    }
}

impl std::error::Error for BoundedStringError {}

/// A string that fits a NUL-terminated buffer of `CAP` bytes.
///
/// Construction is explicit about overflow: [`BoundedString::new`] refuses
/// values that do not fit, [`BoundedString::truncated`] cuts them at the
/// last char boundary that does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoundedString<const CAP: usize>(String);

impl<const CAP: usize> BoundedString<CAP> {
    /// Longest accepted value in bytes
    pub const MAX_LEN: usize = CAP - 1;

    pub const fn empty() -> Self {
        Self(String::new())
    }

    pub fn new(value: &str) -> Result<Self, BoundedStringError> {
        if value.contains('\0') {
            return Err(BoundedStringError::InteriorNul);
        }
        if value.len() > Self::MAX_LEN {
            return Err(BoundedStringError::TooLong {
                len: value.len(),
                max: Self::MAX_LEN,
            });
        }
        Ok(Self(value.to_string()))
    }

    /// Keep what fits, like copying into the fixed buffer would.
    pub fn truncated(value: &str) -> Self {
        let value = value.split('\0').next().unwrap_or_default();
        let mut end = value.len().min(Self::MAX_LEN);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        Self(value[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Reset to the empty string, keeping the allocation
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl<const CAP: usize> TryFrom<String> for BoundedString<CAP> {
    type Error = BoundedStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl<const CAP: usize> From<BoundedString<CAP>> for String {
    fn from(value: BoundedString<CAP>) -> Self {
        value.0
    }
}

impl<const CAP: usize> fmt::Display for BoundedString<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<const CAP: usize> AsRef<str> for BoundedString<CAP> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the persistent store. `None` disables persistence.
    pub data_dir: Option<PathBuf>,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Whole-request timeout applied when a request sets none
    pub request_timeout_secs: Option<u64>,
    /// Bytes per second shared by all transfers
    pub speed_limit: Option<u64>,
    /// Connection-level retries before the first body byte
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Minimum gap between progress callbacks of non-streaming transfers
    pub progress_interval_ms: u64,
    pub worker_threads: Option<usize>,
    pub proxy: ProxySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::cache_dir().map(|d| d.join("hfetch")),
            user_agent: format!("hfetch/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            request_timeout_secs: None,
            speed_limit: None,
            max_retries: 0,
            retry_delay_ms: 500,
            progress_interval_ms: 300,
            worker_threads: None,
            proxy: ProxySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Settings with the persistent store rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    /// Settings without a persistent store
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            ..Self::default()
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub mode: ProxyMode,
    /// HTTP proxy URL (manual mode)
    pub http_proxy: Option<String>,
    /// HTTPS proxy URL (manual mode)
    pub https_proxy: Option<String>,
    /// Comma-separated hosts that bypass the proxy
    pub no_proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mode: ProxyMode::System,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    None,
    #[default]
    System,
    Manual,
}

// ============================================================================
// Store Types
// ============================================================================

/// Metadata of one file in the persistent store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Destination path the file is keyed by
    pub path: String,
    /// URL the bytes came from
    pub url: String,
    pub total_bytes: Option<u64>,
    pub stored_bytes: u64,
    pub complete: bool,
    pub updated_at: DateTime<Utc>,
}

impl StoredEntry {
    /// True when some bytes were stored but the transfer never finished
    pub fn is_partial(&self) -> bool {
        !self.complete && self.stored_bytes > 0
    }

    pub fn progress(&self) -> f64 {
        if self.complete {
            return 100.0;
        }
        match self.total_bytes {
            Some(total) if total > 0 => (self.stored_bytes as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_stable() {
        assert_eq!(FetchFlags::LOAD_TO_MEMORY.bits(), 1);
        assert_eq!(FetchFlags::STREAM_DATA.bits(), 2);
        assert_eq!(FetchFlags::PERSIST_FILE.bits(), 4);
        assert_eq!(FetchFlags::APPEND.bits(), 8);
        assert_eq!(FetchFlags::REPLACE.bits(), 16);
        assert_eq!(FetchFlags::NO_DOWNLOAD.bits(), 32);
    }

    #[test]
    fn flags_insert_and_remove() {
        let mut flags = FetchFlags::LOAD_TO_MEMORY | FetchFlags::PERSIST_FILE;
        assert!(flags.contains(FetchFlags::PERSIST_FILE));
        flags.remove(FetchFlags::PERSIST_FILE);
        assert!(!flags.contains(FetchFlags::PERSIST_FILE));
        flags.insert(FetchFlags::APPEND);
        assert_eq!(flags.bits(), 9);
        assert_eq!(flags.to_string(), "LOAD_TO_MEMORY | APPEND");
        assert_eq!(FetchFlags::empty().to_string(), "(none)");
    }

    #[test]
    fn attributes_from_flags() {
        let flags = FetchFlags::LOAD_TO_MEMORY | FetchFlags::STREAM_DATA | FetchFlags::REPLACE;
        let attrs = FetchAttributes::try_from(flags).unwrap();
        assert!(attrs.load_to_memory);
        assert!(attrs.stream_data);
        assert!(!attrs.persist_file);
        assert_eq!(attrs.storage_mode, StorageMode::Replace);
        assert_eq!(attrs.flags(), flags);

        let defaults = FetchAttributes::try_from(FetchFlags::empty()).unwrap();
        assert_eq!(defaults, FetchAttributes::default());
    }

    #[test]
    fn exclusive_storage_flags_conflict() {
        let flags = FetchFlags::APPEND | FetchFlags::REPLACE;
        let err = FetchAttributes::try_from(flags).unwrap_err();
        assert_eq!(err, AttributeConflict(flags));
        assert!(err.to_string().contains("APPEND | REPLACE"));

        let all = FetchFlags::APPEND | FetchFlags::REPLACE | FetchFlags::NO_DOWNLOAD;
        assert!(FetchAttributes::try_from(all).is_err());
    }

    #[test]
    fn unknown_bits_are_ignored() {
        let flags = FetchFlags::from_bits_retain(1 | 1024);
        let attrs = FetchAttributes::try_from(flags).unwrap();
        assert!(attrs.load_to_memory);
        assert_eq!(attrs.flags(), FetchFlags::LOAD_TO_MEMORY);
    }

    #[test]
    fn bounded_string_limits() {
        assert_eq!(RequestMethod::MAX_LEN, 31);
        assert!(RequestMethod::new("POST").is_ok());
        assert!(RequestMethod::new(&"A".repeat(31)).is_ok());
        assert_eq!(
            RequestMethod::new(&"A".repeat(32)),
            Err(BoundedStringError::TooLong { len: 32, max: 31 })
        );
        assert_eq!(
            RequestMethod::new("GE\0T"),
            Err(BoundedStringError::InteriorNul)
        );
    }

    #[test]
    fn bounded_string_truncation() {
        let long = "x".repeat(5000);
        assert_eq!(DestinationPath::truncated(&long).len(), PATH_MAX - 1);

        // 'é' is two bytes; the cut must not split it
        let method = format!("{}é", "A".repeat(30));
        let truncated = RequestMethod::truncated(&method);
        assert_eq!(truncated.as_str(), "A".repeat(30));

        assert_eq!(RequestMethod::truncated("GET\0junk").as_str(), "GET");
    }

    #[test]
    fn bounded_string_serde_validates() {
        let ok: RequestMethod = serde_json::from_str("\"PUT\"").unwrap();
        assert_eq!(ok.as_str(), "PUT");
        let too_long = format!("\"{}\"", "A".repeat(40));
        assert!(serde_json::from_str::<RequestMethod>(&too_long).is_err());
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_retries": 3}"#).unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.progress_interval_ms, 300);
        assert_eq!(config.proxy.mode, ProxyMode::System);
        assert!(EngineConfig::in_memory().data_dir.is_none());
    }

    #[test]
    fn stored_entry_progress() {
        let mut entry = StoredEntry {
            path: "assets/a.bin".to_string(),
            url: "http://localhost/a.bin".to_string(),
            total_bytes: Some(200),
            stored_bytes: 50,
            complete: false,
            updated_at: Utc::now(),
        };
        assert!(entry.is_partial());
        assert_eq!(entry.progress(), 25.0);
        entry.complete = true;
        assert!(!entry.is_partial());
        assert_eq!(entry.progress(), 100.0);
    }
}
