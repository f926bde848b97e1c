//! Backend configuration loaded from a JSON file.
//!
//! Every field has a default, so an empty object `{}` is a valid file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};
use crate::memory::{DEFAULT_CACHE_SIZE, MemorySize};
use crate::schema::SchemaConfig;
use crate::sysmem::MemorySanity;

/// Default all-ids threshold.
pub const DEFAULT_ALLIDS_THRESHOLD: usize = 4000;

/// Index types an attribute can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    #[serde(alias = "equality")]
    Eq,
    #[serde(alias = "substring")]
    Sub,
    #[serde(alias = "presence")]
    Pres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub attribute: String,
    pub types: Vec<IndexKind>,
}

impl IndexConfig {
    pub fn new(attribute: &str, types: &[IndexKind]) -> Self {
        Self {
            attribute: attribute.to_string(),
            types: types.to_vec(),
        }
    }
}

/// Search scope of a VLV index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Base,
    #[serde(alias = "onelevel")]
    One,
    #[default]
    Sub,
}

/// A VLV index definition: the search it serves and its sort order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlvConfig {
    pub name: String,
    pub base: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default = "default_vlv_filter")]
    pub filter: String,
    /// Sort attributes; a leading `-` sorts descending.
    pub sort: Vec<String>,
}

fn default_vlv_filter() -> String {
    "(objectclass=*)".to_string()
}

/// ID list representation, which also picks the ancestorid build algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlMode {
    /// Keys keep every id; ancestorid is streamed key by key.
    #[default]
    New,
    /// Keys collapse to the all-ids marker past the threshold; ancestorid
    /// is built from an in-memory closure.
    Old,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordScheme {
    #[default]
    Clear,
    Ssha256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend instance name; also the database sub-directory.
    pub instance: String,
    /// Suffixes served by this backend.
    pub suffixes: Vec<String>,
    /// Maximum entries held in the import fifo (0 derives it from `cache_size`).
    pub cache_entries: u64,
    /// Byte budget of the import fifo.
    pub cache_size: MemorySize,
    pub allids_threshold: usize,
    pub idl_mode: IdlMode,
    /// Maintain the DN-tree (`entryrdn`) index; off selects the legacy `entrydn` index.
    pub entryrdn: bool,
    pub indexes: Vec<IndexConfig>,
    pub vlv: Vec<VlvConfig>,
    pub schema: SchemaConfig,
    pub encrypted_attributes: Vec<String>,
    pub lastmod: bool,
    pub entryusn: bool,
    pub password_scheme: PasswordScheme,
    /// Directory for side files such as the DN space-normalization list.
    pub ldif_dir: Option<PathBuf>,
    pub memory: MemorySanity,
    /// Polling interval of blocked pipeline threads, in milliseconds.
    pub poll_interval_ms: u64,
    /// Seconds between status blocks.
    pub display_interval_secs: u64,
    /// Entries kept in the DN cache of the reindex producer.
    pub dn_cache_entries: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        use IndexKind::*;
        Self {
            instance: "userRoot".to_string(),
            suffixes: vec!["dc=example,dc=com".to_string()],
            cache_entries: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            allids_threshold: DEFAULT_ALLIDS_THRESHOLD,
            idl_mode: IdlMode::New,
            entryrdn: true,
            indexes: vec![
                IndexConfig::new("objectclass", &[Eq]),
                IndexConfig::new("nsuniqueid", &[Eq]),
                IndexConfig::new("nscpentrydn", &[Eq]),
                IndexConfig::new("nstombstonecsn", &[Eq]),
                IndexConfig::new("entryusn", &[Eq]),
                IndexConfig::new("cn", &[Eq, Sub, Pres]),
                IndexConfig::new("uid", &[Eq]),
                IndexConfig::new("member", &[Eq]),
            ],
            vlv: Vec::new(),
            schema: SchemaConfig::default(),
            encrypted_attributes: Vec::new(),
            lastmod: false,
            entryusn: false,
            password_scheme: PasswordScheme::Clear,
            ldif_dir: None,
            memory: MemorySanity::default(),
            poll_interval_ms: 100,
            display_interval_secs: 20,
            dn_cache_entries: 10_000,
        }
    }
}

impl BackendConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance.is_empty() || self.instance.contains(['/', '\\']) {
            return Err(ImportError::Config(format!(
                "invalid instance name '{}'",
                self.instance
            )));
        }
        if self.suffixes.is_empty() {
            return Err(ImportError::Config("no suffix configured".to_string()));
        }
        for vlv in &self.vlv {
            if vlv.sort.is_empty() {
                return Err(ImportError::Config(format!(
                    "vlv index '{}' has no sort attribute",
                    vlv.name
                )));
            }
        }
        Ok(())
    }

    /// Directory holding this instance's database files.
    pub fn instance_dir(&self, db_dir: &Path) -> PathBuf {
        db_dir.join(&self.instance)
    }

    /// Index configuration for an attribute, if it is indexed.
    pub fn index_for(&self, attribute: &str) -> Option<&IndexConfig> {
        self.indexes
            .iter()
            .find(|i| i.attribute.eq_ignore_ascii_case(attribute))
    }

    /// Whether an attribute is configured for at-rest encryption.
    pub fn is_encrypted(&self, attribute: &str) -> bool {
        self.encrypted_attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case(attribute))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
