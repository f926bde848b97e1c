//! Unique identifier generation for imported entries.
//!
//! Identifiers are 128-bit UUIDs rendered as four dash-separated groups of
//! eight hex digits (`xxxxxxxx-xxxxxxxx-xxxxxxxx-xxxxxxxx`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ImportError, Result};

/// How entries without an `nsuniqueid` get one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UniqueIdPolicy {
    /// Leave entries without an identifier untouched.
    None,
    /// Time-ordered identifiers.
    #[default]
    Time,
    /// Deterministic identifiers derived from a namespace and the normalized DN.
    Name,
}

/// Generator bound to a policy and, for name-based ids, a namespace.
#[derive(Debug, Clone)]
pub struct UniqueIdGenerator {
    policy: UniqueIdPolicy,
    namespace: Uuid,
}

impl UniqueIdGenerator {
    pub fn new(policy: UniqueIdPolicy, namespace: Option<&str>) -> Result<Self> {
        let namespace = match namespace {
            Some(ns) => parse(ns).ok_or_else(|| {
                ImportError::Config(format!("invalid unique id namespace '{}'", ns))
            })?,
            None => Uuid::NAMESPACE_X500,
        };
        Ok(Self { policy, namespace })
    }

    pub fn policy(&self) -> UniqueIdPolicy {
        self.policy
    }

    /// Produce an identifier for the entry with normalized DN `ndn`.
    ///
    /// Returns `Ok(None)` when the policy does not generate identifiers.
    pub fn generate(&self, ndn: &str) -> Result<Option<String>> {
        let uuid = match self.policy {
            UniqueIdPolicy::None => return Ok(None),
            UniqueIdPolicy::Time => Uuid::now_v7(),
            UniqueIdPolicy::Name => {
                if ndn.is_empty() {
                    return Err(ImportError::UniqueIdGeneration(ndn.to_string()));
                }
                Uuid::new_v5(&self.namespace, ndn.as_bytes())
            }
        };
        Ok(Some(format_uuid(&uuid)))
    }
}

/// Render a UUID in directory form.
pub fn format_uuid(uuid: &Uuid) -> String {
    let hex = uuid.simple().to_string();
    format!("{}-{}-{}-{}", &hex[0..8], &hex[8..16], &hex[16..24], &hex[24..32])
}

/// Parse either a standard UUID or the directory form.
pub fn parse(text: &str) -> Option<Uuid> {
    let compact: String = text.chars().filter(|c| *c != '-').collect();
    if compact.len() != 32 {
        return None;
    }
    Uuid::try_parse(&compact).ok()
}
