//! Byte sizes for the import cache settings and the fifo growth rule.
//!
//! Sizes are written like `"512M"`, `"2 GiB"` or `"64k"`; a bare number is
//! read as MiB. When one entry does not fit in the fifo's byte budget,
//! [`plan_growth`] decides how far the budget may stretch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// A byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * KIB)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * GIB)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Whole MiB, rounded down.
    pub const fn as_mib(&self) -> u64 {
        self.0 / MIB
    }

    /// `fraction` of this size, with the fraction clamped to `0.0..=1.0`.
    pub fn scaled(&self, fraction: f64) -> Self {
        Self((self.0 as f64 * fraction.clamp(0.0, 1.0)) as u64)
    }
}

impl Default for MemorySize {
    fn default() -> Self {
        DEFAULT_CACHE_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("invalid memory size '{0}': expected a number")]
    NoNumber(String),

    #[error("invalid memory size '{0}': unknown unit '{1}'")]
    UnknownUnit(String, String),
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    Some(match unit {
        "" => MIB,
        "b" | "byte" | "bytes" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        _ => return None,
    })
}

impl FromStr for MemorySize {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let split = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| MemoryError::NoNumber(text.to_string()))?;
        let unit = unit.trim().to_ascii_lowercase();
        let multiplier = unit_multiplier(&unit)
            .ok_or_else(|| MemoryError::UnknownUnit(text.to_string(), unit.clone()))?;
        Ok(Self((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    /// The largest binary unit the size is at least one of; exact
    /// multiples print without decimals.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];
        match units.iter().find(|(size, _)| self.0 >= *size) {
            Some((size, name)) if self.0 % size == 0 => write!(f, "{} {}", self.0 / size, name),
            Some((size, name)) => write!(f, "{:.1} {}", self.0 as f64 / *size as f64, name),
            None => write!(f, "{} bytes", self.0),
        }
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    /// Accepts a byte count or a size string.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(Self(bytes)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Default entry cache size for an import.
pub const DEFAULT_CACHE_SIZE: MemorySize = MemorySize::from_mib(512);

/// Share of available system memory an oversize entry may claim.
pub const DEFAULT_SANITY_FRACTION: f64 = 0.75;

/// Outcome of asking whether the fifo byte budget may grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// The full request fits.
    Granted(MemorySize),
    /// The request was cut down to what the system can spare.
    Reduced(MemorySize),
    /// Not even the reduced request can hold the entry.
    Refused,
}

/// Decide how far the fifo byte budget may grow to hold one entry of `entry_size` bytes.
///
/// The request is four times the entry. When that exceeds `available`, the
/// request shrinks to `fraction` of what is available, and is refused if the
/// entry still does not fit.
pub fn plan_growth(entry_size: u64, available: MemorySize, fraction: f64) -> Growth {
    let request = entry_size.saturating_mul(4);
    if request <= available.as_bytes() {
        return Growth::Granted(MemorySize(request));
    }
    let reduced = available.scaled(fraction);
    if entry_size <= reduced.as_bytes() {
        Growth::Reduced(reduced)
    } else {
        Growth::Refused
    }
}
