//! VLV indexes: a base, scope and filter selecting entries, and sort
//! attributes producing an ordered key per entry.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::info;

use super::descriptor::{IndexDescriptor, IndexType};
use crate::config::{Scope, VlvConfig};
use crate::entry::{Entry, dn};
use crate::error::{ImportError, Result};
use crate::store::VLV_PREFIX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unexpected end of filter")]
    UnexpectedEnd,
    #[error("unexpected character '{0}' at offset {1}")]
    Unexpected(char, usize),
    #[error("missing attribute name at offset {0}")]
    MissingAttribute(usize),
    #[error("invalid escape at offset {0}")]
    BadEscape(usize),
}

/// A parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
}

impl std::str::FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let text = s.trim();
        let owned;
        let text = if text.starts_with('(') {
            text
        } else {
            owned = format!("({})", text);
            &owned
        };
        let chars: Vec<char> = text.chars().collect();
        let mut parser = Parser { chars, pos: 0 };
        let filter = parser.filter()?;
        match parser.peek() {
            None => Ok(filter),
            Some(c) => Err(FilterError::Unexpected(c, parser.pos)),
        }
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expect(&mut self, c: char) -> std::result::Result<(), FilterError> {
        match self.peek() {
            Some(got) if got == c => {
                self.pos += 1;
                Ok(())
            }
            Some(got) => Err(FilterError::Unexpected(got, self.pos)),
            None => Err(FilterError::UnexpectedEnd),
        }
    }

    fn filter(&mut self) -> std::result::Result<Filter, FilterError> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(FilterError::UnexpectedEnd),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> std::result::Result<Vec<Filter>, FilterError> {
        let mut filters = Vec::new();
        while self.peek() == Some('(') {
            filters.push(self.filter()?);
        }
        Ok(filters)
    }

    fn item(&mut self) -> std::result::Result<Filter, FilterError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '>' | '<' | '~' | ')' | '(') {
                break;
            }
            self.pos += 1;
        }
        let attr: String = self.chars[start..self.pos].iter().collect::<String>().trim().to_lowercase();
        if attr.is_empty() {
            return Err(FilterError::MissingAttribute(start));
        }
        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                '='
            }
            Some(c @ ('>' | '<' | '~')) => {
                self.pos += 1;
                self.expect('=')?;
                c
            }
            Some(c) => return Err(FilterError::Unexpected(c, self.pos)),
            None => return Err(FilterError::UnexpectedEnd),
        };
        let pieces = self.value_pieces()?;
        Ok(match op {
            '>' => Filter::GreaterOrEqual(attr, pieces.join("*")),
            '<' => Filter::LessOrEqual(attr, pieces.join("*")),
            _ if pieces.len() == 2 && pieces.iter().all(String::is_empty) => Filter::Present(attr),
            _ if pieces.len() == 1 => Filter::Equal(attr, pieces.into_iter().next().unwrap_or_default()),
            _ => {
                let last_index = pieces.len() - 1;
                let mut initial = None;
                let mut last = None;
                let mut any = Vec::new();
                for (i, piece) in pieces.into_iter().enumerate() {
                    if piece.is_empty() {
                        continue;
                    }
                    if i == 0 {
                        initial = Some(piece);
                    } else if i == last_index {
                        last = Some(piece);
                    } else {
                        any.push(piece);
                    }
                }
                Filter::Substring {
                    attr,
                    initial,
                    any,
                    last,
                }
            }
        })
    }

    /// Value text split on unescaped `*`.
    fn value_pieces(&mut self) -> std::result::Result<Vec<String>, FilterError> {
        let mut pieces = vec![String::new()];
        loop {
            match self.peek() {
                None => return Err(FilterError::UnexpectedEnd),
                Some(')') => break,
                Some('*') => {
                    self.pos += 1;
                    pieces.push(String::new());
                }
                Some('\\') => {
                    let at = self.pos;
                    let hex: String = self.chars.get(at + 1..at + 3).unwrap_or(&[]).iter().collect();
                    let byte = u8::from_str_radix(&hex, 16).map_err(|_| FilterError::BadEscape(at))?;
                    if let Some(last) = pieces.last_mut() {
                        last.push(byte as char);
                    }
                    self.pos += 3;
                }
                Some(c) => {
                    if let Some(last) = pieces.last_mut() {
                        last.push(c);
                    }
                    self.pos += 1;
                }
            }
        }
        Ok(pieces)
    }
}

fn values_of<'a>(entry: &'a Entry, attr: &'a str) -> impl Iterator<Item = String> + 'a {
    entry
        .find_all(attr)
        .flat_map(|a| a.values.iter())
        .map(|v| dn::normalize_value(v))
}

fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

impl Filter {
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Filter::Not(filter) => !filter.matches(entry),
            Filter::Present(attr) => {
                if attr == "objectclass" {
                    return true;
                }
                values_of(entry, attr).next().is_some()
            }
            Filter::Equal(attr, value) => {
                let value = dn::normalize_value(value);
                values_of(entry, attr).any(|v| v == value)
            }
            Filter::GreaterOrEqual(attr, value) => {
                let value = dn::normalize_value(value);
                values_of(entry, attr).any(|v| compare(&v, &value) != std::cmp::Ordering::Less)
            }
            Filter::LessOrEqual(attr, value) => {
                let value = dn::normalize_value(value);
                values_of(entry, attr).any(|v| compare(&v, &value) != std::cmp::Ordering::Greater)
            }
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => values_of(entry, attr).any(|v| substring_match(&v, initial, any, last)),
        }
    }
}

fn substring_match(value: &str, initial: &Option<String>, any: &[String], last: &Option<String>) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        let initial = dn::normalize_value(initial);
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for piece in any {
        let piece = dn::normalize_value(piece);
        match rest.find(piece.as_str()) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(dn::normalize_value(last).as_str()),
        None => true,
    }
}

/// One sort attribute; `-attr` in the configuration sorts descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attr: String,
    pub reverse: bool,
}

impl SortKey {
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        match spec.strip_prefix('-') {
            Some(attr) => SortKey {
                attr: attr.to_lowercase(),
                reverse: true,
            },
            None => SortKey {
                attr: spec.trim_start_matches('+').to_lowercase(),
                reverse: false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct VlvIndex {
    pub name: String,
    /// Normalized base DN.
    pub base: String,
    pub scope: Scope,
    pub filter: Filter,
    pub sort: Vec<SortKey>,
}

impl VlvIndex {
    pub fn from_config(config: &VlvConfig) -> Result<Self> {
        let filter: Filter = config.filter.parse().map_err(|e: FilterError| {
            ImportError::Config(format!("vlv index '{}': bad filter: {}", config.name, e))
        })?;
        Ok(Self {
            name: config.name.clone(),
            base: dn::normalize(&config.base),
            scope: config.scope,
            filter,
            sort: config.sort.iter().map(|s| SortKey::parse(s)).collect(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", VLV_PREFIX, self.name)
    }

    pub fn in_scope(&self, entry: &Entry) -> bool {
        let ndn = entry.ndn();
        match self.scope {
            Scope::Base => ndn == self.base,
            Scope::One => dn::parent(&ndn).is_some_and(|p| p == self.base),
            Scope::Sub => dn::is_within(&ndn, &self.base),
        }
    }

    /// Whether this index holds the entry.
    pub fn selects(&self, entry: &Entry) -> bool {
        !entry.is_tombstone() && self.in_scope(entry) && self.filter.matches(entry)
    }

    /// Ordered key: per sort attribute its smallest normalized value, joined by NUL.
    /// Descending attributes are stored bit-inverted as hex with an `ff` terminator.
    pub fn sort_key(&self, entry: &Entry) -> String {
        self.sort
            .iter()
            .map(|key| {
                let value = values_of(entry, &key.attr).min().unwrap_or_default();
                if key.reverse {
                    let mut inverted: String =
                        value.bytes().map(|b| format!("{:02x}", 255 - b)).collect();
                    inverted.push_str("ff");
                    inverted
                } else {
                    value
                }
            })
            .collect::<Vec<_>>()
            .join("\0")
    }
}

/// Tracks which VLV base entries the foreman has seen.
#[derive(Debug)]
pub struct VlvDiscovery {
    pending: Mutex<Vec<(String, String)>>,
    done: AtomicBool,
}

impl VlvDiscovery {
    pub fn new(indexes: &[IndexDescriptor]) -> Self {
        let pending: Vec<(String, String)> = indexes
            .iter()
            .filter_map(|d| match &d.index_type {
                IndexType::Vlv(vlv) => Some((vlv.name.clone(), vlv.base.clone())),
                IndexType::Attribute { .. } => None,
            })
            .collect();
        let done = AtomicBool::new(pending.is_empty());
        Self {
            pending: Mutex::new(pending),
            done,
        }
    }

    /// Every VLV base has been seen.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Look at a committed entry; it may be the base of some VLV index.
    pub fn grok(&self, entry: &Entry) {
        let ndn = entry.ndn();
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.retain(|(name, base)| {
            if *base == ndn {
                info!(vlv = %name, id = entry.id(), "found the base entry of VLV index {}", name);
                false
            } else {
                true
            }
        });
        if pending.is_empty() {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    /// VLV indexes whose base entry never came through.
    pub fn missing_bases(&self) -> Vec<String> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}
