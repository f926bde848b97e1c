//! LDIF reading and entry serialization.
//!
//! [`LdifReader`] splits a byte stream into records while tracking source
//! line numbers. [`parse_entry`] turns one record into an [`Entry`];
//! [`to_ldif`] writes it back. Stored entries in `id2entry` use the same
//! format with an `rdn:` header instead of `dn:` when the DN-tree index
//! is active.

use std::io::BufRead;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use super::{ATTR_OBJECTCLASS, Entry, dn};

/// Records longer than this many lines get the big-entry hint.
pub const BIG_ENTRY_LINES: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty record")]
    Empty,
    #[error("record does not start with \"dn: \"")]
    MissingDn,
    #[error("malformed line {line}: '{text}'")]
    BadLine { line: usize, text: String },
    #[error("invalid base64 value for '{0}'")]
    Base64(String),
    #[error("URL values are not supported ('{0}')")]
    UrlValue(String),
    #[error("invalid DN '{0}'")]
    InvalidDn(String),
}

/// One raw LDIF record with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdifRecord {
    pub text: String,
    /// 1-based line number of the record's first line.
    pub line: usize,
    pub line_count: usize,
}

impl LdifRecord {
    pub fn is_big(&self) -> bool {
        self.line_count > BIG_ENTRY_LINES
    }
}

/// Iterator over the records of an LDIF stream.
///
/// Comment lines are dropped, together with their continuation lines. A
/// leading `version:` record is consumed and reported through [`LdifReader::version`].
pub struct LdifReader<R> {
    input: R,
    line_no: usize,
    version: Option<String>,
    first: bool,
    done: bool,
}

impl<R: BufRead> LdifReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line_no: 0,
            version: None,
            first: true,
            done: false,
        }
    }

    /// LDIF version announced at the top of the stream, if any.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Current line number (lines consumed so far).
    pub fn line(&self) -> usize {
        self.line_no
    }

    fn read_record(&mut self) -> std::io::Result<Option<LdifRecord>> {
        let mut text = String::new();
        let mut start = 0;
        let mut count = 0;
        let mut in_comment = false;
        let mut buf = String::new();

        loop {
            buf.clear();
            if self.input.read_line(&mut buf)? == 0 {
                self.done = true;
                break;
            }
            self.line_no += 1;
            let line = buf.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if count > 0 {
                    break;
                }
                in_comment = false;
                continue;
            }
            if line.starts_with('#') {
                in_comment = true;
                continue;
            }
            if line.starts_with(' ') && in_comment {
                continue;
            }
            in_comment = false;
            if count == 0 {
                start = self.line_no;
            }
            text.push_str(line);
            text.push('\n');
            count += 1;
        }

        if count == 0 {
            return Ok(None);
        }
        Ok(Some(LdifRecord {
            text,
            line: start,
            line_count: count,
        }))
    }
}

impl<R: BufRead> Iterator for LdifReader<R> {
    type Item = std::io::Result<LdifRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let record = match self.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            if self.first {
                self.first = false;
                if let Some(rest) = strip_type(&record.text, "version") {
                    let (version, remainder) = match rest.split_once('\n') {
                        Some((v, r)) => (v.trim().to_string(), r),
                        None => (rest.trim().to_string(), ""),
                    };
                    self.version = Some(version);
                    // "version: 1" may share a record with the first entry
                    if remainder.trim().is_empty() {
                        continue;
                    }
                    return Some(Ok(LdifRecord {
                        text: remainder.to_string(),
                        line: record.line + 1,
                        line_count: record.line_count - 1,
                    }));
                }
            }
            return Some(Ok(record));
        }
    }
}

fn strip_type<'a>(text: &'a str, attr: &str) -> Option<&'a str> {
    let colon = text.find(':')?;
    let name = &text[..colon];
    if name.eq_ignore_ascii_case(attr) {
        Some(&text[colon + 1..])
    } else {
        None
    }
}

/// Knobs for turning a record into an entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Accept an `rdn:` header in place of `dn:` (stored form).
    pub allow_rdn_header: bool,
    pub remove_duplicate_values: bool,
    /// Make sure `top` is listed among the object classes.
    pub expand_objectclasses: bool,
    /// Add the RDN's attribute values to the entry when missing.
    pub add_rdn_values: bool,
    /// Reserve room for a large attribute list.
    pub big_entry: bool,
}

/// Which header a parsed record carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Dn,
    Rdn,
}

/// Whether a record starts with a `dn:` line.
pub fn starts_with_dn(text: &str) -> bool {
    let head = text.trim_start();
    head.len() >= 3 && head[..3].eq_ignore_ascii_case("dn:")
}

/// Unfold continuation lines into logical lines.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if let Some(cont) = line.strip_prefix(' ')
            && let Some(last) = lines.last_mut()
        {
            last.1.push_str(cont);
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        lines.push((i + 1, line.to_string()));
    }
    lines
}

fn decode_line(line_no: usize, line: &str) -> Result<(String, String), ParseError> {
    let Some(colon) = line.find(':') else {
        return Err(ParseError::BadLine {
            line: line_no,
            text: line.to_string(),
        });
    };
    let name = line[..colon].trim().to_string();
    if name.is_empty() {
        return Err(ParseError::BadLine {
            line: line_no,
            text: line.to_string(),
        });
    }
    let rest = &line[colon + 1..];
    if let Some(encoded) = rest.strip_prefix(':') {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| ParseError::Base64(name.clone()))?;
        let value = String::from_utf8(bytes).map_err(|_| ParseError::Base64(name.clone()))?;
        return Ok((name, value));
    }
    if rest.starts_with('<') {
        return Err(ParseError::UrlValue(name));
    }
    Ok((name, rest.trim_start().to_string()))
}

/// Parse one record into an entry.
pub fn parse_entry(text: &str, opts: ParseOptions) -> Result<(Header, Entry), ParseError> {
    let lines = logical_lines(text);
    let mut iter = lines.into_iter();
    let Some((line_no, first)) = iter.next() else {
        return Err(ParseError::Empty);
    };
    let (header_name, header_value) = decode_line(line_no, &first)?;
    let header = if header_name.eq_ignore_ascii_case("dn") {
        Header::Dn
    } else if opts.allow_rdn_header && header_name.eq_ignore_ascii_case("rdn") {
        Header::Rdn
    } else {
        return Err(ParseError::MissingDn);
    };
    if header == Header::Dn && !header_value.is_empty() && dn::explode(&header_value).is_empty() {
        return Err(ParseError::InvalidDn(header_value));
    }

    let mut entry = Entry::new(header_value.trim());
    if opts.big_entry {
        entry.attrs_reserve(BIG_ENTRY_LINES);
    }
    for (line_no, line) in iter {
        let (name, value) = decode_line(line_no, &line)?;
        if name.eq_ignore_ascii_case("changetype") {
            continue;
        }
        entry.add_value(&name, value);
    }

    if opts.remove_duplicate_values {
        entry.remove_duplicate_values();
    }
    if opts.expand_objectclasses
        && entry.has(ATTR_OBJECTCLASS)
        && !entry.has_value(ATTR_OBJECTCLASS, "top")
    {
        entry.add_value(ATTR_OBJECTCLASS, "top");
    }
    if opts.add_rdn_values && header == Header::Dn {
        add_rdn_values(&mut entry);
    }
    entry.detect_tombstone();
    Ok((header, entry))
}

/// Add the values named by the leftmost RDN as attributes when missing.
pub fn add_rdn_values(entry: &mut Entry) {
    let Some(rdn) = dn::rdn(entry.dn()) else {
        return;
    };
    for ava in dn::explode_rdn(&rdn) {
        let Some((attr, value)) = dn::split_ava(&ava) else {
            continue;
        };
        let raw = dn::upgrade_value(value).replace('\\', "");
        let present = entry
            .find_all(attr)
            .flat_map(|a| a.values.iter())
            .any(|v| dn::normalize_value(v) == dn::normalize_value(&raw));
        if !present {
            entry.add_value(attr, raw);
        }
    }
}

fn needs_base64(value: &str) -> bool {
    value.starts_with([' ', ':', '<'])
        || value.ends_with(' ')
        || value
            .chars()
            .any(|c| !c.is_ascii() || c.is_ascii_control())
}

fn push_line(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    if needs_base64(value) {
        out.push_str(":: ");
        out.push_str(&STANDARD.encode(value.as_bytes()));
    } else {
        out.push_str(": ");
        out.push_str(value);
    }
    out.push('\n');
}

/// Serialize an entry. With `rdn` set, the header carries that RDN instead of the DN.
pub fn to_ldif(entry: &Entry, rdn: Option<&str>) -> String {
    let mut out = String::with_capacity(entry.size() as usize);
    match rdn {
        Some(rdn) => push_line(&mut out, "rdn", rdn),
        None => push_line(&mut out, "dn", entry.dn()),
    }
    for attr in entry.attrs() {
        for value in &attr.values {
            push_line(&mut out, &attr.name, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "version: 1\n\n\
# a comment\n\
#  continued\n\
dn: dc=example,dc=com\n\
objectClass: top\n\
objectClass: domain\n\
dc: example\n\
\n\
dn: ou=People,dc=example,dc=com\n\
objectClass: organizationalUnit\n\
description: a long\n  folded line\n\
ou: People\n\n\n";

    #[test]
    fn test_reader_splits_records_and_tracks_lines() {
        let mut reader = LdifReader::new(Cursor::new(SAMPLE));
        let records: Vec<_> = reader.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(reader.version(), Some("1"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line, 5);
        assert_eq!(records[1].line, 10);
        assert!(!records[1].is_big());
    }

    #[test]
    fn test_parse_unfolds_and_decodes() {
        let mut reader = LdifReader::new(Cursor::new(SAMPLE));
        let second = reader.nth(1).unwrap().unwrap();
        let (header, entry) = parse_entry(&second.text, ParseOptions::default()).unwrap();
        assert_eq!(header, Header::Dn);
        assert_eq!(entry.dn(), "ou=People,dc=example,dc=com");
        assert_eq!(entry.first_value("description"), Some("a long folded line"));
    }

    #[test]
    fn test_base64_values() {
        let text = "dn:: Y249w6lsw6huZSxkYz14\ncn:: w6lsw6huZQ==\n";
        let (_, entry) = parse_entry(text, ParseOptions::default()).unwrap();
        assert_eq!(entry.dn(), "cn=élène,dc=x");
        assert_eq!(entry.first_value("cn"), Some("élène"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_entry("cn: x\n", ParseOptions::default()).unwrap_err(),
            ParseError::MissingDn
        );
        assert!(matches!(
            parse_entry("dn: dc=x\ngarbage\n", ParseOptions::default()),
            Err(ParseError::BadLine { line: 2, .. })
        ));
        assert!(matches!(
            parse_entry("dn: dc=x\njpegPhoto:< file:///tmp/x\n", ParseOptions::default()),
            Err(ParseError::UrlValue(_))
        ));
        assert_eq!(
            parse_entry("", ParseOptions::default()).unwrap_err(),
            ParseError::Empty
        );
    }

    #[test]
    fn test_rdn_header_only_when_allowed() {
        let text = "rdn: cn=x\ncn: x\n";
        assert!(parse_entry(text, ParseOptions::default()).is_err());
        let opts = ParseOptions {
            allow_rdn_header: true,
            ..Default::default()
        };
        let (header, entry) = parse_entry(text, opts).unwrap();
        assert_eq!(header, Header::Rdn);
        assert_eq!(entry.dn(), "cn=x");
    }

    #[test]
    fn test_options_add_rdn_values_and_top() {
        let opts = ParseOptions {
            expand_objectclasses: true,
            add_rdn_values: true,
            ..Default::default()
        };
        let (_, entry) = parse_entry("dn: uid=bob,dc=x\nobjectclass: person\n", opts).unwrap();
        assert!(entry.has_value("objectclass", "top"));
        assert_eq!(entry.first_value("uid"), Some("bob"));
    }

    #[test]
    fn test_serialize_then_parse_preserves_entry() {
        let mut entry = Entry::new("cn=Test User,dc=example,dc=com");
        entry.add_value("objectClass", "person");
        entry.add_value("cn", "Test User");
        entry.add_value("description", " leading space");
        entry.add_value("sn", "Üser");
        let text = to_ldif(&entry, None);
        let (_, parsed) = parse_entry(&text, ParseOptions::default()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_tombstone_flag_is_detected() {
        let text = "dn: nsuniqueid=a,uid=b,dc=x\nobjectclass: nsTombstone\n";
        let (_, entry) = parse_entry(text, ParseOptions::default()).unwrap();
        assert!(entry.is_tombstone());
    }

    #[test]
    fn test_starts_with_dn() {
        assert!(starts_with_dn("dn: x\n"));
        assert!(starts_with_dn("DN:: eA==\n"));
        assert!(!starts_with_dn("cn: x\n"));
    }
}
