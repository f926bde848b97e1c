//! Distinguished name helpers.
//!
//! DNs are handled as strings. Splitting honours backslash escapes and
//! double-quoted values; normalization lowercases attribute types and
//! values, trims whitespace around separators and collapses inner runs of
//! whitespace to a single space.

/// Split a DN into its RDN components, outermost (leftmost) first.
///
/// Separators inside quotes or after a backslash do not split. Whitespace
/// around each component is trimmed; empty components are dropped.
pub fn explode(dn: &str) -> Vec<String> {
    split_unescaped(dn, |c| c == ',' || c == ';')
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split an RDN into its attribute-value assertions (multi-valued RDNs use `+`).
pub fn explode_rdn(rdn: &str) -> Vec<String> {
    split_unescaped(rdn, |c| c == '+')
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_unescaped(input: &str, is_sep: impl Fn(char) -> bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            c if is_sep(c) && !quoted => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Split one attribute-value assertion into `(type, value)`.
pub fn split_ava(ava: &str) -> Option<(&str, &str)> {
    let (attr, value) = ava.split_once('=')?;
    let attr = attr.trim();
    if attr.is_empty() {
        return None;
    }
    Some((attr, value.trim()))
}

/// Normalize an attribute value for comparison and index keys.
pub fn normalize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_space = false;
    for c in value.trim().chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// Normalize a single RDN. AVAs of a multi-valued RDN are sorted.
pub fn normalize_rdn(rdn: &str) -> String {
    let mut avas: Vec<String> = explode_rdn(rdn)
        .iter()
        .map(|ava| match split_ava(ava) {
            Some((attr, value)) => {
                format!("{}={}", attr.to_lowercase(), normalize_value(value))
            }
            None => normalize_value(ava),
        })
        .collect();
    avas.sort();
    avas.join("+")
}

/// Normalize a full DN.
pub fn normalize(dn: &str) -> String {
    explode(dn)
        .iter()
        .map(|rdn| normalize_rdn(rdn))
        .collect::<Vec<_>>()
        .join(",")
}

/// Leftmost RDN of a DN, as written.
pub fn rdn(dn: &str) -> Option<String> {
    explode(dn).into_iter().next()
}

/// Parent DN, as written. `None` for a single-RDN DN.
pub fn parent(dn: &str) -> Option<String> {
    let rdns = explode(dn);
    if rdns.len() < 2 {
        return None;
    }
    Some(rdns[1..].join(","))
}

/// Whether `dn` equals `base` or lies below it (both compared normalized).
pub fn is_within(dn: &str, base: &str) -> bool {
    let ndn = normalize(dn);
    let nbase = normalize(base);
    ndn == nbase || ndn.ends_with(&format!(",{}", nbase)) || nbase.is_empty()
}

/// Number of RDNs between `dn` and `base`, or `None` when `dn` is outside `base`.
pub fn depth_below(dn: &str, base: &str) -> Option<usize> {
    if !is_within(dn, base) {
        return None;
    }
    Some(explode(dn).len().saturating_sub(explode(base).len()))
}

/// Whether an RDN value uses a pre-RFC 4514 form (backslash escapes or a quoted value).
pub fn value_needs_rfc4514_upgrade(value: &str) -> bool {
    value.contains('\\') || (value.len() >= 2 && value.starts_with('"') && value.ends_with('"'))
}

/// Longest run of consecutive whitespace inside the values of an RDN.
pub fn max_space_run(rdn: &str) -> usize {
    explode_rdn(rdn)
        .iter()
        .filter_map(|ava| split_ava(ava).map(|(_, value)| value))
        .map(|value| {
            let mut longest = 0;
            let mut run = 0;
            for c in value.chars() {
                if c.is_whitespace() {
                    run += 1;
                    longest = longest.max(run);
                } else {
                    run = 0;
                }
            }
            longest
        })
        .max()
        .unwrap_or(0)
}

/// Escape a value for use inside an RDN.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let leading = i == 0 && (c == ' ' || c == '#');
        if leading || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    if out.ends_with(' ') {
        out.pop();
        out.push_str("\\ ");
    }
    out
}

/// Rewrite a legacy RDN value (quoted or backslash-escaped) into RFC 4514 form.
///
/// `\XX` escapes are raw bytes, so a run like `\C3\A9` decodes as one UTF-8
/// character. Byte runs that are not valid UTF-8 become U+FFFD.
pub fn upgrade_value(value: &str) -> String {
    let unquoted = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    };
    let mut raw: Vec<u8> = Vec::with_capacity(unquoted.len());
    let mut chars = unquoted.chars().peekable();
    let mut utf8 = [0u8; 4];
    while let Some(c) = chars.next() {
        if c != '\\' {
            raw.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        let Some(next) = chars.next() else {
            break;
        };
        let pair = chars
            .peek()
            .and_then(|low| Some((next.to_digit(16)?, low.to_digit(16)?)));
        match pair {
            Some((hi, lo)) => {
                raw.push((hi * 16 + lo) as u8);
                chars.next();
            }
            None => raw.extend_from_slice(next.encode_utf8(&mut utf8).as_bytes()),
        }
    }
    let raw = match String::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };
    escape_value(&raw)
}

/// Rewrite every AVA of a legacy RDN into RFC 4514 form.
pub fn upgrade_rdn(rdn: &str) -> String {
    explode_rdn(rdn)
        .iter()
        .map(|ava| match split_ava(ava) {
            Some((attr, value)) => format!("{}={}", attr, upgrade_value(value)),
            None => ava.clone(),
        })
        .collect::<Vec<_>>()
        .join("+")
}
