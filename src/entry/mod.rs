//! In-memory directory entries and the line-oriented entry codec.

pub mod dn;
pub mod ldif;
pub mod uniqueid;

/// Object class value marking a tombstone.
pub const TOMBSTONE_OBJECTCLASS: &str = "nsTombstone";
/// Unique identifier attribute.
pub const ATTR_UNIQUEID: &str = "nsuniqueid";
/// Original DN of a tombstone.
pub const ATTR_NSCP_ENTRYDN: &str = "nscpentrydn";
/// Deletion CSN of a tombstone.
pub const ATTR_TOMBSTONE_CSN: &str = "nstombstonecsn";
pub const ATTR_OBJECTCLASS: &str = "objectclass";
pub const ATTR_PARENTID: &str = "parentid";
pub const ATTR_ENTRYID: &str = "entryid";
pub const ATTR_ENTRYDN: &str = "entrydn";
pub const ATTR_ENTRYRDN: &str = "entryrdn";
pub const ATTR_NUMSUBORDINATES: &str = "numsubordinates";
pub const ATTR_TOMBSTONE_NUMSUBORDINATES: &str = "tombstonenumsubordinates";
pub const ATTR_HASSUBORDINATES: &str = "hassubordinates";
pub const ATTR_ANCESTORID: &str = "ancestorid";
/// Unique id of the replication state (RUV) tombstone.
pub const RUV_UNIQUEID: &str = "ffffffff-ffffffff-ffffffff-ffffffff";

/// Lowercased attribute type without options (`objectClass;vucsn-1` -> `objectclass`).
pub fn base_type(name: &str) -> String {
    name.split(';').next().unwrap_or(name).to_lowercase()
}

/// One attribute: a type name (possibly with `;options`) and its ordered values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn base_type(&self) -> String {
        base_type(&self.name)
    }

    /// Exact type match, options included, ignoring case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A parsed directory entry.
///
/// Attributes keep insertion order. `deleted` holds values an upgrade pass
/// moved aside so that index workers can retract their stale keys; it is
/// never serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    id: u64,
    attrs: Vec<Attribute>,
    deleted: Vec<Attribute>,
    tombstone: bool,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ..Self::default()
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: impl Into<String>) {
        self.dn = dn.into();
    }

    /// Normalized DN.
    pub fn ndn(&self) -> String {
        dn::normalize(&self.dn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    pub fn set_tombstone(&mut self, tombstone: bool) {
        self.tombstone = tombstone;
    }

    /// Recompute the tombstone flag from the object classes.
    pub fn detect_tombstone(&mut self) {
        self.tombstone = self
            .attrs
            .iter()
            .filter(|a| a.base_type() == ATTR_OBJECTCLASS)
            .flat_map(|a| a.values.iter())
            .any(|v| v.eq_ignore_ascii_case(TOMBSTONE_OBJECTCLASS));
    }

    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn attrs_reserve(&mut self, additional: usize) {
        self.attrs.reserve(additional);
    }

    pub fn deleted_attrs(&self) -> &[Attribute] {
        &self.deleted
    }

    /// Attribute whose full name (options included) matches.
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.is(name))
    }

    /// Values of the attribute whose full name matches, or an empty slice.
    pub fn values(&self, name: &str) -> &[String] {
        self.get(name).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some_and(|a| !a.values.is_empty())
    }

    /// Every attribute of the given base type, subtypes included.
    pub fn find_all<'a>(&'a self, base: &'a str) -> impl Iterator<Item = &'a Attribute> + 'a {
        let base = base.to_lowercase();
        self.attrs.iter().filter(move |a| a.base_type() == base)
    }

    /// Whether any attribute of the base type carries `value` (case-insensitive).
    pub fn has_value(&self, base: &str, value: &str) -> bool {
        self.find_all(base)
            .flat_map(|a| a.values.iter())
            .any(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.first_value(ATTR_UNIQUEID)
    }

    /// Append one value, creating the attribute when missing.
    pub fn add_value(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|a| a.is(name)) {
            Some(attr) => attr.values.push(value),
            None => self.attrs.push(Attribute::new(name, vec![value])),
        }
    }

    /// Replace all values of an attribute, adding it when missing.
    pub fn replace(&mut self, name: &str, values: Vec<String>) {
        match self.attrs.iter_mut().find(|a| a.is(name)) {
            Some(attr) => attr.values = values,
            None => self.attrs.push(Attribute::new(name, values)),
        }
    }

    /// Remove an attribute by full name.
    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        let pos = self.attrs.iter().position(|a| a.is(name))?;
        Some(self.attrs.remove(pos))
    }

    /// Remove every attribute whose base type matches.
    pub fn remove_all(&mut self, base: &str) {
        let base = base.to_lowercase();
        self.attrs.retain(|a| a.base_type() != base);
    }

    /// Drop duplicate values inside each attribute (case-insensitive).
    pub fn remove_duplicate_values(&mut self) {
        for attr in &mut self.attrs {
            let mut seen = std::collections::HashSet::new();
            attr.values.retain(|v| seen.insert(dn::normalize_value(v)));
        }
    }

    /// Move an attribute's values to the deleted shadow list.
    pub fn push_deleted(&mut self, name: &str, values: Vec<String>) {
        if values.is_empty() {
            return;
        }
        match self.deleted.iter_mut().find(|a| a.is(name)) {
            Some(attr) => attr.values.extend(values),
            None => self.deleted.push(Attribute::new(name, values)),
        }
    }

    /// Take the deleted shadow values for an attribute.
    pub fn take_deleted(&mut self, name: &str) -> Option<Attribute> {
        let pos = self.deleted.iter().position(|a| a.is(name))?;
        Some(self.deleted.remove(pos))
    }

    pub fn deleted_values(&self, name: &str) -> &[String] {
        self.deleted
            .iter()
            .find(|a| a.is(name))
            .map(|a| a.values.as_slice())
            .unwrap_or(&[])
    }

    /// Approximate in-memory footprint in bytes, used for fifo accounting.
    pub fn size(&self) -> u64 {
        const ATTR_OVERHEAD: usize = 48;
        const VALUE_OVERHEAD: usize = 24;
        let attrs: usize = self
            .attrs
            .iter()
            .chain(self.deleted.iter())
            .map(|a| {
                ATTR_OVERHEAD
                    + a.name.len()
                    + a.values.iter().map(|v| v.len() + VALUE_OVERHEAD).sum::<usize>()
            })
            .sum();
        (std::mem::size_of::<Self>() + self.dn.len() * 2 + attrs) as u64
    }

    /// Effective RDN: a tombstone keeps its `nsuniqueid=` RDN together with
    /// the RDN of the entry it replaced.
    pub fn effective_rdn(&self) -> Option<String> {
        let rdns = dn::explode(&self.dn);
        let first = rdns.first()?;
        if self.tombstone
            && rdns.len() > 1
            && first.to_lowercase().starts_with("nsuniqueid=")
            && !first.to_lowercase().ends_with(RUV_UNIQUEID)
        {
            return Some(format!("{},{}", first, rdns[1]));
        }
        Some(first.clone())
    }

    /// Parent DN for linkage, skipping the extra RDN a tombstone carries.
    pub fn effective_parent_dn(&self) -> Option<String> {
        let rdns = dn::explode(&self.dn);
        let skip = match self.effective_rdn() {
            Some(rdn) => dn::explode(&rdn).len(),
            None => return None,
        };
        if rdns.len() <= skip {
            return None;
        }
        Some(rdns[skip..].join(","))
    }
}
