//! Minimal schema and attribute syntax checks applied to imported entries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entry::{ATTR_OBJECTCLASS, Entry, base_type, dn};

/// Attribute syntaxes the importer can validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Syntax {
    Integer,
    Boolean,
    Dn,
    DirectoryString,
    GeneralizedTime,
}

impl Syntax {
    pub fn validate(&self, value: &str) -> bool {
        match self {
            Syntax::Integer => {
                let digits = value.strip_prefix('-').unwrap_or(value);
                !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
            }
            Syntax::Boolean => matches!(value, "TRUE" | "FALSE"),
            Syntax::Dn => {
                value.is_empty()
                    || dn::explode(value)
                        .iter()
                        .all(|rdn| dn::explode_rdn(rdn).iter().all(|ava| dn::split_ava(ava).is_some()))
            }
            Syntax::DirectoryString => !value.is_empty(),
            Syntax::GeneralizedTime => {
                let body = match value.strip_suffix('Z') {
                    Some(body) => body,
                    None => return false,
                };
                let (whole, frac) = match body.split_once(['.', ',']) {
                    Some((whole, frac)) => (whole, Some(frac)),
                    None => (body, None),
                };
                (whole.len() == 10 || whole.len() == 12 || whole.len() == 14)
                    && whole.chars().all(|c| c.is_ascii_digit())
                    && frac.is_none_or(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectClassDef {
    pub must: Vec<String>,
}

/// Schema section of the backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Skip schema checks entirely.
    pub disabled: bool,
    pub object_classes: HashMap<String, ObjectClassDef>,
    pub syntaxes: HashMap<String, Syntax>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        let oc = |must: &[&str]| ObjectClassDef {
            must: must.iter().map(|s| s.to_string()).collect(),
        };
        let object_classes = HashMap::from([
            ("top".to_string(), oc(&["objectclass"])),
            ("person".to_string(), oc(&["cn", "sn"])),
            ("organizationalperson".to_string(), oc(&["cn", "sn"])),
            ("inetorgperson".to_string(), oc(&["cn", "sn"])),
            ("organizationalunit".to_string(), oc(&["ou"])),
            ("organization".to_string(), oc(&["o"])),
            ("domain".to_string(), oc(&["dc"])),
            ("groupofnames".to_string(), oc(&["cn"])),
            ("groupofuniquenames".to_string(), oc(&["cn"])),
        ]);
        let syntaxes = HashMap::from([
            ("member".to_string(), Syntax::Dn),
            ("uniquemember".to_string(), Syntax::Dn),
            ("manager".to_string(), Syntax::Dn),
            ("owner".to_string(), Syntax::Dn),
            ("seealso".to_string(), Syntax::Dn),
            ("creatorsname".to_string(), Syntax::Dn),
            ("modifiersname".to_string(), Syntax::Dn),
            ("nscpentrydn".to_string(), Syntax::Dn),
            ("uidnumber".to_string(), Syntax::Integer),
            ("gidnumber".to_string(), Syntax::Integer),
            ("entryusn".to_string(), Syntax::Integer),
            ("createtimestamp".to_string(), Syntax::GeneralizedTime),
            ("modifytimestamp".to_string(), Syntax::GeneralizedTime),
        ]);
        Self {
            disabled: false,
            object_classes,
            syntaxes,
        }
    }
}

/// Lookup-ready schema with lowercased names.
#[derive(Debug, Clone)]
pub struct Schema {
    disabled: bool,
    must: HashMap<String, Vec<String>>,
    syntaxes: HashMap<String, Syntax>,
}

/// Why an entry failed a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    NoObjectClass,
    MissingAttribute { objectclass: String, attribute: String },
    InvalidSyntax { attribute: String, value: String },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoObjectClass => write!(f, "entry has no objectclass"),
            Self::MissingAttribute {
                objectclass,
                attribute,
            } => write!(
                f,
                "missing required attribute \"{}\" of objectclass \"{}\"",
                attribute, objectclass
            ),
            Self::InvalidSyntax { attribute, value } => {
                write!(f, "value \"{}\" invalid for attribute \"{}\"", value, attribute)
            }
        }
    }
}

impl Schema {
    pub fn new(config: &SchemaConfig) -> Self {
        Self {
            disabled: config.disabled,
            must: config
                .object_classes
                .iter()
                .map(|(name, def)| {
                    (
                        name.to_lowercase(),
                        def.must.iter().map(|a| a.to_lowercase()).collect(),
                    )
                })
                .collect(),
            syntaxes: config
                .syntaxes
                .iter()
                .map(|(name, syntax)| (name.to_lowercase(), *syntax))
                .collect(),
        }
    }

    pub fn syntax_of(&self, attr: &str) -> Option<Syntax> {
        self.syntaxes.get(&base_type(attr)).copied()
    }

    pub fn is_dn_syntax(&self, attr: &str) -> bool {
        self.syntax_of(attr) == Some(Syntax::Dn)
    }

    /// Object class check: every known class's required attributes are present.
    pub fn check_entry(&self, entry: &Entry) -> Result<(), Violation> {
        if self.disabled || entry.is_tombstone() {
            return Ok(());
        }
        let classes: Vec<String> = entry
            .find_all(ATTR_OBJECTCLASS)
            .flat_map(|a| a.values.iter())
            .map(|v| v.to_lowercase())
            .collect();
        if classes.is_empty() {
            return Err(Violation::NoObjectClass);
        }
        for class in &classes {
            let Some(must) = self.must.get(class) else {
                continue;
            };
            for attr in must {
                if entry.find_all(attr).all(|a| a.values.is_empty()) {
                    return Err(Violation::MissingAttribute {
                        objectclass: class.clone(),
                        attribute: attr.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Syntax check of every value, skipping the attributes in `skip`.
    pub fn check_syntax(&self, entry: &Entry, skip: &[String]) -> Result<(), Violation> {
        if self.disabled {
            return Ok(());
        }
        for attr in entry.attrs() {
            let base = attr.base_type();
            if skip.iter().any(|s| s.eq_ignore_ascii_case(&base)) {
                continue;
            }
            let Some(syntax) = self.syntaxes.get(&base) else {
                continue;
            };
            if let Some(bad) = attr.values.iter().find(|v| !syntax.validate(v)) {
                return Err(Violation::InvalidSyntax {
                    attribute: attr.name.clone(),
                    value: bad.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(&SchemaConfig::default())
    }

    #[test]
    fn test_syntax_validators() {
        assert!(Syntax::Integer.validate("-12"));
        assert!(!Syntax::Integer.validate("12a"));
        assert!(Syntax::Boolean.validate("TRUE"));
        assert!(!Syntax::Boolean.validate("yes"));
        assert!(Syntax::Dn.validate("cn=a,dc=b"));
        assert!(!Syntax::Dn.validate("not a dn"));
        assert!(Syntax::GeneralizedTime.validate("20240101120000Z"));
        assert!(Syntax::GeneralizedTime.validate("20240101120000.5Z"));
        assert!(!Syntax::GeneralizedTime.validate("2024-01-01"));
    }

    #[test]
    fn test_missing_required_attribute() {
        let mut e = Entry::new("cn=a,dc=x");
        e.add_value("objectclass", "person");
        e.add_value("cn", "a");
        assert_eq!(
            schema().check_entry(&e),
            Err(Violation::MissingAttribute {
                objectclass: "person".to_string(),
                attribute: "sn".to_string()
            })
        );
        e.add_value("sn", "b");
        assert!(schema().check_entry(&e).is_ok());
    }

    #[test]
    fn test_no_objectclass() {
        let e = Entry::new("cn=a,dc=x");
        assert_eq!(schema().check_entry(&e), Err(Violation::NoObjectClass));
    }

    #[test]
    fn test_syntax_skip_list() {
        let mut e = Entry::new("cn=a,dc=x");
        e.add_value("uidNumber", "abc");
        assert!(schema().check_syntax(&e, &[]).is_err());
        assert!(schema().check_syntax(&e, &["uidnumber".to_string()]).is_ok());
    }

    #[test]
    fn test_dn_syntax_lookup() {
        assert!(schema().is_dn_syntax("member"));
        assert!(schema().is_dn_syntax("Member;binary"));
        assert!(!schema().is_dn_syntax("cn"));
    }
}
