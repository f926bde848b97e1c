//! Which secondary indexes a job builds, one worker each.

use tracing::{debug, warn};

use super::JobOptions;
use super::vlv::VlvIndex;
use crate::config::{BackendConfig, IndexKind};
use crate::entry::{
    ATTR_ANCESTORID, ATTR_ENTRYDN, ATTR_ENTRYRDN, ATTR_NUMSUBORDINATES, ATTR_PARENTID,
};
use crate::error::Result;
use crate::schema::Schema;

/// Indexes the foreman or the post-pass builders own.
const SYSTEM_INDEXES: [&str; 5] = [
    ATTR_ENTRYDN,
    ATTR_ENTRYRDN,
    ATTR_PARENTID,
    ATTR_ANCESTORID,
    ATTR_NUMSUBORDINATES,
];

/// Naming attributes kept during a DN upgrade even without DN syntax.
const UPGRADE_NAMING_ATTRS: [&str; 2] = ["cn", "ou"];

#[derive(Debug, Clone)]
pub enum IndexType {
    Attribute { kinds: Vec<IndexKind> },
    Vlv(VlvIndex),
}

/// One secondary index of the job.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    /// Attribute type, or the VLV index name.
    pub name: String,
    pub index_type: IndexType,
}

impl IndexDescriptor {
    /// Name of the index file under the instance directory.
    pub fn file_name(&self) -> String {
        match &self.index_type {
            IndexType::Attribute { .. } => self.name.to_lowercase(),
            IndexType::Vlv(vlv) => vlv.file_name(),
        }
    }

    pub fn is_vlv(&self) -> bool {
        matches!(self.index_type, IndexType::Vlv(_))
    }
}

fn wanted(options: &JobOptions, name: &str) -> bool {
    options.index_attrs.is_empty()
        || options
            .index_attrs
            .iter()
            .any(|a| a.eq_ignore_ascii_case(name))
}

/// Build the worker list for a job.
pub fn build(config: &BackendConfig, options: &JobOptions, schema: &Schema) -> Result<Vec<IndexDescriptor>> {
    let flags = options.flags;
    if flags.dry_run || !flags.index_attrs {
        return Ok(Vec::new());
    }

    let mut descriptors = Vec::new();
    for index in &config.indexes {
        let name = index.attribute.to_lowercase();
        if SYSTEM_INDEXES.contains(&name.as_str()) {
            debug!(index = %name, "maintained outside the worker pool");
            continue;
        }
        if index.types.is_empty() {
            warn!(index = %name, "index has no types, ignoring it");
            continue;
        }
        if flags.upgrading_dn()
            && !schema.is_dn_syntax(&name)
            && !UPGRADE_NAMING_ATTRS.contains(&name.as_str())
        {
            continue;
        }
        if flags.reindexing && !wanted(options, &name) {
            continue;
        }
        descriptors.push(IndexDescriptor {
            name,
            index_type: IndexType::Attribute {
                kinds: index.types.clone(),
            },
        });
    }

    if !flags.upgrading_dn() {
        for vlv in &config.vlv {
            if flags.reindexing && !wanted(options, &vlv.name) {
                continue;
            }
            descriptors.push(IndexDescriptor {
                name: vlv.name.clone(),
                index_type: IndexType::Vlv(VlvIndex::from_config(vlv)?),
            });
        }
    }

    if flags.reindexing {
        for name in &options.index_attrs {
            let lower = name.to_lowercase();
            if !SYSTEM_INDEXES.contains(&lower.as_str())
                && !descriptors.iter().any(|d| d.name.eq_ignore_ascii_case(name))
            {
                warn!(index = %name, "no such index configured, nothing to rebuild for it");
            }
        }
    }
    Ok(descriptors)
}
