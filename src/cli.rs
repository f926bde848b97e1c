//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::entry::uniqueid::UniqueIdPolicy;
use crate::import::{JobFlags, JobOptions};
use crate::logging::LogFormat;

/// Bulk import, reindex and DN upgrade for an LDAP directory backend.
#[derive(Parser, Debug)]
#[command(name = "ldbm-import")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Backend configuration file (JSON).
    #[arg(long, env = "LDBM_IMPORT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the backend instances.
    #[arg(long, env = "LDBM_IMPORT_DB_DIR", default_value = "db", global = true)]
    pub db_dir: PathBuf,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only report warnings and errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log output format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Do not draw the progress spinner.
    #[arg(long, global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import LDIF files into a fresh backend instance.
    Import(ImportArgs),

    /// Rebuild indexes from the stored entries.
    Reindex(ReindexArgs),

    /// Upgrade stored DNs to the current escaping and spacing rules.
    UpgradeDn(UpgradeDnArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "ldbm-import",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the import command.
#[derive(Parser, Debug)]
pub struct ImportArgs {
    /// LDIF files to read, in order (`-` reads standard input).
    #[arg(required = true)]
    pub ldif: Vec<PathBuf>,

    /// Only import entries under this suffix (repeatable).
    #[arg(long = "include-suffix", value_name = "DN")]
    pub include_suffixes: Vec<String>,

    /// Skip entries under this suffix (repeatable).
    #[arg(long = "exclude-suffix", value_name = "DN")]
    pub exclude_suffixes: Vec<String>,

    /// Build only the primary store and the system indexes.
    #[arg(long)]
    pub no_attr_indexes: bool,

    /// End a pass after this many entries (0 lets throughput decide).
    #[arg(long, default_value_t = 0)]
    pub merge_chunk_size: u64,

    /// Check encrypted attributes on a separate copy of the entry.
    #[arg(long)]
    pub encrypt: bool,

    /// How entries without nsuniqueid get one.
    #[arg(long, value_enum, default_value_t = UniqueIdPolicy::Time)]
    pub uniqueid: UniqueIdPolicy,

    /// Namespace for name-based unique ids.
    #[arg(long)]
    pub uniqueid_namespace: Option<String>,

    /// Drop duplicate attribute values.
    #[arg(long)]
    pub remove_dup_values: bool,

    /// Do not add superior object classes.
    #[arg(long)]
    pub no_expand_objectclasses: bool,

    /// Do not add missing RDN values as attributes.
    #[arg(long)]
    pub no_rdn_values: bool,

    /// Queue entries one by one into an online bulk import instead of
    /// reading them on a producer thread.
    #[arg(long)]
    pub online: bool,
}

/// Arguments for the reindex command.
#[derive(Parser, Debug)]
pub struct ReindexArgs {
    /// Index to rebuild (repeatable); all of them when omitted.
    #[arg(long = "attr", value_name = "NAME")]
    pub attrs: Vec<String>,

    /// Rewrite stored entries into the RDN form while reindexing.
    #[arg(long)]
    pub dn2rdn: bool,
}

/// Arguments for the upgrade-dn command.
#[derive(Parser, Debug)]
pub struct UpgradeDnArgs {
    /// Only report what would change; exits 2, 3 or 4 when work is found.
    #[arg(long)]
    pub dry_run: bool,

    /// Normalize runs of spaces in RDN values.
    #[arg(long)]
    pub spaces: bool,

    /// Re-escape DN values per RFC 4514 (the default when no mode is given).
    #[arg(long)]
    pub rfc4514: bool,
}

impl ImportArgs {
    pub fn job_options(&self, show_progress: bool) -> JobOptions {
        let defaults = JobOptions::default();
        JobOptions {
            flags: JobFlags {
                use_files: true,
                index_attrs: !self.no_attr_indexes,
                encrypt: self.encrypt,
                ..JobFlags::default()
            },
            input_files: self.ldif.clone(),
            include_suffixes: self.include_suffixes.clone(),
            exclude_suffixes: self.exclude_suffixes.clone(),
            uniqueid: self.uniqueid,
            uniqueid_namespace: self.uniqueid_namespace.clone(),
            remove_duplicate_values: self.remove_dup_values,
            expand_objectclasses: !self.no_expand_objectclasses,
            add_rdn_values: !self.no_rdn_values,
            merge_chunk_size: self.merge_chunk_size,
            show_progress,
            ..defaults
        }
    }
}

impl ReindexArgs {
    pub fn job_options(&self, show_progress: bool) -> JobOptions {
        let mut options = JobOptions {
            index_attrs: self.attrs.clone(),
            show_progress,
            ..JobOptions::default()
        };
        options.flags.reindexing = true;
        options.flags.dn2rdn = self.dn2rdn;
        options
    }
}

impl UpgradeDnArgs {
    pub fn job_options(&self, show_progress: bool) -> JobOptions {
        let mut options = JobOptions {
            show_progress,
            ..JobOptions::default()
        };
        options.flags.dry_run = self.dry_run;
        options.flags.upgrade_dn_format_spaces = self.spaces;
        options.flags.upgrade_dn_format = self.rfc4514 || !self.spaces;
        options
    }
}
