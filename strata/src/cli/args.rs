//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::config::{parse_categories, ChannelConfig};
use crate::domain::ConfigError;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    about = "Run a simulated coprocessor workload under strata instrumentation",
    after_help = "\
EXAMPLES:
    strata                                   4 threads, default services
    strata --threads 8 --kernels 100         Larger workload
    strata --config channel.json --export out.jsonl
                                             Config file + JSON Lines export
    strata --categories 1                    Import every metadata category
    RUST_LOG=debug strata                    Show per-buffer flush summaries"
)]
pub struct Args {
    /// Channel config file (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Worker threads in the workload
    #[arg(short, long, default_value = "4", value_parser = clap::value_parser!(u32).range(1..=256))]
    pub threads: u32,

    /// Kernel launches per thread
    #[arg(short, long, default_value = "16")]
    pub kernels: u32,

    /// Record demangled kernel names
    #[arg(long)]
    pub record_kernel_names: bool,

    /// Only track API regions, do not collect completion records
    #[arg(long)]
    pub no_trace_activities: bool,

    /// Metadata categories to import, comma-separated (1 = all)
    #[arg(long, value_name = "LIST")]
    pub categories: Option<String>,

    /// Write every record as JSON Lines to FILE
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Suppress the summary
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Apply command-line overrides to `config`
    pub fn apply(&self, config: &mut ChannelConfig) -> Result<(), ConfigError> {
        if self.record_kernel_names {
            config.activity.record_kernel_names = true;
        }
        if self.no_trace_activities {
            config.activity.trace_activities = false;
        }
        if let Some(list) = &self.categories {
            config.metadata.categories = parse_categories(list)?;
        }
        Ok(())
    }
}
