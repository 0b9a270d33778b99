use std::path::PathBuf;

use clap::Args;
use log::info;

use crate::context::{Context, ToolOptions};
use crate::destination::parse_spec;
use crate::error::{Error, Result};
use crate::retention::{retention_pass, Boundary, RetentionConfig, RetentionOutcome};

/// One out-of-band garbage-collection pass over the WAL archive, for
/// operators who schedule retention outside the restore loop.
#[derive(Debug, Args)]
pub struct Options {
    #[arg(long = "data-dir", default_value = ".")]
    pub data_dir: PathBuf,

    /// WAL archive directory, optionally `CMP=DIR`.
    #[arg(long = "source")]
    pub source: String,

    #[arg(long = "removal-pause-trigger")]
    pub removal_pause_trigger: Option<PathBuf>,

    /// Program run as `<hook> pg_xlog/<segment>` before each removal.
    #[arg(long = "pre-removal-processing")]
    pub pre_removal_processing: Option<String>,

    /// Cap per run; 0 removes everything eligible.
    #[arg(long = "remove-at-a-time", default_value_t = 0)]
    pub remove_at_a_time: usize,

    /// Explicit removal boundary instead of deriving it from
    /// pg_controldata.
    #[arg(long = "remove-unneeded")]
    pub remove_unneeded: Option<String>,

    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long = "pgcontroldata-path", default_value = "pg_controldata")]
    pub pgcontroldata_path: String,

    #[command(flatten)]
    pub tools: ToolOptions,
}

pub fn run(opts: &Options) -> Result<()> {
    let (source_compression, source_dir) = parse_spec(&opts.source);
    let source_dir = PathBuf::from(source_dir);
    if !source_dir.is_dir() {
        return Err(Error::Config(format!(
            "wal archive {} is not a directory",
            source_dir.display()
        )));
    }

    let temp_dir = opts
        .temp_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join("omnipitr-cleanup");
    let mut ctx = Context::new(temp_dir, opts.tools.clone());
    ctx.backup_tools.pgcontroldata_path = opts.pgcontroldata_path.clone();

    let boundary = match &opts.remove_unneeded {
        Some(name) => Boundary::Explicit(name.clone()),
        None => Boundary::FromControlData,
    };
    let cfg = RetentionConfig {
        ctx: &ctx,
        data_dir: &opts.data_dir,
        source_dir: &source_dir,
        source_compression,
        pause_trigger: opts.removal_pause_trigger.as_deref(),
        pre_removal_hook: opts.pre_removal_processing.as_deref(),
        remove_at_a_time: opts.remove_at_a_time,
        boundary,
    };

    match retention_pass(&cfg)? {
        RetentionOutcome::Removed { removed, aborted } => {
            if aborted {
                return Err(Error::external(
                    "pre-removal hook",
                    format!("batch abandoned after {removed} removal(s)"),
                ));
            }
            info!("removed {removed} segment(s)");
            Ok(())
        }
        RetentionOutcome::Paused => {
            info!("removal pause trigger present, nothing done");
            Ok(())
        }
        RetentionOutcome::ControlDataFailed(detail) => {
            Err(Error::external("pg_controldata", detail))
        }
    }
}
