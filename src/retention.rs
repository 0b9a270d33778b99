use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, info, warn};

use crate::compression::{self, Compression};
use crate::context::Context;
use crate::controldata::ControlData;
use crate::error::{Error, IoResultExt, Result};
use crate::pipetree::shell_quote;
use crate::wal::{self, WalFileKind};

/// Where the no-longer-needed boundary comes from.
#[derive(Debug, Clone)]
pub enum Boundary {
    /// Everything older than this segment name may go.
    Explicit(String),
    /// Derive the boundary from the latest checkpoint's REDO location.
    FromControlData,
}

pub struct RetentionConfig<'a> {
    pub ctx: &'a Context,
    pub data_dir: &'a Path,
    pub source_dir: &'a Path,
    pub source_compression: Compression,
    pub pause_trigger: Option<&'a Path>,
    /// Hook run as `<hook> pg_xlog/<segment>` from a staging directory
    /// before each removal; non-zero abandons the rest of the batch.
    pub pre_removal_hook: Option<&'a str>,
    /// Cap per pass; 0 means no cap.
    pub remove_at_a_time: usize,
    pub boundary: Boundary,
}

#[derive(Debug, PartialEq)]
pub enum RetentionOutcome {
    /// Removed this many segments; `aborted` when the hook cut the batch
    /// short.
    Removed { removed: usize, aborted: bool },
    /// The pause trigger exists; nothing was touched.
    Paused,
    /// pg_controldata could not be consulted; nothing was touched. The
    /// caller decides whether that is fatal.
    ControlDataFailed(String),
}

/// One garbage-collection pass over the WAL archive.
///
/// Never removes a segment at or past the boundary, and never lets an
/// archive scan failure take the caller down.
pub fn retention_pass(cfg: &RetentionConfig) -> Result<RetentionOutcome> {
    if let Some(trigger) = cfg.pause_trigger {
        if trigger.exists() {
            debug!("removal paused by {}", trigger.display());
            return Ok(RetentionOutcome::Paused);
        }
    }

    let boundary = match &cfg.boundary {
        Boundary::Explicit(name) => name.clone(),
        Boundary::FromControlData => {
            match ControlData::read(cfg.ctx, cfg.data_dir).and_then(|cd| cd.redo_segment_name()) {
                Ok(name) => name,
                Err(e) => return Ok(RetentionOutcome::ControlDataFailed(e.to_string())),
            }
        }
    };
    debug!("removal boundary is {boundary}");

    let victims = select_victims(cfg, &boundary)?;
    let mut removed = 0;
    for name in &victims {
        if let Some(hook) = cfg.pre_removal_hook {
            if let Err(e) = run_hook(cfg, hook, name) {
                warn!("pre-removal hook failed on {name}, abandoning batch: {e}");
                return Ok(RetentionOutcome::Removed {
                    removed,
                    aborted: true,
                });
            }
        }

        let path = cfg.source_dir.join(name);
        fs::remove_file(&path).at(&path)?;
        info!("removed {name}");
        removed += 1;
    }

    Ok(RetentionOutcome::Removed {
        removed,
        aborted: false,
    })
}

/// Archive entries older than the boundary, oldest first, capped.
fn select_victims(cfg: &RetentionConfig, boundary: &str) -> Result<Vec<String>> {
    let mut victims = Vec::new();
    for entry in fs::read_dir(cfg.source_dir).at(cfg.source_dir)? {
        let entry = entry.at(cfg.source_dir)?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(stripped) = cfg.source_compression.strip_extension(&name) else {
            continue;
        };
        match wal::classify(stripped) {
            Some(WalFileKind::Segment) | Some(WalFileKind::BackupMarker) => {}
            _ => continue,
        }
        if stripped < boundary {
            victims.push(name);
        }
    }

    victims.sort();
    if cfg.remove_at_a_time > 0 {
        victims.truncate(cfg.remove_at_a_time);
    }
    Ok(victims)
}

/// Stage the (optionally decompressed) segment under
/// `<staging>/pg_xlog/<segment>` and run the hook from the staging root
/// so its argument is the path PostgreSQL tooling expects.
fn run_hook(cfg: &RetentionConfig, hook: &str, archive_name: &str) -> Result<()> {
    let stripped = cfg
        .source_compression
        .strip_extension(archive_name)
        .expect("selected victims carry the extension");

    let staging = cfg.ctx.temp_dir.join("pre-removal");
    let xlog_dir = staging.join("pg_xlog");
    fs::create_dir_all(&xlog_dir).at(&xlog_dir)?;
    let staged = xlog_dir.join(stripped);
    compression::decompress_into(
        cfg.ctx,
        cfg.source_compression,
        &cfg.source_dir.join(archive_name),
        &staged,
    )?;

    let line = format!("{hook} {}", shell_quote(&format!("pg_xlog/{stripped}")));
    let shell = &cfg.ctx.backup_tools.shell_path;
    let out = Command::new(shell)
        .arg("-c")
        .arg(&line)
        .current_dir(&staging)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::external(shell, e.to_string()))?;

    let result = if out.status.success() {
        Ok(())
    } else {
        Err(Error::external(
            hook,
            format!(
                "exit {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        ))
    };

    let _ = fs::remove_file(&staged);
    result
}
