use std::cell::Cell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use log::{debug, info, warn};

use crate::compression::{self, Compression};
use crate::context::{Context, ToolOptions};
use crate::destination::{Destination, DestinationKind};
use crate::error::{Error, IoResultExt, Result};
use crate::parallel::{Job, ParallelRun};
use crate::state::{file_md5, ArchiveState};
use crate::wal;

/// Tag marking the degraded hot-backup destination in the job list.
const BACKUP_TAG: &str = "backup";

#[derive(Debug, Args)]
pub struct Options {
    /// PostgreSQL data directory the segment path is resolved against.
    #[arg(long = "data-dir", default_value = ".")]
    pub data_dir: PathBuf,

    /// Local directory destination, optionally `CMP=path`. Repeatable.
    #[arg(long = "dst-local")]
    pub dst_local: Vec<String>,

    /// Remote rsync destination `[CMP=][user@]host:/path`. Repeatable.
    #[arg(long = "dst-remote")]
    pub dst_remote: Vec<String>,

    /// Program fed each artifact on stdin, optionally `CMP=prog`. Repeatable.
    #[arg(long = "dst-pipe")]
    pub dst_pipe: Vec<String>,

    /// Hot-backup xlog hold area; failures here are logged, not fatal.
    #[arg(long = "dst-backup")]
    pub dst_backup: Option<PathBuf>,

    /// Directory for per-segment delivery state; required with more than
    /// one destination.
    #[arg(long = "state-dir")]
    pub state_dir: Option<PathBuf>,

    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long = "parallel-jobs", default_value_t = 1)]
    pub parallel_jobs: usize,

    /// Archive even when data-dir does not look like a PostgreSQL data
    /// directory.
    #[arg(long = "force-data-dir")]
    pub force_data_dir: bool,

    #[command(flatten)]
    pub tools: ToolOptions,

    /// Segment path as handed over by archive_command (%p).
    pub segment: PathBuf,
}

pub fn run(opts: &Options) -> Result<()> {
    let destinations = collect_destinations(opts)?;
    if destinations.is_empty() {
        return Err(Error::Config(
            "no destination given, need at least one --dst-local/--dst-remote/--dst-pipe".into(),
        ));
    }
    if destinations.len() > 1 && opts.state_dir.is_none() {
        return Err(Error::Config(
            "multiple destinations require --state-dir".into(),
        ));
    }

    let temp_dir = opts
        .temp_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join("omnipitr-archive");
    let ctx = Context::new(temp_dir, opts.tools.clone());

    if !opts.force_data_dir && !opts.data_dir.join("global").join("pg_control").exists() {
        return Err(Error::Precondition(format!(
            "{} does not look like a PostgreSQL data directory (use --force-data-dir to override)",
            opts.data_dir.display()
        )));
    }

    let segment_path = if opts.segment.is_absolute() {
        opts.segment.clone()
    } else {
        opts.data_dir.join(&opts.segment)
    };
    let segment_name = segment_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Precondition(format!("bad segment path {}", segment_path.display()))
        })?
        .to_string();

    wal::verify_segment_file(&segment_name, &segment_path)?;
    info!("archiving {segment_name}");

    let mut state = match &opts.state_dir {
        Some(dir) => ArchiveState::load(dir, &segment_name)?,
        None => ArchiveState::default(),
    };

    prepare_artifacts(&ctx, opts, &destinations, &segment_path, &segment_name, &mut state)?;
    let jobs = build_jobs(&ctx, opts, &destinations, &segment_path, &segment_name, &state);

    if jobs.is_empty() {
        debug!("every destination already holds {segment_name}");
        finish(opts, &ctx, &destinations, &segment_name)?;
        return Ok(());
    }

    let save_failed = Cell::new(false);
    let finished = {
        let state = &mut state;
        let save_failed = &save_failed;
        let segment_name = segment_name.as_str();
        let mut pool = ParallelRun::new(opts.parallel_jobs).on_finish(move |job| {
            let Some((kind, path)) = parse_tag(&job.tag) else {
                return;
            };
            if !job.success() {
                let detail = job.stderr.as_deref().unwrap_or("").trim();
                if job.tag.starts_with(BACKUP_TAG) {
                    warn!("hot-backup destination {path} failed (ignored): {detail}");
                } else {
                    warn!("delivery to {kind} {path} failed: {detail}");
                }
                return;
            }
            if job.tag.starts_with(BACKUP_TAG) {
                return;
            }
            state.mark_sent(kind, path);
            if let Some(dir) = &opts.state_dir {
                if let Err(e) = state.save(dir, segment_name) {
                    warn!("cannot persist state: {e}");
                    save_failed.set(true);
                }
            }
        });
        for job in jobs {
            pool.push(job);
        }
        pool.run()?
    };

    let failed: Vec<&Job> = finished
        .iter()
        .filter(|job| !job.success() && !job.tag.starts_with(BACKUP_TAG))
        .collect();
    if let Some(job) = failed.first() {
        return Err(Error::external(
            job.argv.first().cloned().unwrap_or_default(),
            format!(
                "delivery to {} failed with status {:?}",
                job.tag,
                job.status
            ),
        ));
    }
    if save_failed.get() {
        return Err(Error::Precondition(
            "deliveries succeeded but state could not be persisted".into(),
        ));
    }

    finish(opts, &ctx, &destinations, &segment_name)?;
    info!("archived {segment_name} to {} destination(s)", destinations.len());
    Ok(())
}

fn collect_destinations(opts: &Options) -> Result<Vec<Destination>> {
    let mut destinations = Vec::new();
    for spec in &opts.dst_local {
        destinations.push(Destination::local(spec)?);
    }
    for spec in &opts.dst_remote {
        destinations.push(Destination::remote(spec)?);
    }
    for spec in &opts.dst_pipe {
        destinations.push(Destination::pipe(spec)?);
    }
    Ok(destinations)
}

/// Compression runs serially, before any delivery; a cached artifact whose
/// md5 still matches the state record is reused as-is.
fn prepare_artifacts(
    ctx: &Context,
    opts: &Options,
    destinations: &[Destination],
    segment_path: &Path,
    segment_name: &str,
    state: &mut ArchiveState,
) -> Result<()> {
    let needed: BTreeSet<Compression> = destinations
        .iter()
        .map(|d| d.compression)
        .filter(|c| *c != Compression::None)
        .collect();
    if needed.is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&ctx.temp_dir).at(&ctx.temp_dir)?;
    for compression in needed {
        let artifact = artifact_path(ctx, segment_name, compression);
        if state.artifact_valid(compression, &artifact) {
            debug!("reusing cached {compression} artifact for {segment_name}");
            continue;
        }

        compression::compress_file(ctx, compression, segment_path, &artifact)?;
        state.record_compressed(compression, file_md5(&artifact)?);
        if let Some(dir) = &opts.state_dir {
            state.save(dir, segment_name)?;
        }
    }

    Ok(())
}

fn artifact_path(ctx: &Context, segment_name: &str, compression: Compression) -> PathBuf {
    ctx.temp_dir
        .join(format!("{segment_name}{}", compression.extension()))
}

fn build_jobs(
    ctx: &Context,
    opts: &Options,
    destinations: &[Destination],
    segment_path: &Path,
    segment_name: &str,
    state: &ArchiveState,
) -> Vec<Job> {
    let mut jobs = Vec::new();

    for destination in destinations {
        if state.is_sent(destination.kind, &destination.path) {
            debug!(
                "{} {} already holds {segment_name}, skipping",
                destination.kind, destination.path
            );
            continue;
        }

        let source = match destination.compression {
            Compression::None => segment_path.to_path_buf(),
            compression => artifact_path(ctx, segment_name, compression),
        };
        let artifact_name = format!("{segment_name}{}", destination.compression.extension());
        let tag = format!("{}={}", destination.kind.as_str(), destination.path);

        let job = match destination.kind {
            DestinationKind::Local | DestinationKind::Remote | DestinationKind::Direct => {
                let target = format!(
                    "{}/{artifact_name}",
                    destination.path.trim_end_matches('/')
                );
                Job::new([
                    ctx.tools.rsync_path.clone(),
                    "-t".to_string(),
                    source.to_string_lossy().into_owned(),
                    target,
                ])
                .tagged(tag)
            }
            DestinationKind::Pipe => Job::new([destination.path.clone(), artifact_name])
                .stdin_from(source)
                .tagged(tag),
        };
        jobs.push(job);
    }

    if let Some(backup_dir) = &opts.dst_backup {
        let target = format!(
            "{}/{segment_name}",
            backup_dir.to_string_lossy().trim_end_matches('/')
        );
        jobs.push(
            Job::new([
                ctx.tools.rsync_path.clone(),
                "-t".to_string(),
                segment_path.to_string_lossy().into_owned(),
                target,
            ])
            .tagged(format!("{BACKUP_TAG}={}", backup_dir.display())),
        );
    }

    jobs
}

fn parse_tag(tag: &str) -> Option<(DestinationKind, &str)> {
    let (kind, path) = tag.split_once('=')?;
    let kind = match kind {
        "local" => DestinationKind::Local,
        "remote" => DestinationKind::Remote,
        "pipe" => DestinationKind::Pipe,
        "direct" => DestinationKind::Direct,
        BACKUP_TAG => DestinationKind::Local,
        _ => return None,
    };
    Some((kind, path))
}

/// All destinations are served: drop the cached artifacts and the state
/// file so a later re-archive of a recycled name starts clean.
fn finish(
    opts: &Options,
    ctx: &Context,
    destinations: &[Destination],
    segment_name: &str,
) -> Result<()> {
    for destination in destinations {
        if destination.compression != Compression::None {
            let artifact = artifact_path(ctx, segment_name, destination.compression);
            if artifact.exists() {
                fs::remove_file(&artifact).at(&artifact)?;
            }
        }
    }
    let _ = fs::remove_dir(&ctx.temp_dir);

    if let Some(dir) = &opts.state_dir {
        ArchiveState::delete(dir, segment_name)?;
    }
    Ok(())
}
