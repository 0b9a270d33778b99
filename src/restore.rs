use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use clap::{Args, ValueEnum};
use log::{debug, info, warn};

use crate::compression::{self, Compression};
use crate::context::{Context, ToolOptions};
use crate::destination::parse_spec;
use crate::error::{Error, IoResultExt, Result};
use crate::retention::{retention_pass, Boundary, RetentionConfig, RetentionOutcome};
use crate::wal::{self, WalFileKind};

const IDLE_SLEEP: Duration = Duration::from_secs(1);
/// How long retention stays suspended after a pg_controldata hiccup.
const CONTROLDATA_BACKOFF: Duration = Duration::from_secs(300);
const CONTROLDATA_HANG_RETRY: Duration = Duration::from_secs(60);

/// What a pg_controldata failure during retention does to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlDataPolicy {
    /// Treat the failure as fatal.
    Break,
    /// Suspend retention for five minutes and keep serving segments.
    Ignore,
    /// Block, retrying every minute, until pg_controldata works again.
    Hang,
}

#[derive(Debug, Args)]
pub struct Options {
    #[arg(long = "data-dir", default_value = ".")]
    pub data_dir: PathBuf,

    /// WAL archive directory, optionally `CMP=DIR`.
    #[arg(long = "source")]
    pub source: String,

    /// Segments younger than this many seconds are held back.
    #[arg(long = "recovery-delay", default_value_t = 0)]
    pub recovery_delay: u64,

    /// File whose appearance ends recovery; content `NOW` fails at once,
    /// anything else waits for already-archived segments first.
    #[arg(long = "finish-trigger")]
    pub finish_trigger: Option<PathBuf>,

    #[arg(long = "removal-pause-trigger")]
    pub removal_pause_trigger: Option<PathBuf>,

    /// Program run as `<hook> pg_xlog/<segment>` before each removal.
    #[arg(long = "pre-removal-processing")]
    pub pre_removal_processing: Option<String>,

    #[arg(long = "remove-at-a-time", default_value_t = 3)]
    pub remove_at_a_time: usize,

    /// Explicit removal boundary instead of deriving it from
    /// pg_controldata.
    #[arg(long = "remove-unneeded", conflicts_with = "remove_before")]
    pub remove_unneeded: Option<String>,

    /// Run one retention pass before the first availability check.
    #[arg(long = "remove-before")]
    pub remove_before: bool,

    /// Fail fast on missing segments so the server falls back to
    /// streaming replication.
    #[arg(long = "streaming-replication")]
    pub streaming_replication: bool,

    #[arg(long = "error-pgcontroldata", value_enum, default_value_t = ControlDataPolicy::Ignore)]
    pub error_pgcontroldata: ControlDataPolicy,

    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long = "pgcontroldata-path", default_value = "pg_controldata")]
    pub pgcontroldata_path: String,

    #[command(flatten)]
    pub tools: ToolOptions,

    /// Segment name as handed over by restore_command (%f).
    pub segment: String,

    /// Where to place the segment, relative to data-dir (%p).
    pub destination: PathBuf,
}

enum Attempt {
    Delivered,
    DelayNotMet,
    Absent,
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
    wal::classify(&opts.segment)
        .ok_or_else(|| Error::Precondition(format!("{} is not a WAL file name", opts.segment)))?;

    let temp_dir = opts
        .temp_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join("omnipitr-restore");
    let mut ctx = Context::new(temp_dir, opts.tools.clone());
    ctx.backup_tools.pgcontroldata_path = opts.pgcontroldata_path.clone();

    // SIGUSR1 flips the same flag an immediate finish trigger would.
    let finish_now = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&finish_now));

    let worker = Worker {
        opts,
        ctx,
        source_dir,
        source_compression,
        finish_now,
        retention_suspended_until: None,
    };
    worker.run()
}

struct Worker<'a> {
    opts: &'a Options,
    ctx: Context,
    source_dir: PathBuf,
    source_compression: Compression,
    finish_now: Arc<AtomicBool>,
    retention_suspended_until: Option<Instant>,
}

impl Worker<'_> {
    fn run(mut self) -> Result<()> {
        if self.opts.remove_before {
            self.retention()?;
        }

        loop {
            self.check_finish_trigger()?;

            match self.attempt_delivery()? {
                Attempt::Delivered => {
                    info!("delivered {}", self.opts.segment);
                    return Ok(());
                }
                Attempt::DelayNotMet => {
                    debug!("{} is younger than the recovery delay", self.opts.segment);
                    thread::sleep(IDLE_SLEEP);
                }
                Attempt::Absent => {
                    self.handle_absent()?;
                    thread::sleep(IDLE_SLEEP);
                    self.retention()?;
                }
            }
        }
    }

    /// Immediate finish (trigger content `NOW` or SIGUSR1) fails the
    /// invocation on the next check, wherever the loop is.
    fn check_finish_trigger(&self) -> Result<()> {
        if self.finish_now.load(Ordering::Relaxed) {
            return Err(Error::FinishNow);
        }
        if let Some(trigger) = &self.opts.finish_trigger {
            if trigger.exists() {
                let content = fs::read_to_string(trigger).at(trigger)?;
                if content.trim_end() == "NOW" {
                    return Err(Error::FinishNow);
                }
            }
        }
        Ok(())
    }

    fn smart_finish_requested(&self) -> bool {
        self.opts
            .finish_trigger
            .as_deref()
            .is_some_and(Path::exists)
    }

    fn attempt_delivery(&self) -> Result<Attempt> {
        let archive_name = format!(
            "{}{}",
            self.opts.segment,
            self.source_compression.extension()
        );
        let source = self.source_dir.join(&archive_name);
        if !source.exists() {
            return Ok(Attempt::Absent);
        }

        if self.opts.recovery_delay > 0 {
            let mtime = fs::metadata(&source).at(&source)?.modified().at(&source)?;
            let age = SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            if age < Duration::from_secs(self.opts.recovery_delay) {
                return Ok(Attempt::DelayNotMet);
            }
        }

        let destination = if self.opts.destination.is_absolute() {
            self.opts.destination.clone()
        } else {
            self.opts.data_dir.join(&self.opts.destination)
        };
        compression::decompress_into(&self.ctx, self.source_compression, &source, &destination)?;
        Ok(Attempt::Delivered)
    }

    /// The segment is not in the archive: decide between waiting and the
    /// various terminal conditions.
    fn handle_absent(&self) -> Result<()> {
        if self.smart_finish_requested() {
            return Err(Error::FinishNow);
        }
        if wal::classify(&self.opts.segment) == Some(WalFileKind::History) {
            return Err(Error::NotAvailable(format!(
                "history file {} is not archived",
                self.opts.segment
            )));
        }
        if self.opts.streaming_replication {
            return Err(Error::NotAvailable(format!(
                "{} is not archived, handing over to streaming replication",
                self.opts.segment
            )));
        }
        Ok(())
    }

    fn retention(&mut self) -> Result<()> {
        if let Some(until) = self.retention_suspended_until {
            if Instant::now() < until {
                return Ok(());
            }
            self.retention_suspended_until = None;
        }

        let boundary = match &self.opts.remove_unneeded {
            Some(name) => Boundary::Explicit(name.clone()),
            None => Boundary::FromControlData,
        };
        let cfg = RetentionConfig {
            ctx: &self.ctx,
            data_dir: &self.opts.data_dir,
            source_dir: &self.source_dir,
            source_compression: self.source_compression,
            pause_trigger: self.opts.removal_pause_trigger.as_deref(),
            pre_removal_hook: self.opts.pre_removal_processing.as_deref(),
            remove_at_a_time: self.opts.remove_at_a_time,
            boundary,
        };

        loop {
            match retention_pass(&cfg)? {
                RetentionOutcome::Removed { removed, aborted } => {
                    if removed > 0 {
                        debug!("retention removed {removed} segment(s)");
                    }
                    if aborted {
                        warn!("pre-removal hook aborted the batch; will retry later");
                    }
                    return Ok(());
                }
                RetentionOutcome::Paused => return Ok(()),
                RetentionOutcome::ControlDataFailed(detail) => {
                    match self.opts.error_pgcontroldata {
                        ControlDataPolicy::Break => {
                            return Err(Error::external("pg_controldata", detail));
                        }
                        ControlDataPolicy::Ignore => {
                            warn!(
                                "pg_controldata failed ({detail}); retention suspended for {}s",
                                CONTROLDATA_BACKOFF.as_secs()
                            );
                            self.retention_suspended_until =
                                Some(Instant::now() + CONTROLDATA_BACKOFF);
                            return Ok(());
                        }
                        ControlDataPolicy::Hang => {
                            warn!("pg_controldata failed ({detail}); retrying in {}s",
                                CONTROLDATA_HANG_RETRY.as_secs()
                            );
                            thread::sleep(CONTROLDATA_HANG_RETRY);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    const SEGMENT: &str = "000000010000000000000001";

    fn options(dir: &Path, archive: &Path) -> Options {
        Options {
            data_dir: dir.into(),
            source: archive.to_string_lossy().into_owned(),
            recovery_delay: 0,
            finish_trigger: None,
            removal_pause_trigger: None,
            pre_removal_processing: None,
            remove_at_a_time: 3,
            remove_unneeded: None,
            remove_before: false,
            streaming_replication: false,
            error_pgcontroldata: ControlDataPolicy::Ignore,
            temp_dir: Some(dir.join("tmp")),
            pgcontroldata_path: "pg_controldata".into(),
            tools: ToolOptions::default(),
            segment: SEGMENT.into(),
            destination: PathBuf::from("pg_xlog/RECOVERYXLOG"),
        }
    }

    fn worker<'a>(opts: &'a Options, archive: &Path) -> Worker<'a> {
        let mut ctx = Context::new(opts.temp_dir.clone().unwrap(), opts.tools.clone());
        ctx.backup_tools.shell_path = "sh".into();
        let (compression, _) = parse_spec(&opts.source);
        Worker {
            opts,
            ctx,
            source_dir: archive.into(),
            source_compression: compression,
            finish_now: Arc::new(AtomicBool::new(false)),
            retention_suspended_until: None,
        }
    }

    #[test]
    fn delivers_a_plain_segment() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        fs::create_dir_all(dir.path().join("pg_xlog")).unwrap();
        fs::write(archive.join(SEGMENT), b"segment body").unwrap();

        let opts = options(dir.path(), &archive);
        let w = worker(&opts, &archive);
        assert!(matches!(w.attempt_delivery().unwrap(), Attempt::Delivered));
        assert_eq!(
            fs::read(dir.path().join("pg_xlog/RECOVERYXLOG")).unwrap(),
            b"segment body"
        );
    }

    #[test]
    fn delivers_a_gzipped_segment() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        fs::create_dir_all(dir.path().join("pg_xlog")).unwrap();

        let plain = dir.path().join("plain");
        fs::write(&plain, b"compressed segment body").unwrap();
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!(
                "gzip --stdout {} > {}",
                plain.display(),
                archive.join(format!("{SEGMENT}.gz")).display()
            ))
            .status()
            .unwrap();
        assert!(status.success());

        let mut opts = options(dir.path(), &archive);
        opts.source = format!("gzip={}", archive.display());
        let w = worker(&opts, &archive);
        assert!(matches!(w.attempt_delivery().unwrap(), Attempt::Delivered));
        assert_eq!(
            fs::read(dir.path().join("pg_xlog/RECOVERYXLOG")).unwrap(),
            b"compressed segment body"
        );
    }

    #[test]
    fn recovery_delay_holds_young_segments() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        fs::write(archive.join(SEGMENT), b"x").unwrap();

        let mut opts = options(dir.path(), &archive);
        opts.recovery_delay = 3600;
        let w = worker(&opts, &archive);
        assert!(matches!(w.attempt_delivery().unwrap(), Attempt::DelayNotMet));
    }

    #[test]
    fn immediate_finish_trigger_is_fatal() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        let trigger = dir.path().join("finish");
        fs::write(&trigger, "NOW\n").unwrap();

        let mut opts = options(dir.path(), &archive);
        opts.finish_trigger = Some(trigger);
        let w = worker(&opts, &archive);
        assert!(matches!(w.check_finish_trigger(), Err(Error::FinishNow)));
    }

    #[test]
    fn smart_finish_waits_for_present_segments_only() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        let trigger = dir.path().join("finish");
        fs::write(&trigger, "smart\n").unwrap();

        let mut opts = options(dir.path(), &archive);
        opts.finish_trigger = Some(trigger);
        let w = worker(&opts, &archive);

        // Not immediate: the check passes.
        w.check_finish_trigger().unwrap();
        // But a missing segment now terminates instead of waiting.
        assert!(matches!(w.handle_absent(), Err(Error::FinishNow)));
    }

    #[test]
    fn sigusr1_flag_requests_immediate_finish() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        let opts = options(dir.path(), &archive);
        let w = worker(&opts, &archive);
        w.finish_now.store(true, Ordering::Relaxed);
        assert!(matches!(w.check_finish_trigger(), Err(Error::FinishNow)));
    }

    #[test]
    fn missing_history_is_quiet() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();

        let mut opts = options(dir.path(), &archive);
        opts.segment = "00000002.history".into();
        let w = worker(&opts, &archive);
        let err = w.handle_absent().unwrap_err();
        assert!(err.is_quiet());
    }

    #[test]
    fn streaming_replication_moves_on() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();

        let mut opts = options(dir.path(), &archive);
        opts.streaming_replication = true;
        let w = worker(&opts, &archive);
        assert!(w.handle_absent().is_err());
    }

    #[test]
    fn absent_segment_keeps_waiting_by_default() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        let opts = options(dir.path(), &archive);
        let w = worker(&opts, &archive);
        assert!(matches!(w.attempt_delivery().unwrap(), Attempt::Absent));
        w.handle_absent().unwrap();
    }

    #[test]
    fn retention_with_explicit_boundary_runs_inline() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        for n in 1..=6 {
            fs::write(
                archive.join(format!("0000000100000000000000{n:02X}")),
                b"wal",
            )
            .unwrap();
        }

        let mut opts = options(dir.path(), &archive);
        opts.remove_unneeded = Some("000000010000000000000005".into());
        opts.remove_at_a_time = 10;
        let mut w = worker(&opts, &archive);
        w.retention().unwrap();

        for n in 1..=4 {
            assert!(!archive
                .join(format!("0000000100000000000000{n:02X}"))
                .exists());
        }
        assert!(archive.join("000000010000000000000005").exists());
        assert!(archive.join("000000010000000000000006").exists());
    }
}
