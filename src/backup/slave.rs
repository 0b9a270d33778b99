use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Local;
use clap::Args;
use log::{info, warn};

use crate::controldata::ControlData;
use crate::destination::parse_spec;
use crate::error::{Error, IoResultExt, Result};

use super::label::{backup_marker_name, parse_wal_line, synthesize_label, synthesize_marker};
use super::tarball::{data_tar_argv, make_archive, xlog_tar_argv};
use super::{BackupRun, CommonOptions, Produced};

/// How often pg_controldata is re-read while waiting for a checkpoint.
const CONTROL_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Args)]
pub struct Options {
    #[command(flatten)]
    pub common: CommonOptions,

    /// WAL archive directory the standby replays from, optionally `CMP=DIR`.
    #[arg(long = "source")]
    pub source: String,

    /// Created for the duration of the run so the restore's retention
    /// leaves the archive untouched.
    #[arg(long = "removal-pause-trigger")]
    pub removal_pause_trigger: Option<PathBuf>,

    /// Call pg_start_backup/pg_stop_backup on the primary instead of
    /// simulating the protocol from pg_controldata.
    #[arg(long = "call-master")]
    pub call_master: bool,
}

pub fn run(opts: &Options) -> Result<()> {
    let run = BackupRun::prepare(&opts.common)?;
    let (_, source_dir) = parse_spec(&opts.source);
    let source_dir = PathBuf::from(source_dir);
    if !source_dir.is_dir() {
        return Err(Error::Config(format!(
            "wal archive {} is not a directory",
            source_dir.display()
        )));
    }

    // Retention must hold still while the archive contents back this run.
    if let Some(trigger) = &opts.removal_pause_trigger {
        fs::write(trigger, format!("{}\n", std::process::id())).at(trigger)?;
    }

    let result = execute(&run, opts, &source_dir);

    if let Some(trigger) = &opts.removal_pause_trigger {
        if let Err(e) = fs::remove_file(trigger) {
            warn!(
                "cannot remove removal-pause trigger {}: {e}",
                trigger.display()
            );
        }
    }
    let produced = result?;

    run.deliver_to_remote_destinations(&produced)?;
    run.finish_digests(&produced)?;
    run.cleanup()?;
    info!("backup complete");
    Ok(())
}

fn execute(run: &BackupRun, opts: &Options, source_dir: &Path) -> Result<Vec<Produced>> {
    if opts.call_master {
        execute_with_master(run, source_dir)
    } else {
        execute_standalone(run, source_dir)
    }
}

/// Simulated protocol: two pg_controldata snapshots bracket the data
/// copy, and the label is synthesized locally.
fn execute_standalone(run: &BackupRun, source_dir: &Path) -> Result<Vec<Produced>> {
    let initial = ControlData::read(&run.ctx, &run.data_dir)?;
    let start = initial.redo_location()?;
    let checkpoint = initial.checkpoint_location()?;
    let timeline = initial.timeline_id()?;
    info!("initial checkpoint {checkpoint}, REDO {start}");

    let data_argv = data_tar_argv(run, &run.data_dir, true)?;
    let mut produced = make_archive(run, "data", data_argv)?;

    info!("waiting for checkpoint to advance past {checkpoint}");
    let fin = wait_for_checkpoint(run, |cd| {
        Ok(cd.checkpoint_location()? != checkpoint)
    })?;
    let stop = match fin.min_recovery_location() {
        Some(lsn) => lsn,
        None => fin.checkpoint_location()?,
    };

    if run.skip_xlogs {
        return Ok(produced);
    }

    let label = synthesize_label(start, stop, checkpoint, timeline, run.started_at, Local::now());
    let marker = synthesize_marker(start, stop, checkpoint, timeline, run.started_at, Local::now());
    let meta = write_metadata(run, &label, &backup_marker_name(start, timeline), &marker)?;

    let xlog_argv = xlog_tar_argv(run, &[source_dir, &meta]);
    produced.extend(make_archive(run, "xlog", xlog_argv)?);
    Ok(produced)
}

/// Coordinated protocol: the primary runs the backup bracket, the label
/// comes from pg_read_file, and the standby only has to catch up to the
/// start location before copying.
fn execute_with_master(run: &BackupRun, source_dir: &Path) -> Result<Vec<Produced>> {
    run.psql.run("SELECT pg_start_backup('omnipitr');")?;

    // Servers that cannot expose backup_label surface the psql error
    // here; there is no silent fallback.
    let label = run
        .psql
        .run("SELECT pg_read_file('backup_label', 0, 8192);")?;
    let (start, _) = parse_wal_line(&label, "START WAL LOCATION")?;
    let (checkpoint, _) = parse_wal_line(&label, "CHECKPOINT LOCATION")?;

    info!("waiting for standby to reach {start}");
    let reached = wait_for_checkpoint(run, |cd| {
        Ok(cd.checkpoint_location()? >= start)
    });
    if let Err(e) = &reached {
        warn!("standby never reached the start location: {e}");
        let _ = run.psql.run("SELECT pg_stop_backup();");
        return Err(reached.unwrap_err());
    }
    let timeline = reached?.timeline_id()?;

    let data_argv = data_tar_argv(run, &run.data_dir, true);
    let data = data_argv.and_then(|argv| make_archive(run, "data", argv));
    let stop_out = run.psql.run("SELECT pg_stop_backup();");
    let mut produced = data?;
    let (stop, _) = parse_wal_line(&stop_out?, "")?;

    if run.skip_xlogs {
        return Ok(produced);
    }

    let marker = synthesize_marker(start, stop, checkpoint, timeline, run.started_at, Local::now());
    let meta = write_metadata(run, &label, &backup_marker_name(start, timeline), &marker)?;

    let xlog_argv = xlog_tar_argv(run, &[source_dir, &meta]);
    produced.extend(make_archive(run, "xlog", xlog_argv)?);
    Ok(produced)
}

/// Re-read pg_controldata every five seconds until `done` says so.
/// Unbounded: a standby that stops replaying holds the backup, which is
/// the operator's call to interrupt.
fn wait_for_checkpoint(
    run: &BackupRun,
    mut done: impl FnMut(&ControlData) -> Result<bool>,
) -> Result<ControlData> {
    loop {
        let control = ControlData::read(&run.ctx, &run.data_dir)?;
        if done(&control)? {
            return Ok(control);
        }
        thread::sleep(CONTROL_POLL);
    }
}

/// Drop backup_label and the `.backup` marker where the xlog tar picks
/// them up as top-level entries.
fn write_metadata(
    run: &BackupRun,
    label: &str,
    marker_name: &str,
    marker: &str,
) -> Result<PathBuf> {
    let meta = run.work_dir.join("meta");
    fs::create_dir_all(&meta).at(&meta)?;
    let label_path = meta.join("backup_label");
    fs::write(&label_path, label).at(&label_path)?;
    let marker_path = meta.join(marker_name);
    fs::write(&marker_path, marker).at(&marker_path)?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::tests::common;
    use crate::wal::{self, Lsn};
    use tempfile::TempDir;

    #[test]
    fn metadata_lands_in_the_meta_dir() {
        let dir = TempDir::new().unwrap();
        let run = BackupRun::prepare(&common(dir.path())).unwrap();

        let start: Lsn = "0/5000020".parse().unwrap();
        let stop: Lsn = "0/5F00000".parse().unwrap();
        let checkpoint: Lsn = "0/5000058".parse().unwrap();
        let label =
            synthesize_label(start, stop, checkpoint, 1, run.started_at, run.started_at);
        let marker_name = backup_marker_name(start, 1);
        let meta = write_metadata(&run, &label, &marker_name, &label).unwrap();

        assert!(meta.join("backup_label").exists());
        let marker = meta.join(&marker_name);
        assert!(marker.exists());
        assert_eq!(
            wal::classify(&marker_name),
            Some(wal::WalFileKind::BackupMarker)
        );
    }
}
