use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use clap::Args;
use log::{info, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::wal;

use super::label::parse_wal_line;
use super::tarball::{data_tar_argv, make_archive, xlog_tar_argv};
use super::{wait_for_file, BackupRun, CommonOptions, Produced};

#[derive(Debug, Args)]
pub struct Options {
    #[command(flatten)]
    pub common: CommonOptions,

    /// Hold area the archive_command's --dst-backup points at; this tool
    /// owns the symlink for the duration of the backup.
    #[arg(long = "xlogs")]
    pub xlogs: PathBuf,
}

/// xlog hold area: `<xlogs>` is a symlink to `<xlogs>.real` so the
/// archiver keeps a stable target while this run owns the real directory.
struct HoldArea {
    link: PathBuf,
    real: PathBuf,
}

impl HoldArea {
    fn create(link: &Path) -> Result<Self> {
        let real = PathBuf::from(format!("{}.real", link.display()));
        if link.exists() || real.exists() {
            return Err(Error::Precondition(format!(
                "xlog hold area {} already exists; is another backup running?",
                link.display()
            )));
        }
        fs::create_dir_all(&real).at(&real)?;
        symlink(&real, link).at(link)?;
        Ok(Self {
            link: link.to_path_buf(),
            real,
        })
    }

    fn unlink(&self) {
        match fs::remove_file(&self.link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove xlog symlink {}: {e}", self.link.display()),
        }
    }

    fn remove(self) {
        self.unlink();
        if let Err(e) = fs::remove_dir_all(&self.real) {
            warn!("cannot remove xlog hold area {}: {e}", self.real.display());
        }
    }
}

pub fn run(opts: &Options) -> Result<()> {
    let run = BackupRun::prepare(&opts.common)?;
    let hold = if run.skip_xlogs {
        None
    } else {
        Some(HoldArea::create(&opts.xlogs)?)
    };

    let result = execute(&run, opts, hold.as_ref());
    if let Some(hold) = hold {
        hold.remove();
    }
    let produced = result?;

    run.deliver_to_remote_destinations(&produced)?;
    run.finish_digests(&produced)?;
    run.cleanup()?;
    info!("backup complete");
    Ok(())
}

fn execute(run: &BackupRun, opts: &Options, hold: Option<&HoldArea>) -> Result<Vec<Produced>> {
    info!("starting backup of {}", run.data_dir.display());
    run.psql.run("SELECT pg_start_backup('omnipitr');")?;

    // pg_stop_backup must run even when the tar fails, or the server
    // stays in backup mode.
    let data_argv = data_tar_argv(run, &run.data_dir, false);
    let data = data_argv.and_then(|argv| make_archive(run, "data", argv));
    let stop = run.psql.run("SELECT pg_stop_backup();");
    let mut produced = data?;
    stop?;

    if run.skip_xlogs {
        return Ok(produced);
    }
    let hold = hold.expect("hold area exists unless --skip-xlogs");

    // PostgreSQL finishes the backup by archiving a .backup sentinel;
    // its STOP WAL LOCATION names the last segment this backup needs.
    let sentinel = wait_for_file(&hold.real, "backup sentinel", |name| {
        wal::classify(name) == Some(wal::WalFileKind::BackupMarker)
    })?;
    let content = fs::read_to_string(&sentinel).at(&sentinel)?;
    let (stop_lsn, stop_file) = parse_wal_line(&content, "STOP WAL LOCATION")?;

    let last_segment = match stop_file {
        Some(file) => file,
        None => {
            let (_, start_file) = parse_wal_line(&content, "START WAL LOCATION")?;
            let start_file = start_file.ok_or_else(|| {
                Error::Precondition("backup sentinel names no WAL files".into())
            })?;
            let timeline = u32::from_str_radix(&start_file[..8], 16).map_err(|_| {
                Error::Precondition(format!("bad timeline in {start_file:?}"))
            })?;
            stop_lsn.segment_name(timeline)
        }
    };

    info!("waiting for final segment {last_segment}");
    wait_for_file(&hold.real, &format!("segment {last_segment}"), |name| {
        name == last_segment
    })?;

    // Stop routing new segments into the hold area before tarring it.
    hold.unlink();
    let xlog_argv = xlog_tar_argv(run, &[&hold.real]);
    produced.extend(make_archive(run, "xlog", xlog_argv)?);
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hold_area_lifecycle() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("xlogs");

        let hold = HoldArea::create(&link).unwrap();
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(hold.real.is_dir());

        // Files written through the symlink land in the real directory.
        fs::write(link.join("000000010000000000000001"), "x").unwrap();
        assert!(hold.real.join("000000010000000000000001").exists());

        hold.remove();
        assert!(!link.exists());
        assert!(!dir.path().join("xlogs.real").exists());
    }

    #[test]
    fn hold_area_refuses_leftovers() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("xlogs");
        fs::create_dir(&link).unwrap();
        assert!(matches!(
            HoldArea::create(&link),
            Err(Error::Precondition(_))
        ));
    }
}
