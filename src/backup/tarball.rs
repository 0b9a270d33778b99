use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::compression::Compression;
use crate::destination::{split_remote, DestinationKind};
use crate::error::{Error, IoResultExt, Result};
use crate::pipetree::{run_script, shell_quote, PipeNode};

use super::{BackupRun, Produced};

/// A tablespace linked into `pg_tblspc/`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tablespace {
    pub oid: String,
    pub target: PathBuf,
}

pub fn discover_tablespaces(data_dir: &Path) -> Result<Vec<Tablespace>> {
    let tblspc = data_dir.join("pg_tblspc");
    if !tblspc.is_dir() {
        return Ok(Vec::new());
    }

    let mut tablespaces = Vec::new();
    for entry in fs::read_dir(&tblspc).at(&tblspc)? {
        let entry = entry.at(&tblspc)?;
        let path = entry.path();
        if !path.symlink_metadata().at(&path)?.file_type().is_symlink() {
            continue;
        }
        let target = fs::read_link(&path).at(&path)?;
        let oid = entry.file_name().to_string_lossy().into_owned();
        tablespaces.push(Tablespace { oid, target });
    }
    tablespaces.sort_by(|a, b| a.oid.cmp(&b.oid));
    Ok(tablespaces)
}

/// tar argv for the data directory: exclusions per the hot-backup
/// contract, tablespace link targets as extra top-level members rewritten
/// to `tablespaces/<oid>` so a restore lays them out identically anywhere.
pub fn data_tar_argv(
    run: &BackupRun,
    data_dir: &Path,
    exclude_recovery_conf: bool,
) -> Result<Vec<String>> {
    let data_dir = data_dir
        .canonicalize()
        .map_err(|e| Error::io(data_dir, e))?;
    let base = data_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Precondition(format!("cannot tar data dir {}", data_dir.display()))
        })?
        .to_string();
    let parent = data_dir
        .parent()
        .ok_or_else(|| Error::Precondition("data dir has no parent".into()))?;

    let mut argv = vec![
        run.ctx.backup_tools.tar_path.clone(),
        "cf".to_string(),
        "-".to_string(),
    ];

    for tablespace in discover_tablespaces(&data_dir)? {
        let stored = tablespace
            .target
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string();
        argv.push(format!(
            "--transform=s,^{stored},tablespaces/{},",
            tablespace.oid
        ));
    }

    let mut excludes = vec![
        format!("{base}/pg_log/*"),
        format!("{base}/pg_xlog/0*"),
        format!("{base}/pg_xlog/archive_status/*"),
        format!("{base}/postmaster.pid"),
    ];
    if exclude_recovery_conf {
        excludes.push(format!("{base}/recovery.conf"));
    }
    // A symlinked pg_log or pg_xlog is skipped wholesale.
    for dir in ["pg_log", "pg_xlog"] {
        let path = data_dir.join(dir);
        if path
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            excludes.push(format!("{base}/{dir}"));
        }
    }
    for pattern in excludes {
        argv.push(format!("--exclude={pattern}"));
    }

    argv.push("-C".to_string());
    argv.push(parent.to_string_lossy().into_owned());
    argv.push(base);
    for tablespace in discover_tablespaces(&data_dir)? {
        argv.push(tablespace.target.to_string_lossy().into_owned());
    }

    Ok(run.ctx.nice(argv))
}

/// tar argv for a directory of collected xlogs (and, on the slave, the
/// synthesized backup metadata), flattened under `./`.
pub fn xlog_tar_argv(run: &BackupRun, dirs: &[&Path]) -> Vec<String> {
    let mut argv = vec![
        run.ctx.backup_tools.tar_path.clone(),
        "cf".to_string(),
        "-".to_string(),
    ];
    for dir in dirs {
        argv.push("-C".to_string());
        argv.push(dir.to_string_lossy().into_owned());
        argv.push(".".to_string());
    }
    run.ctx.nice(argv)
}

/// Run one tar through the pipe tree, materialising an artifact per
/// distinct destination compression and feeding digesters inline.
///
/// Local destinations are written directly; pipe and direct destinations
/// consume FIFOs; remote destinations are satisfied later from the
/// returned local artifacts.
pub fn make_archive(run: &BackupRun, filetype: &str, tar_argv: Vec<String>) -> Result<Vec<Produced>> {
    let compressions: BTreeSet<Compression> = run
        .destinations
        .iter()
        .map(|d| d.compression)
        .collect();

    let mut root = PipeNode::new(tar_argv);
    let mut produced = Vec::new();

    for compression in compressions {
        let name = run.artifact_name(filetype, compression)?;

        // Sinks this artifact must reach inline.
        let mut files: Vec<PathBuf> = Vec::new();
        let mut programs: Vec<PipeNode> = Vec::new();

        for destination in &run.destinations {
            if destination.compression != compression {
                continue;
            }
            match destination.kind {
                DestinationKind::Local => {
                    files.push(Path::new(&destination.path).join(&name));
                }
                DestinationKind::Remote => {}
                DestinationKind::Direct => {
                    let (host, remote_path) =
                        split_remote(&destination.path).expect("validated at parse time");
                    programs.push(PipeNode::new([
                        run.ctx.backup_tools.ssh_path.clone(),
                        host.to_string(),
                        format!(
                            "{} > {}",
                            run.ctx.backup_tools.remote_cat_path,
                            shell_quote(&format!("{}/{name}", remote_path.trim_end_matches('/')))
                        ),
                    ]));
                }
                DestinationKind::Pipe => {
                    programs.push(PipeNode::new([destination.path.clone(), name.clone()]));
                }
            }
        }

        let needs_spool = run
            .destinations
            .iter()
            .any(|d| d.kind == DestinationKind::Remote && d.compression == compression)
            && files.is_empty();
        if needs_spool {
            files.push(run.work_dir.join("spool").join(&name));
        }

        for algorithm in &run.digests {
            let mut digester = PipeNode::new([algorithm.program(), "-".to_string()]);
            digester.add_stdout_file(run.digest_sum_path(*algorithm, &name));
            programs.push(digester);
        }

        let source = files.first().cloned();
        match compression.program(&run.ctx) {
            None => {
                for file in files.iter() {
                    root.add_stdout_file(file);
                }
                for program in programs {
                    root.add_stdout_program(program);
                }
            }
            Some(program) => {
                let mut compressor =
                    PipeNode::new(run.ctx.nice(vec![program.to_string(), "--stdout".to_string()]));
                for file in files.iter() {
                    compressor.add_stdout_file(file);
                }
                for node in programs {
                    compressor.add_stdout_program(node);
                }
                root.add_stdout_program(compressor);
            }
        }

        produced.push(Produced {
            name,
            source,
            compression,
        });
    }

    info!("building {filetype} archive");
    let script = root.render(&run.work_dir, &run.ctx.backup_tools.tee_path);
    run_script(&run.ctx, &script, &run.work_dir)?;
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::tests::common;
    use crate::backup::BackupRun;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn scaffold_data_dir(root: &Path) -> PathBuf {
        let data = root.join("data");
        for sub in ["global", "base", "pg_tblspc", "pg_xlog", "pg_log"] {
            fs::create_dir_all(data.join(sub)).unwrap();
        }
        fs::write(data.join("global").join("pg_control"), "x").unwrap();
        fs::write(data.join("postmaster.pid"), "123").unwrap();
        data
    }

    #[test]
    fn tablespace_links_are_discovered_and_transformed() {
        let dir = TempDir::new().unwrap();
        let data = scaffold_data_dir(dir.path());
        let ts_target = dir.path().join("mnt").join("ts1");
        fs::create_dir_all(&ts_target).unwrap();
        symlink(&ts_target, data.join("pg_tblspc").join("16400")).unwrap();

        let tablespaces = discover_tablespaces(&data).unwrap();
        assert_eq!(tablespaces.len(), 1);
        assert_eq!(tablespaces[0].oid, "16400");

        let mut opts = common(dir.path());
        opts.tools.not_nice = true;
        let run = BackupRun::prepare(&opts).unwrap();
        let argv = data_tar_argv(&run, &data, false).unwrap();

        let stored = ts_target.to_string_lossy().trim_start_matches('/').to_string();
        assert!(argv.contains(&format!("--transform=s,^{stored},tablespaces/16400,")));
        assert_eq!(
            argv.last().unwrap(),
            &ts_target.to_string_lossy().into_owned()
        );
    }

    #[test]
    fn data_tar_excludes_the_usual_suspects() {
        let dir = TempDir::new().unwrap();
        let data = scaffold_data_dir(dir.path());

        let mut opts = common(dir.path());
        opts.tools.not_nice = true;
        let run = BackupRun::prepare(&opts).unwrap();
        let argv = data_tar_argv(&run, &data, true).unwrap();

        for pattern in [
            "data/pg_log/*",
            "data/pg_xlog/0*",
            "data/pg_xlog/archive_status/*",
            "data/postmaster.pid",
            "data/recovery.conf",
        ] {
            assert!(
                argv.contains(&format!("--exclude={pattern}")),
                "{argv:?} lacks {pattern}"
            );
        }
        assert_eq!(argv[0], "tar");
    }

    #[test]
    fn symlinked_xlog_is_excluded_wholesale() {
        let dir = TempDir::new().unwrap();
        let data = scaffold_data_dir(dir.path());
        fs::remove_dir(data.join("pg_xlog")).unwrap();
        let real = dir.path().join("wal-on-other-disk");
        fs::create_dir(&real).unwrap();
        symlink(&real, data.join("pg_xlog")).unwrap();

        let mut opts = common(dir.path());
        opts.tools.not_nice = true;
        let run = BackupRun::prepare(&opts).unwrap();
        let argv = data_tar_argv(&run, &data, false).unwrap();
        assert!(argv.contains(&"--exclude=data/pg_xlog".to_string()));
    }

    #[test]
    fn make_archive_fans_out_to_locals_and_digests() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        let payload = dir.path().join("payload");
        fs::create_dir(&payload).unwrap();
        fs::write(payload.join("segment"), b"xlog bytes").unwrap();

        let mut opts = common(dir.path());
        opts.tools.not_nice = true;
        opts.backup_tools.shell_path = "sh".into();
        let run = BackupRun::prepare(&opts).unwrap();

        let argv = xlog_tar_argv(&run, &[payload.as_path()]);
        let produced = make_archive(&run, "xlog", argv).unwrap();
        assert_eq!(produced.len(), 1);

        let artifact = &produced[0];
        let source = artifact.source.as_ref().unwrap();
        assert!(source.exists());
        assert!(fs::metadata(source).unwrap().len() > 0);

        let sum_path = run.digest_sum_path(crate::digest::DigestAlgorithm::Md5, &artifact.name);
        let sum = fs::read_to_string(sum_path).unwrap();
        assert_eq!(
            sum.split_whitespace().next().unwrap(),
            crate::state::file_md5(source).unwrap()
        );
    }
}
