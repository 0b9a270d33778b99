pub mod label;
pub mod master;
pub mod slave;
pub mod tarball;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Local};
use clap::Args;
use log::{debug, info};

use crate::compression::Compression;
use crate::context::{BackupToolOptions, Context, ToolOptions};
use crate::destination::{split_remote, Destination, DestinationKind};
use crate::digest::{checksum_line, DigestAlgorithm};
use crate::error::{Error, IoResultExt, Result};
use crate::parallel::{Job, ParallelRun};
use crate::pipetree::shell_quote;
use crate::template::{FilenameTemplate, DEFAULT_TEMPLATE};

/// How long to wait for a WAL-related file before giving up.
pub const FILE_WAIT_LIMIT: Duration = Duration::from_secs(3600);
const FILE_WAIT_STEP: Duration = Duration::from_secs(1);

/// Label passed to pg_start_backup and written into synthesized labels.
pub const BACKUP_LABEL: &str = "OmniPITR_Slave_Hot_Backup";

/// Options shared by both backup modes.
#[derive(Debug, Args)]
pub struct CommonOptions {
    #[arg(long = "data-dir", default_value = ".")]
    pub data_dir: PathBuf,

    /// Local directory destination, optionally `CMP=path`. Repeatable.
    #[arg(long = "dst-local")]
    pub dst_local: Vec<String>,

    /// Remote rsync destination `[CMP=][user@]host:/path`. Repeatable.
    #[arg(long = "dst-remote")]
    pub dst_remote: Vec<String>,

    /// Remote path streamed to through ssh inside the pipe tree. Repeatable.
    #[arg(long = "dst-direct")]
    pub dst_direct: Vec<String>,

    /// Program receiving each artifact name as argument, bytes on stdin.
    #[arg(long = "dst-pipe")]
    pub dst_pipe: Vec<String>,

    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long = "filename-template", default_value = DEFAULT_TEMPLATE)]
    pub filename_template: String,

    /// Checksum algorithms, comma separated (`md5,sha256`).
    #[arg(long = "digest")]
    pub digest: Option<String>,

    /// Produce the data archive only.
    #[arg(long = "skip-xlogs")]
    pub skip_xlogs: bool,

    #[arg(long = "parallel-jobs", default_value_t = 1)]
    pub parallel_jobs: usize,

    #[arg(long = "database", default_value = "postgres")]
    pub database: String,

    #[arg(long = "host")]
    pub host: Option<String>,

    #[arg(long = "port")]
    pub port: Option<u16>,

    #[arg(long = "username")]
    pub username: Option<String>,

    #[command(flatten)]
    pub tools: ToolOptions,

    #[command(flatten)]
    pub backup_tools: BackupToolOptions,
}

/// psql invocation bound to one server.
#[derive(Debug, Clone)]
pub struct Psql {
    path: String,
    database: String,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
}

impl Psql {
    pub fn from_options(opts: &CommonOptions) -> Self {
        Self {
            path: opts.backup_tools.psql_path.clone(),
            database: opts.database.clone(),
            host: opts.host.clone(),
            port: opts.port,
            username: opts.username.clone(),
        }
    }

    /// Run one statement, returning trimmed stdout. Any psql failure is
    /// fatal for the backup.
    pub fn run(&self, sql: &str) -> Result<String> {
        let mut command = Command::new(&self.path);
        command.args(["-qAtX", "-d", &self.database, "-c", sql]);
        if let Some(host) = &self.host {
            command.args(["-h", host]);
        }
        if let Some(port) = self.port {
            command.args(["-p", &port.to_string()]);
        }
        if let Some(username) = &self.username {
            command.args(["-U", username]);
        }

        debug!("psql: {sql}");
        let out = command
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::external(&self.path, e.to_string()))?;
        if !out.status.success() {
            return Err(Error::external(
                &self.path,
                format!(
                    "{sql:?} exited {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

/// One artifact the pipe tree produced. `source` is the local copy used
/// for the rsync fan-out; artifacts consumed only by pipe or direct
/// destinations have none.
#[derive(Debug)]
pub struct Produced {
    pub name: String,
    pub source: Option<PathBuf>,
    pub compression: Compression,
}

/// Everything a backup run needs, built up front so configuration errors
/// surface before any side effect.
pub struct BackupRun {
    pub ctx: Context,
    pub data_dir: PathBuf,
    pub destinations: Vec<Destination>,
    pub template: FilenameTemplate,
    pub digests: Vec<DigestAlgorithm>,
    pub started_at: DateTime<Local>,
    pub work_dir: PathBuf,
    pub parallel_jobs: usize,
    pub psql: Psql,
    pub skip_xlogs: bool,
}

impl BackupRun {
    pub fn prepare(common: &CommonOptions) -> Result<Self> {
        let mut destinations = Vec::new();
        for spec in &common.dst_local {
            destinations.push(Destination::local(spec)?);
        }
        for spec in &common.dst_remote {
            destinations.push(Destination::remote(spec)?);
        }
        for spec in &common.dst_direct {
            destinations.push(Destination::direct(spec)?);
        }
        for spec in &common.dst_pipe {
            destinations.push(Destination::pipe(spec)?);
        }
        if destinations.is_empty() {
            return Err(Error::Config("no backup destination given".into()));
        }

        let template = FilenameTemplate::new(&common.filename_template)?;
        let digests = match &common.digest {
            Some(list) => DigestAlgorithm::parse_list(list)?,
            None => Vec::new(),
        };

        let temp_base = common.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let work_dir = temp_base.join(format!("omnipitr-backup-{}", std::process::id()));
        fs::create_dir_all(work_dir.join("spool")).at(&work_dir)?;
        fs::create_dir_all(work_dir.join("sums")).at(&work_dir)?;

        let ctx = Context::new(work_dir.clone(), common.tools.clone())
            .with_backup_tools(common.backup_tools.clone());

        Ok(Self {
            ctx,
            data_dir: common.data_dir.clone(),
            destinations,
            template,
            digests,
            started_at: Local::now(),
            work_dir,
            parallel_jobs: common.parallel_jobs,
            psql: Psql::from_options(common),
            skip_xlogs: common.skip_xlogs,
        })
    }

    pub fn artifact_name(&self, filetype: &str, compression: Compression) -> Result<String> {
        self.template
            .render(filetype, compression.extension(), self.started_at)
    }

    /// Ship `produced` to every remote destination through the parallel
    /// rsync fan-out; local, direct and pipe destinations were already
    /// served by the pipe tree.
    pub fn deliver_to_remote_destinations(&self, produced: &[Produced]) -> Result<()> {
        let mut pool = ParallelRun::new(self.parallel_jobs);
        let mut queued = 0;
        for destination in &self.destinations {
            if destination.kind != DestinationKind::Remote {
                continue;
            }
            for artifact in produced {
                if artifact.compression != destination.compression {
                    continue;
                }
                let Some(source) = &artifact.source else {
                    continue;
                };
                let target = format!(
                    "{}/{}",
                    destination.path.trim_end_matches('/'),
                    artifact.name
                );
                pool.push(
                    Job::new([
                        self.ctx.tools.rsync_path.clone(),
                        "-t".to_string(),
                        source.to_string_lossy().into_owned(),
                        target.clone(),
                    ])
                    .tagged(target),
                );
                queued += 1;
            }
        }
        if queued == 0 {
            return Ok(());
        }

        info!("delivering {queued} artifact(s) to remote destinations");
        let jobs = pool.run()?;
        for job in &jobs {
            if !job.success() {
                return Err(Error::external(
                    self.ctx.tools.rsync_path.clone(),
                    format!(
                        "delivery to {} failed: {}",
                        job.tag,
                        job.stderr.as_deref().unwrap_or("").trim()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Assemble one checksum file per configured algorithm covering every
    /// produced artifact, then hand each file to every destination.
    pub fn finish_digests(&self, produced: &[Produced]) -> Result<()> {
        if self.digests.is_empty() {
            return Ok(());
        }

        let mut digest_files = Vec::new();
        for algorithm in &self.digests {
            let mut content = String::new();
            for artifact in produced {
                let sum_path = self.digest_sum_path(*algorithm, &artifact.name);
                let raw = fs::read_to_string(&sum_path).at(&sum_path)?;
                let line = checksum_line(&raw, &artifact.name).ok_or_else(|| {
                    Error::external(algorithm.program(), format!("unparsable output {raw:?}"))
                })?;
                content.push_str(&line);
            }

            let name = self.artifact_name(algorithm.name(), Compression::None)?;
            let path = self.work_dir.join("spool").join(&name);
            fs::write(&path, content).at(&path)?;
            digest_files.push((name, path));
        }

        let mut pool = ParallelRun::new(self.parallel_jobs);
        let mut queued = 0;
        for destination in &self.destinations {
            for (name, path) in &digest_files {
                match destination.kind {
                    DestinationKind::Local => {
                        let target = Path::new(&destination.path).join(name);
                        fs::copy(path, &target).at(&target)?;
                    }
                    DestinationKind::Remote => {
                        let target = format!(
                            "{}/{name}",
                            destination.path.trim_end_matches('/')
                        );
                        pool.push(
                            Job::new([
                                self.ctx.tools.rsync_path.clone(),
                                "-t".to_string(),
                                path.to_string_lossy().into_owned(),
                                target.clone(),
                            ])
                            .tagged(target),
                        );
                        queued += 1;
                    }
                    DestinationKind::Direct => {
                        let (host, remote_path) = split_remote(&destination.path)
                            .expect("validated at parse time");
                        pool.push(
                            Job::new([
                                self.ctx.backup_tools.ssh_path.clone(),
                                host.to_string(),
                                format!(
                                    "{} > {}",
                                    self.ctx.backup_tools.remote_cat_path,
                                    shell_quote(&format!(
                                        "{}/{name}",
                                        remote_path.trim_end_matches('/')
                                    ))
                                ),
                            ])
                            .stdin_from(path)
                            .tagged(name.clone()),
                        );
                        queued += 1;
                    }
                    DestinationKind::Pipe => {
                        pool.push(
                            Job::new([destination.path.clone(), name.clone()])
                                .stdin_from(path)
                                .tagged(name.clone()),
                        );
                        queued += 1;
                    }
                }
            }
        }

        if queued > 0 {
            let jobs = pool.run()?;
            for job in &jobs {
                if !job.success() {
                    return Err(Error::external(
                        job.argv.first().cloned().unwrap_or_default(),
                        format!("digest delivery of {} failed", job.tag),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn digest_sum_path(&self, algorithm: DigestAlgorithm, artifact_name: &str) -> PathBuf {
        self.work_dir
            .join("sums")
            .join(format!("{}-{artifact_name}", algorithm.name()))
    }

    /// Drop the run's temp tree; called on the success path only, so a
    /// failed backup leaves its intermediates for inspection.
    pub fn cleanup(&self) -> Result<()> {
        fs::remove_dir_all(&self.work_dir).at(&self.work_dir)
    }
}

/// Poll `dir` once a second until `predicate` matches an entry name.
/// Exceeding the one-hour ceiling is fatal.
pub fn wait_for_file(
    dir: &Path,
    what: &str,
    mut predicate: impl FnMut(&str) -> bool,
) -> Result<PathBuf> {
    let mut waited = Duration::ZERO;
    loop {
        if dir.exists() {
            let mut names: Vec<String> = fs::read_dir(dir)
                .at(dir)?
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| predicate(name))
                .collect();
            names.sort();
            if let Some(name) = names.into_iter().next() {
                return Ok(dir.join(name));
            }
        }

        if waited >= FILE_WAIT_LIMIT {
            return Err(Error::WaitTimeout {
                what: what.to_string(),
                limit: FILE_WAIT_LIMIT,
            });
        }
        std::thread::sleep(FILE_WAIT_STEP);
        waited += FILE_WAIT_STEP;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn common(dir: &Path) -> CommonOptions {
        CommonOptions {
            data_dir: dir.into(),
            dst_local: vec![dir.join("out").to_string_lossy().into_owned()],
            dst_remote: Vec::new(),
            dst_direct: Vec::new(),
            dst_pipe: Vec::new(),
            temp_dir: Some(dir.join("tmp")),
            filename_template: DEFAULT_TEMPLATE.to_string(),
            digest: Some("md5".into()),
            skip_xlogs: false,
            parallel_jobs: 1,
            database: "postgres".into(),
            host: None,
            port: None,
            username: None,
            tools: ToolOptions::default(),
            backup_tools: BackupToolOptions::default(),
        }
    }

    #[test]
    fn prepare_validates_up_front() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut opts = common(dir.path());
        opts.dst_local.clear();
        assert!(matches!(
            BackupRun::prepare(&opts),
            Err(Error::Config(_))
        ));

        let mut opts = common(dir.path());
        opts.filename_template = "no-filetype.tar".into();
        assert!(matches!(
            BackupRun::prepare(&opts),
            Err(Error::Config(_))
        ));

        let mut opts = common(dir.path());
        opts.digest = Some("crc32".into());
        assert!(matches!(
            BackupRun::prepare(&opts),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn prepare_creates_the_work_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = BackupRun::prepare(&common(dir.path())).unwrap();
        assert!(run.work_dir.join("spool").is_dir());
        assert!(run.work_dir.join("sums").is_dir());
        assert_eq!(run.digests, vec![DigestAlgorithm::Md5]);
        run.cleanup().unwrap();
    }

    #[test]
    fn digest_files_cover_every_artifact() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir(dir.path().join("out")).unwrap();
        let run = BackupRun::prepare(&common(dir.path())).unwrap();

        let data_name = run.artifact_name("data", Compression::None).unwrap();
        let xlog_name = run.artifact_name("xlog", Compression::None).unwrap();
        for name in [&data_name, &xlog_name] {
            fs::write(
                run.digest_sum_path(DigestAlgorithm::Md5, name),
                "d41d8cd98f00b204e9800998ecf8427e  -\n",
            )
            .unwrap();
        }
        let produced = vec![
            Produced {
                name: data_name.clone(),
                source: Some(dir.path().join("out").join(&data_name)),
                compression: Compression::None,
            },
            Produced {
                name: xlog_name.clone(),
                source: Some(dir.path().join("out").join(&xlog_name)),
                compression: Compression::None,
            },
        ];

        run.finish_digests(&produced).unwrap();

        let digest_name = run.artifact_name("md5", Compression::None).unwrap();
        let delivered = dir.path().join("out").join(&digest_name);
        let content = fs::read_to_string(&delivered).unwrap();
        assert!(content.contains(&data_name));
        assert!(content.contains(&xlog_name));
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn wait_for_file_finds_existing_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("000000010000000000000001.00000028.backup"), "x").unwrap();
        let found = wait_for_file(dir.path(), "backup sentinel", |name| {
            name.ends_with(".backup")
        })
        .unwrap();
        assert!(found.ends_with("000000010000000000000001.00000028.backup"));
    }
}
