use std::path::PathBuf;

use clap::Args;

/// External program paths shared by every subcommand that shells out.
///
/// Flattened into each subcommand's options so the flags read as
/// `--gzip-path`, `--rsync-path` and so on.
#[derive(Debug, Clone, Args)]
pub struct ToolOptions {
    #[arg(long = "gzip-path", default_value = "gzip")]
    pub gzip_path: String,

    #[arg(long = "bzip2-path", default_value = "bzip2")]
    pub bzip2_path: String,

    #[arg(long = "lzma-path", default_value = "lzma")]
    pub lzma_path: String,

    #[arg(long = "rsync-path", default_value = "rsync")]
    pub rsync_path: String,

    #[arg(long = "nice-path", default_value = "nice")]
    pub nice_path: String,

    /// Run compressors and tar directly instead of under nice.
    #[arg(long = "not-nice")]
    pub not_nice: bool,
}

/// Programs only the backup engine needs.
#[derive(Debug, Clone, Args)]
pub struct BackupToolOptions {
    #[arg(long = "tar-path", default_value = "tar")]
    pub tar_path: String,

    #[arg(long = "tee-path", default_value = "tee")]
    pub tee_path: String,

    #[arg(long = "shell-path", default_value = "bash")]
    pub shell_path: String,

    #[arg(long = "ssh-path", default_value = "ssh")]
    pub ssh_path: String,

    /// cat equivalent invoked on the remote side of a direct destination.
    #[arg(long = "remote-cat-path", default_value = "cat")]
    pub remote_cat_path: String,

    #[arg(long = "psql-path", default_value = "psql")]
    pub psql_path: String,

    #[arg(long = "pgcontroldata-path", default_value = "pg_controldata")]
    pub pgcontroldata_path: String,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            gzip_path: "gzip".into(),
            bzip2_path: "bzip2".into(),
            lzma_path: "lzma".into(),
            rsync_path: "rsync".into(),
            nice_path: "nice".into(),
            not_nice: false,
        }
    }
}

impl Default for BackupToolOptions {
    fn default() -> Self {
        Self {
            tar_path: "tar".into(),
            tee_path: "tee".into(),
            shell_path: "bash".into(),
            ssh_path: "ssh".into(),
            remote_cat_path: "cat".into(),
            psql_path: "psql".into(),
            pgcontroldata_path: "pg_controldata".into(),
        }
    }
}

/// Process-scoped configuration built once at startup and threaded through
/// every component explicitly.
pub struct Context {
    pub temp_dir: PathBuf,
    pub tools: ToolOptions,
    pub backup_tools: BackupToolOptions,
}

impl Context {
    pub fn new(temp_dir: PathBuf, tools: ToolOptions) -> Self {
        Self {
            temp_dir,
            tools,
            backup_tools: BackupToolOptions::default(),
        }
    }

    pub fn with_backup_tools(mut self, backup_tools: BackupToolOptions) -> Self {
        self.backup_tools = backup_tools;
        self
    }

    /// Prefix an argv with nice unless `--not-nice` was given.
    pub fn nice(&self, argv: Vec<String>) -> Vec<String> {
        if self.tools.not_nice {
            return argv;
        }

        let mut wrapped = Vec::with_capacity(argv.len() + 1);
        wrapped.push(self.tools.nice_path.clone());
        wrapped.extend(argv);
        wrapped
    }
}
