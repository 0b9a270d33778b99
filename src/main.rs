use clap::{Parser, Subcommand};
use log::{error, info};

use omnipitr::{archive, backup, cleanup, restore};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log at debug level.
    #[arg(long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    subcommand: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Archive one WAL segment to every configured destination.
    Archive(archive::Options),
    /// Take a base backup on a primary via pg_start_backup/pg_stop_backup.
    BackupMaster(backup::master::Options),
    /// Take a base backup on a hot standby from pg_controldata snapshots.
    BackupSlave(backup::slave::Options),
    /// restore_command side: wait for, decompress and place one segment.
    Restore(restore::Options),
    /// Remove archived segments older than the checkpoint REDO pointer.
    Cleanup(cleanup::Options),
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if args.verbose {
        "debug"
    } else {
        "info"
    }))
    .init();

    let result = match &args.subcommand {
        Command::Archive(opts) => archive::run(opts),
        Command::BackupMaster(opts) => backup::master::run(opts),
        Command::BackupSlave(opts) => backup::slave::run(opts),
        Command::Restore(opts) => restore::run(opts),
        Command::Cleanup(opts) => cleanup::run(opts),
    };

    if let Err(e) = result {
        // Routine unavailability (a missing .history file) exits non-zero
        // without an error-level record.
        if e.is_quiet() {
            info!("{e}");
        } else {
            error!("{e}");
        }
        std::process::exit(1);
    }
}
