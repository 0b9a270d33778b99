use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};

use log::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::wal::Lsn;

pub const REDO_LOCATION: &str = "Latest checkpoint's REDO location";
pub const CHECKPOINT_LOCATION: &str = "Latest checkpoint location";
pub const TIMELINE_ID: &str = "Latest checkpoint's TimeLineID";
pub const MIN_RECOVERY_LOCATION: &str = "Minimum recovery ending location";

/// Parsed `pg_controldata` output.
///
/// All keys are retained; only the four above are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlData {
    fields: BTreeMap<String, String>,
}

impl ControlData {
    /// Run `pg_controldata` against `data_dir` and parse its output.
    ///
    /// The locale is pinned to C so field names match on any server.
    pub fn read(ctx: &Context, data_dir: &Path) -> Result<Self> {
        let program = &ctx.backup_tools.pgcontroldata_path;
        debug!("running {program} on {}", data_dir.display());

        let out = Command::new(program)
            .arg(data_dir)
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::external(program, e.to_string()))?;

        if !out.status.success() {
            return Err(Error::external(
                program,
                format!(
                    "exit {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            ));
        }

        Ok(Self::parse(&String::from_utf8_lossy(&out.stdout)))
    }

    /// Parse `KEY: VALUE` lines; lines without a colon are skipped.
    pub fn parse(text: &str) -> Self {
        let mut fields = BTreeMap::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::Precondition(format!("pg_controldata output lacks {key:?}")))
    }

    pub fn redo_location(&self) -> Result<Lsn> {
        self.get(REDO_LOCATION)?.parse()
    }

    pub fn checkpoint_location(&self) -> Result<Lsn> {
        self.get(CHECKPOINT_LOCATION)?.parse()
    }

    pub fn timeline_id(&self) -> Result<u32> {
        let raw = self.get(TIMELINE_ID)?;
        raw.parse()
            .map_err(|_| Error::Precondition(format!("bad timeline id {raw:?}")))
    }

    /// Present on standbys; `0/0` means the field is unset.
    pub fn min_recovery_location(&self) -> Option<Lsn> {
        let lsn: Lsn = self.fields.get(MIN_RECOVERY_LOCATION)?.parse().ok()?;
        if lsn == (Lsn { series: 0, offset: 0 }) {
            return None;
        }
        Some(lsn)
    }

    /// Name of the segment holding the latest checkpoint's REDO record;
    /// no segment at or past this name may be garbage-collected.
    pub fn redo_segment_name(&self) -> Result<String> {
        Ok(self.redo_location()?.segment_name(self.timeline_id()?))
    }
}
