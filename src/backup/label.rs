use chrono::{DateTime, Local};

use crate::error::{Error, Result};
use crate::wal::Lsn;

use super::BACKUP_LABEL;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

/// One `KEY: X/Y (file NAME)` line out of a backup_label or `.backup`
/// sentinel. The file part is optional; pg_stop_backup output lacks it.
pub fn parse_wal_line(content: &str, key: &str) -> Result<(Lsn, Option<String>)> {
    let line = content
        .lines()
        .find(|line| line.starts_with(key))
        .ok_or_else(|| Error::Precondition(format!("no {key:?} line in backup metadata")))?;

    let rest = line[key.len()..].trim_start_matches(':').trim();
    let (location, file_part) = match rest.split_once(' ') {
        Some((location, tail)) => (location, Some(tail)),
        None => (rest, None),
    };
    let lsn: Lsn = location.parse()?;

    let file = file_part.and_then(|tail| {
        let tail = tail.trim();
        tail.strip_prefix("(file ")
            .and_then(|inner| inner.strip_suffix(')'))
            .map(str::to_string)
    });

    Ok((lsn, file))
}

/// Name of the `.backup` sentinel PostgreSQL would have written for a
/// backup starting at `start`.
pub fn backup_marker_name(start: Lsn, timeline: u32) -> String {
    format!(
        "{}.{:08X}.backup",
        start.segment_name(timeline),
        start.offset_in_segment()
    )
}

/// Synthesized backup_label for a hot-standby backup that never talked to
/// the primary.
pub fn synthesize_label(
    start: Lsn,
    stop: Lsn,
    checkpoint: Lsn,
    timeline: u32,
    start_time: DateTime<Local>,
    stop_time: DateTime<Local>,
) -> String {
    format!(
        "START WAL LOCATION: {start} (file {})\n\
         STOP WAL LOCATION: {stop} (file {})\n\
         CHECKPOINT LOCATION: {checkpoint}\n\
         START TIME: {}\n\
         STOP TIME: {}\n\
         LABEL: {BACKUP_LABEL}\n",
        start.segment_name(timeline),
        stop.segment_name(timeline),
        start_time.format(TIME_FORMAT),
        stop_time.format(TIME_FORMAT),
    )
}

/// Content of the `.backup` marker dropped next to the collected xlogs.
pub fn synthesize_marker(
    start: Lsn,
    stop: Lsn,
    checkpoint: Lsn,
    timeline: u32,
    start_time: DateTime<Local>,
    stop_time: DateTime<Local>,
) -> String {
    synthesize_label(start, stop, checkpoint, timeline, start_time, stop_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SENTINEL: &str = "\
START WAL LOCATION: 0/2000020 (file 000000010000000000000002)
STOP WAL LOCATION: 0/260000B8 (file 000000010000000000000026)
CHECKPOINT LOCATION: 0/2000058
START TIME: 2013-05-06 13:57:32 CEST
LABEL: omnipitr
";

    #[test]
    fn parses_location_lines() {
        let (lsn, file) = parse_wal_line(SENTINEL, "STOP WAL LOCATION").unwrap();
        assert_eq!(lsn.to_string(), "0/260000B8");
        assert_eq!(file.as_deref(), Some("000000010000000000000026"));

        let (lsn, file) = parse_wal_line(SENTINEL, "CHECKPOINT LOCATION").unwrap();
        assert_eq!(lsn.to_string(), "0/2000058");
        assert_eq!(file, None);

        assert!(parse_wal_line(SENTINEL, "MISSING KEY").is_err());
    }

    #[test]
    fn bare_lsn_from_pg_stop_backup() {
        let (lsn, file) = parse_wal_line("0/260000B8", "").unwrap();
        assert_eq!(lsn.to_string(), "0/260000B8");
        assert_eq!(file, None);
    }

    #[test]
    fn marker_names() {
        let start: Lsn = "0/2000020".parse().unwrap();
        assert_eq!(
            backup_marker_name(start, 1),
            "000000010000000000000002.00000020.backup"
        );
    }

    #[test]
    fn synthesized_label_shape() {
        let start: Lsn = "0/5000020".parse().unwrap();
        let stop: Lsn = "0/5F00000".parse().unwrap();
        let checkpoint: Lsn = "0/5000058".parse().unwrap();
        let at = Local.with_ymd_and_hms(2013, 5, 6, 13, 57, 32).unwrap();

        let label = synthesize_label(start, stop, checkpoint, 1, at, at);
        let lines: Vec<&str> = label.lines().collect();
        assert_eq!(
            lines[0],
            "START WAL LOCATION: 0/5000020 (file 000000010000000000000005)"
        );
        assert_eq!(
            lines[1],
            "STOP WAL LOCATION: 0/5F00000 (file 000000010000000000000005)"
        );
        assert_eq!(lines[2], "CHECKPOINT LOCATION: 0/5000058");
        assert!(lines[3].starts_with("START TIME: 2013-05-06 13:57:32"));
        assert!(lines[4].starts_with("STOP TIME: "));
        assert_eq!(lines[5], "LABEL: OmniPITR_Slave_Hot_Backup");

        // Round-trips through the sentinel parser.
        let (parsed, file) = parse_wal_line(&label, "START WAL LOCATION").unwrap();
        assert_eq!(parsed, start);
        assert_eq!(file.as_deref(), Some("000000010000000000000005"));
    }
}
