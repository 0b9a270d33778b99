use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, IoResultExt, Result};

/// Every WAL segment is exactly 16 MiB.
pub const SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Length of a plain segment name: `<timeline:8><series:8><offset:8>`.
pub const SEGMENT_NAME_LEN: usize = 24;

/// What a file name in the WAL namespace denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalFileKind {
    /// A 16 MiB segment, 24 hex characters.
    Segment,
    /// `<segment>.<offset:8>.backup`, small ASCII sentinel.
    BackupMarker,
    /// `<timeline:8>.history`, small ASCII timeline history.
    History,
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Classify `name`, or `None` when it does not belong to the WAL namespace.
pub fn classify(name: &str) -> Option<WalFileKind> {
    if name.len() == SEGMENT_NAME_LEN && is_hex(name) {
        return Some(WalFileKind::Segment);
    }

    if let Some(rest) = name.strip_suffix(".backup") {
        if rest.len() != SEGMENT_NAME_LEN + 9 {
            return None;
        }
        let (seg, offset) = rest.split_at(SEGMENT_NAME_LEN);
        if is_hex(seg) && offset.starts_with('.') && is_hex(&offset[1..]) {
            return Some(WalFileKind::BackupMarker);
        }
        return None;
    }

    if let Some(timeline) = name.strip_suffix(".history") {
        if timeline.len() == 8 && is_hex(timeline) {
            return Some(WalFileKind::History);
        }
    }

    None
}

/// Verify that a file claiming to be a plain segment really is one.
///
/// Backup markers and history files share the namespace but are small, so
/// the size check applies to 24-character names only.
pub fn verify_segment_file(name: &str, path: &Path) -> Result<WalFileKind> {
    let kind = classify(name)
        .ok_or_else(|| Error::Precondition(format!("{name} is not a WAL file name")))?;

    if kind == WalFileKind::Segment {
        let meta = fs::metadata(path).at(path)?;
        if meta.len() != SEGMENT_SIZE {
            return Err(Error::Precondition(format!(
                "segment {name} is {} bytes, expected {SEGMENT_SIZE}",
                meta.len()
            )));
        }
    }

    Ok(kind)
}

/// A WAL location as PostgreSQL prints it: `<series>/<offset>` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Lsn {
    pub series: u32,
    pub offset: u32,
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |part| u32::from_str_radix(part, 16).ok();
        s.split_once('/')
            .and_then(|(series, offset)| {
                Some(Lsn {
                    series: parse(series)?,
                    offset: parse(offset)?,
                })
            })
            .ok_or_else(|| Error::Precondition(format!("cannot parse WAL location {s:?}")))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.series, self.offset)
    }
}

impl Lsn {
    /// Name of the segment containing this location on `timeline`.
    pub fn segment_name(&self, timeline: u32) -> String {
        format!("{:08X}{:08X}{:08X}", timeline, self.series, self.offset >> 24)
    }

    /// Byte offset of this location within its segment.
    pub fn offset_in_segment(&self) -> u32 {
        self.offset & 0x00FF_FFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_segments() {
        assert_eq!(
            classify("000000010000000000000001"),
            Some(WalFileKind::Segment)
        );
        assert_eq!(
            classify("0000000A0000000F000000FF"),
            Some(WalFileKind::Segment)
        );
        assert_eq!(classify("00000001000000000000000g"), None);
        assert_eq!(classify("00000001000000000000001"), None);
        assert_eq!(classify("0000000100000000000000012"), None);
    }

    #[test]
    fn classifies_markers_and_history() {
        assert_eq!(
            classify("000000010000000000000001.00000028.backup"),
            Some(WalFileKind::BackupMarker)
        );
        assert_eq!(classify("000000010000000000000001.0000028.backup"), None);
        assert_eq!(classify("00000002.history"), Some(WalFileKind::History));
        assert_eq!(classify("2.history"), None);
        assert_eq!(classify("recovery.conf"), None);
    }

    #[test]
    fn segment_names_order_lexicographically() {
        let older = "000000010000000000000001";
        let newer = "000000010000000000000010";
        let next_timeline = "000000020000000000000001";
        assert!(older < newer);
        assert!(newer < next_timeline);
    }

    #[test]
    fn lsn_round_trip() {
        let lsn: Lsn = "0/5000028".parse().unwrap();
        assert_eq!(lsn.series, 0);
        assert_eq!(lsn.offset, 0x500_0028);
        assert_eq!(lsn.to_string(), "0/5000028");

        assert!("garbage".parse::<Lsn>().is_err());
        assert!("0/zz".parse::<Lsn>().is_err());
    }

    #[test]
    fn segment_name_formula() {
        let lsn: Lsn = "0/5000028".parse().unwrap();
        assert_eq!(lsn.segment_name(1), "000000010000000000000005");
        assert_eq!(lsn.offset_in_segment(), 0x28);

        let lsn: Lsn = "2/FF123456".parse().unwrap();
        assert_eq!(lsn.segment_name(0x1A), "0000001A00000002000000FF");
        assert_eq!(lsn.offset_in_segment(), 0x123456);
    }

    #[test]
    fn segment_size_is_checked() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("000000010000000000000001");
        fs::write(&path, b"short").unwrap();

        let err = verify_segment_file("000000010000000000000001", &path).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let marker = dir.path().join("000000010000000000000001.00000028.backup");
        fs::write(&marker, b"START WAL LOCATION: 0/5000028\n").unwrap();
        assert_eq!(
            verify_segment_file(
                "000000010000000000000001.00000028.backup",
                &marker
            )
            .unwrap(),
            WalFileKind::BackupMarker
        );
    }
}
