use std::fmt;

use crate::compression::Compression;
use crate::error::{Error, Result};

/// Where an artifact goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    /// A directory on this host.
    Local,
    /// `[user@]host:/absolute/path`, transferred with rsync.
    Remote,
    /// An external program fed the artifact on stdin.
    Pipe,
    /// A remote path written through ssh inside the backup pipe tree.
    Direct,
}

impl DestinationKind {
    /// Key under which deliveries are recorded in the state file.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Pipe => "pipe",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery target with its declared compression.
#[derive(Debug, Clone)]
pub struct Destination {
    pub kind: DestinationKind,
    pub path: String,
    pub compression: Compression,
}

/// Split the optional `CMP=` prefix off a destination or source spec.
pub fn parse_spec(spec: &str) -> (Compression, &str) {
    if let Some((prefix, rest)) = spec.split_once('=') {
        if let Ok(compression) = prefix.parse() {
            return (compression, rest);
        }
    }
    (Compression::None, spec)
}

impl Destination {
    pub fn local(spec: &str) -> Result<Self> {
        let (compression, path) = parse_spec(spec);
        if path.is_empty() {
            return Err(Error::Config(format!("empty local destination in {spec:?}")));
        }
        Ok(Self {
            kind: DestinationKind::Local,
            path: path.to_string(),
            compression,
        })
    }

    pub fn remote(spec: &str) -> Result<Self> {
        let (compression, path) = parse_spec(spec);
        split_remote(path).ok_or_else(|| {
            Error::Config(format!(
                "remote destination {spec:?} is not [user@]host:/absolute/path"
            ))
        })?;
        Ok(Self {
            kind: DestinationKind::Remote,
            path: path.to_string(),
            compression,
        })
    }

    pub fn pipe(spec: &str) -> Result<Self> {
        let (compression, path) = parse_spec(spec);
        if path.is_empty() {
            return Err(Error::Config(format!("empty pipe destination in {spec:?}")));
        }
        Ok(Self {
            kind: DestinationKind::Pipe,
            path: path.to_string(),
            compression,
        })
    }

    pub fn direct(spec: &str) -> Result<Self> {
        let parsed = Self::remote(spec)?;
        Ok(Self {
            kind: DestinationKind::Direct,
            ..parsed
        })
    }
}

/// Split `[user@]host:/absolute/path` into host part and remote path.
pub fn split_remote(path: &str) -> Option<(&str, &str)> {
    let (host, remote_path) = path.split_once(':')?;
    if host.is_empty() || !remote_path.starts_with('/') {
        return None;
    }
    Some((host, remote_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_specs() {
        let plain = Destination::local("/var/lib/wal-archive/").unwrap();
        assert_eq!(plain.compression, Compression::None);
        assert_eq!(plain.path, "/var/lib/wal-archive/");

        let gz = Destination::local("gzip=/b/").unwrap();
        assert_eq!(gz.compression, Compression::Gzip);
        assert_eq!(gz.path, "/b/");
    }

    #[test]
    fn equals_sign_in_path_is_not_a_compression() {
        let dst = Destination::local("/archive/name=odd/").unwrap();
        assert_eq!(dst.compression, Compression::None);
        assert_eq!(dst.path, "/archive/name=odd/");
    }

    #[test]
    fn remote_specs() {
        let dst = Destination::remote("bzip2=backup@vault:/srv/wal").unwrap();
        assert_eq!(dst.compression, Compression::Bzip2);
        assert_eq!(
            split_remote(&dst.path),
            Some(("backup@vault", "/srv/wal"))
        );

        assert!(Destination::remote("/not/remote").is_err());
        assert!(Destination::remote("host:relative/path").is_err());
    }

    #[test]
    fn state_keys() {
        assert_eq!(DestinationKind::Local.as_str(), "local");
        assert_eq!(DestinationKind::Remote.as_str(), "remote");
        assert_eq!(DestinationKind::Pipe.as_str(), "pipe");
    }
}
