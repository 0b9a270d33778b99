use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A checksum algorithm the backup engine can run over its artifacts.
///
/// Each algorithm binds to the matching coreutils program (`md5sum`,
/// `sha256sum`, …) which runs as an interior node of the backup pipe tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// The external program computing this digest over stdin.
    pub fn program(self) -> String {
        format!("{}sum", self.name())
    }

    /// Parse a `--digest=a,b,…` list; names are case-insensitive and a
    /// dash is tolerated (`SHA-256`).
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mut algorithms = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let algorithm = part.parse()?;
            if !algorithms.contains(&algorithm) {
                algorithms.push(algorithm);
            }
        }
        Ok(algorithms)
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::Config(format!("unknown digest algorithm {other:?}"))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rewrite one `<alg>sum` stdin record (`<sum>  -`) into a checksum-file
/// line naming the artifact, in the format `md5sum -c` accepts.
pub fn checksum_line(sum_output: &str, filename: &str) -> Option<String> {
    let sum = sum_output.split_whitespace().next()?;
    if sum.is_empty() || !sum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("{sum}  {filename}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lists() {
        let algorithms = DigestAlgorithm::parse_list("MD5,SHA-256").unwrap();
        assert_eq!(
            algorithms,
            vec![DigestAlgorithm::Md5, DigestAlgorithm::Sha256]
        );

        let deduped = DigestAlgorithm::parse_list("md5, md5").unwrap();
        assert_eq!(deduped, vec![DigestAlgorithm::Md5]);

        assert!(DigestAlgorithm::parse_list("crc32").is_err());
    }

    #[test]
    fn programs() {
        assert_eq!(DigestAlgorithm::Md5.program(), "md5sum");
        assert_eq!(DigestAlgorithm::Sha256.program(), "sha256sum");
    }

    #[test]
    fn checksum_lines() {
        let line =
            checksum_line("d41d8cd98f00b204e9800998ecf8427e  -\n", "db1-data.tar.gz").unwrap();
        assert_eq!(line, "d41d8cd98f00b204e9800998ecf8427e  db1-data.tar.gz\n");

        assert_eq!(checksum_line("", "x"), None);
        assert_eq!(checksum_line("not-a-sum  -", "x"), None);
    }
}
