use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;

use filetime::FileTime;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{Error, IoResultExt, Result};
use crate::pipetree::shell_quote;

/// The compression formats a destination may declare.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
    Lzma,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Lzma => "lzma",
        }
    }

    /// File extension produced by this format, empty for `none`.
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Lzma => ".lzma",
        }
    }

    /// The external program bound to this format.
    pub fn program(self, ctx: &Context) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Gzip => Some(&ctx.tools.gzip_path),
            Self::Bzip2 => Some(&ctx.tools.bzip2_path),
            Self::Lzma => Some(&ctx.tools.lzma_path),
        }
    }

    /// Strip this format's extension from a file name.
    ///
    /// Returns `None` when the name does not carry the extension; `none`
    /// never strips anything.
    pub fn strip_extension(self, name: &str) -> Option<&str> {
        match self {
            Self::None => Some(name),
            _ => name.strip_suffix(self.extension()),
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "bzip2" => Ok(Self::Bzip2),
            "lzma" => Ok(Self::Lzma),
            other => Err(Error::Config(format!("unknown compression {other:?}"))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compress `source` into `dest` with the external program, carrying the
/// source's mtime/atime over to the artifact.
pub fn compress_file(
    ctx: &Context,
    compression: Compression,
    source: &Path,
    dest: &Path,
) -> Result<()> {
    let program = compression
        .program(ctx)
        .ok_or_else(|| Error::Config("cannot compress with type none".into()))?
        .to_string();

    debug!("compressing {} to {}", source.display(), dest.display());
    let argv = ctx.nice(vec![program.clone(), "--stdout".into()]);
    let input = File::open(source).at(source)?;
    let output = File::create(dest).at(dest)?;

    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::from(input))
        .stdout(Stdio::from(output))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::external(&program, e.to_string()))?;

    let out = child
        .wait_with_output()
        .map_err(|e| Error::external(&program, e.to_string()))?;
    if !out.status.success() {
        return Err(Error::external(
            &program,
            format!(
                "exit {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        ));
    }

    let meta = fs::metadata(source).at(source)?;
    filetime::set_file_times(
        dest,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )
    .at(dest)?;

    Ok(())
}

/// Place `source` at `dest`, decompressing when the source is compressed.
///
/// The decompressor writes through a shell redirection, so the destination
/// appears in one stream without an intermediate file.
pub fn decompress_into(
    ctx: &Context,
    compression: Compression,
    source: &Path,
    dest: &Path,
) -> Result<()> {
    let Some(program) = compression.program(ctx) else {
        fs::copy(source, dest).at(dest)?;
        return Ok(());
    };

    let line = format!(
        "{} --decompress --stdout {} > {}",
        shell_quote(program),
        shell_quote(&source.to_string_lossy()),
        shell_quote(&dest.to_string_lossy()),
    );
    debug!("decompressing: {line}");

    let shell = &ctx.backup_tools.shell_path;
    let out = Command::new(shell)
        .arg("-c")
        .arg(&line)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::external(shell, e.to_string()))?;
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

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ToolOptions;

    #[test]
    fn extensions() {
        assert_eq!(Compression::None.extension(), "");
        assert_eq!(Compression::Gzip.extension(), ".gz");
        assert_eq!(Compression::Bzip2.extension(), ".bz2");
        assert_eq!(Compression::Lzma.extension(), ".lzma");
    }

    #[test]
    fn parses_names() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("zstd".parse::<Compression>().is_err());
    }

    #[test]
    fn strips_extension() {
        assert_eq!(
            Compression::Gzip.strip_extension("000000010000000000000001.gz"),
            Some("000000010000000000000001")
        );
        assert_eq!(
            Compression::Gzip.strip_extension("000000010000000000000001"),
            None
        );
        assert_eq!(
            Compression::None.strip_extension("000000010000000000000001"),
            Some("000000010000000000000001")
        );
    }

    #[test]
    fn plain_copy_for_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"segment bytes").unwrap();

        let ctx = Context::new(dir.path().into(), ToolOptions::default());
        decompress_into(&ctx, Compression::None, &src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"segment bytes");
    }
}
