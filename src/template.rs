use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};

use crate::error::{Error, Result};

/// User-supplied backup filename template.
///
/// Placeholders `__HOSTNAME__`, `__FILETYPE__` and `__CEXT__` are
/// substituted first; strftime escapes are written with a `^` sigil
/// (`^Y-^m-^d`) that is rewritten to `%` before expansion, keeping `%`
/// itself inert in shell-adjacent contexts.
#[derive(Debug, Clone)]
pub struct FilenameTemplate {
    raw: String,
}

pub const DEFAULT_TEMPLATE: &str = "__HOSTNAME__-__FILETYPE__-^Y-^m-^d.tar__CEXT__";

impl FilenameTemplate {
    pub fn new(raw: &str) -> Result<Self> {
        if !raw.contains("__FILETYPE__") {
            return Err(Error::Config(format!(
                "filename template {raw:?} lacks __FILETYPE__"
            )));
        }
        if raw.contains('/') || raw.contains('\\') {
            return Err(Error::Config(format!(
                "filename template {raw:?} must not contain path separators"
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    /// Expand for one artifact using the system hostname.
    pub fn render(&self, filetype: &str, cext: &str, at: DateTime<Local>) -> Result<String> {
        let hostname = hostname::get()
            .map_err(|e| Error::Config(format!("cannot determine hostname: {e}")))?;
        self.render_with(&hostname.to_string_lossy(), filetype, cext, at)
    }

    pub fn render_with(
        &self,
        hostname: &str,
        filetype: &str,
        cext: &str,
        at: DateTime<Local>,
    ) -> Result<String> {
        let filled = self
            .raw
            .replace("__HOSTNAME__", hostname)
            .replace("__FILETYPE__", filetype)
            .replace("__CEXT__", cext)
            .replace('^', "%");

        strftime(&filled, at)
    }
}

/// Apply strftime escapes, rejecting malformed ones up front instead of
/// failing inside the formatter.
fn strftime(format: &str, at: DateTime<Local>) -> Result<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.contains(&Item::Error) {
        return Err(Error::Config(format!(
            "invalid strftime escape in {format:?}"
        )));
    }
    Ok(at.format_with_items(items.into_iter()).to_string())
}
