//! HTML page templates with `{{key}}` / `{key}` placeholders.

use crate::error::{PortalError, PortalResult};
use std::path::{Path, PathBuf};

/// Loads templates from a directory on every render.
#[derive(Debug, Clone)]
pub struct Templates {
    root: PathBuf,
}

impl Templates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read `name` from the template directory and substitute `vars`.
    ///
    /// A missing or unreadable template is an error; an empty page is never
    /// returned in its place.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> PortalResult<String> {
        let path = self.root.join(name);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| PortalError::Template(format!("{}: {e}", path.display())))?;
        Ok(substitute(&content, vars))
    }
}

/// Replace `{{key}}` and then `{key}` for every variable.
pub fn substitute(content: &str, vars: &[(&str, &str)]) -> String {
    let mut out = content.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
