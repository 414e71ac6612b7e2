//! Selection of the shared libraries whose imports get hooked.

use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};

/// File name of the shared object this engine is built into.  Never hooked.
pub const SELF_LIBRARY: &str = "libmalloc_attrib.so";

#[derive(Debug, Clone)]
pub struct LibraryFilter {
    // `None` matches every library.
    pattern: Option<Regex>,
}

impl LibraryFilter {
    pub fn all() -> Self {
        LibraryFilter { pattern: None }
    }

    /// Compile `pattern`.  The whole base name must match; a missing or empty pattern
    /// selects every library.
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        let pattern = match pattern {
            None => return Ok(Self::all()),
            Some(p) if p.is_empty() => return Ok(Self::all()),
            Some(p) => p,
        };
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
            Error::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(LibraryFilter {
            pattern: Some(regex),
        })
    }

    pub fn matches_all(&self) -> bool {
        self.pattern.is_none()
    }

    /// Pattern test against the base name of `path`, without the shared-object checks.
    pub fn matches(&self, path: &str) -> bool {
        match &self.pattern {
            None => true,
            Some(regex) => regex.is_match(base_name(path)),
        }
    }

    /// Whether the library at `path` should have its allocator imports redirected.
    ///
    /// Objects without a `.so` name (the main executable, the vDSO) and the engine's own
    /// library are never eligible.
    pub fn is_eligible(&self, path: &str) -> bool {
        if !is_shared_object(path) || is_self(path) {
            return false;
        }
        self.matches(path)
    }
}

pub fn base_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

// `libfoo.so` and versioned `libfoo.so.6`.
fn is_shared_object(path: &str) -> bool {
    let name = base_name(path);
    name.len() > 3 && (name.ends_with(".so") || name.contains(".so."))
}

fn is_self(path: &str) -> bool {
    base_name(path) == SELF_LIBRARY
}
