//! Front-end breakpoint specifications to backend-addressable breakpoints.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Origin tag attached to every source produced by the adapter.
pub const SOURCE_ORIGIN: &str = "dashmips";

/// Breakpoint position as the front end sends it in `setBreakpoints`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceBreakpoint {
    pub line: i64,
    #[serde(default)]
    pub column: Option<i64>,
}

/// Displayable source descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub name: String,
    pub path: String,
    pub origin: &'static str,
}

impl Source {
    pub fn from_path(path: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        Self {
            name,
            path: path.to_string(),
            origin: SOURCE_ORIGIN,
        }
    }
}

/// Breakpoint record, sent to the backend and echoed back to the front end.
///
/// The adapter does not check feasibility, so every breakpoint is verified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakpoint {
    pub verified: bool,
    pub line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    pub source: Source,
}

/// Build one breakpoint per specification, all located in `source_path`.
pub fn translate(source_path: &str, specs: &[SourceBreakpoint]) -> Vec<Breakpoint> {
    let source = Source::from_path(source_path);
    specs
        .iter()
        .map(|spec| Breakpoint {
            verified: true,
            line: spec.line,
            column: spec.column,
            source: source.clone(),
        })
        .collect()
}
