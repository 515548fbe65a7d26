//! Line-oriented reader for the `macro { ... }` block of a foomuuri config
//!
//! File format:
//! ```text
//! macro {
//!     # comment
//!     QOS_IF_WAN_NAME "eth0"
//!     QOS_IF_WAN_IFB  'ifb0'
//!     QOS_SERVICE_LIST VOIP   # bare token, comment stripped
//! }
//! ```
//!
//! Only lines inside the block are considered. A later definition of the
//! same name replaces an earlier one.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use qosmgr_common::{QosMgrError, QosMgrResult};
use regex::Regex;
use tracing::{debug, info};

/// Macro name to raw value
pub type RawMacroMap = BTreeMap<String, String>;

/// `NAME "value"`, `NAME 'value'` or `NAME token`
static MACRO_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*([A-Za-z0-9_]+)\s+(?:"([^"]*)"|'([^']*)'|([^\s#]+))"#)
        .expect("Invalid regex pattern")
});

const COMMENT_MARKER: char = '#';

/// Classification of one source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineToken {
    /// `macro {`
    BlockStart,
    /// `}`
    BlockEnd,
    /// A `NAME value` pair
    Macro { name: String, value: String },
    /// Blank, comment, or anything else
    Ignored,
}

/// Classifies a single line without regard to block state.
pub fn tokenize_line(line: &str) -> LineToken {
    let line = line.trim();

    if line.to_lowercase().starts_with("macro {") {
        return LineToken::BlockStart;
    }
    if line == "}" {
        return LineToken::BlockEnd;
    }
    if line.is_empty() || line.starts_with(COMMENT_MARKER) {
        return LineToken::Ignored;
    }

    match MACRO_LINE_RE.captures(line) {
        Some(caps) => {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            LineToken::Macro {
                name: caps[1].to_string(),
                value,
            }
        }
        None => LineToken::Ignored,
    }
}

/// Extracts every macro defined inside `macro { ... }` blocks.
pub fn parse_macros(content: &str) -> RawMacroMap {
    let mut macros = RawMacroMap::new();
    let mut in_block = false;

    for (line_num, line) in content.lines().enumerate() {
        match tokenize_line(line) {
            LineToken::BlockStart => in_block = true,
            LineToken::BlockEnd => in_block = false,
            LineToken::Macro { name, value } if in_block => {
                debug!(line = line_num + 1, name = %name, value = %value, "Macro read");
                macros.insert(name, value);
            }
            _ => {}
        }
    }

    macros
}

/// Reads and parses the policy file at `path`.
///
/// # Errors
///
/// [`QosMgrError::SourceUnreadable`] if the file is missing, unreadable, or
/// not valid UTF-8.
pub fn read_macro_file(path: &Path) -> QosMgrResult<RawMacroMap> {
    info!("Reading QoS macros from {}", path.display());

    let content =
        std::fs::read_to_string(path).map_err(|e| QosMgrError::source_unreadable(path, e))?;

    let macros = parse_macros(&content);
    debug!("Read {} macros from {}", macros.len(), path.display());
    Ok(macros)
}
