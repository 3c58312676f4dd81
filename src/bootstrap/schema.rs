//! Schema text sanitizing

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// `CREATE EXTENSION ...;` statements, which need privileges the engine lacks
///
/// Only matches at the start of a line or right after a `;`, so prose in
/// comments is left alone. The preceding `;` is captured and put back.
static CREATE_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)(^|;)\s*create\s+extension\b[^;]*;?").expect("extension pattern is valid")
});

/// Remove extension installs from schema text, leaving everything else intact
pub fn sanitize(schema: &str) -> Cow<'_, str> {
    CREATE_EXTENSION.replace_all(schema, "$1")
}
