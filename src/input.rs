//! Command input from a file or stdin.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

/// Read `path` to a string, or stdin when `path` is `-`. `what` names the
/// input in error messages.
pub fn read_input(path: &Path, what: &str) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .with_context(|| format!("Failed to read {} from stdin", what))?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}: {}", what, path.display()))
    }
}
