use std::path::Path;

use crate::error::{BatchError, Result};

/// Header names recognised in the first line of a source file.
const HEADER_NAMES: &[&str] = &["url", "urls", "link", "href", "payload"];

/// Extract job payloads from the text of a source file.
///
/// One payload per line; for CSV-style lines only the first field is used.
/// Blank lines and `#` comments are skipped, and so is a header line naming
/// the column.
pub fn parse_payloads(text: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut first = true;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let field = first_field(line);
        if first {
            first = false;
            if HEADER_NAMES.contains(&field.to_ascii_lowercase().as_str()) {
                continue;
            }
        }
        if !field.is_empty() {
            payloads.push(field.to_string());
        }
    }

    payloads
}

fn first_field(line: &str) -> &str {
    let field = match line.strip_prefix('"') {
        Some(rest) => rest.split('"').next().unwrap_or(""),
        None => line.split(',').next().unwrap_or(""),
    };
    field.trim()
}

/// Read and parse a source file. An empty batch is rejected.
pub async fn load_payloads(path: &Path) -> Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| BatchError::Source(format!("{}: {}", path.display(), e)))?;

    let payloads = parse_payloads(&text);
    if payloads.is_empty() {
        return Err(BatchError::Source(format!(
            "{}: no job payloads found",
            path.display()
        )));
    }

    tracing::info!(path = %path.display(), jobs = payloads.len(), "Loaded job source");
    Ok(payloads)
}
