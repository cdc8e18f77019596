// src/naming.rs
//
// Output file names: `{name}`, `{date}` and `{format}` placeholders,
// substituted verbatim, plus the format's extension.

use crate::ops::OutputFormat;
use chrono::{DateTime, Utc};

pub const DEFAULT_TEMPLATE: &str = "{name}";

/// `output_filename("{name}-{format}", "photo", "2024-05-01", Avif)` is
/// `"photo-avif.avif"`. An empty template behaves like `{name}`.
pub fn output_filename(template: &str, stem: &str, date: &str, format: OutputFormat) -> String {
    let template = if template.is_empty() {
        DEFAULT_TEMPLATE
    } else {
        template
    };
    let mut name = template
        .replace("{name}", stem)
        .replace("{date}", date)
        .replace("{format}", format.as_str());
    name.push('.');
    name.push_str(format.extension());
    name
}

/// `YYYY-MM-DD` (UTC) for the given instant.
pub fn date_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

pub fn today() -> String {
    date_stamp(Utc::now())
}
