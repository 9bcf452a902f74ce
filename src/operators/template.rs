// src/operators/template.rs

//! Logical-date templating for source locations and SQL text.
//!
//! Supported placeholders:
//! - `{ds}`        → `2018-11-05`
//! - `{ds_nodash}` → `20181105`
//! - `{year}`      → `2018`
//! - `{month}`     → `11`
//! - `{day}`       → `05`

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::{Captures, Regex};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
});

pub const PLACEHOLDERS: &[&str] = &["ds", "ds_nodash", "year", "month", "day"];

/// Return the first placeholder in `template` that is not supported.
pub fn unknown_placeholder(template: &str) -> Option<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .find(|name| !PLACEHOLDERS.contains(&name.as_str()))
}

/// Substitute every supported placeholder with the value for `date`.
///
/// Unknown placeholders are left untouched; config validation rejects them
/// before anything gets this far.
pub fn render(template: &str, date: NaiveDate) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "ds" => date.format("%Y-%m-%d").to_string(),
            "ds_nodash" => date.format("%Y%m%d").to_string(),
            "year" => format!("{:04}", date.year()),
            "month" => format!("{:02}", date.month()),
            "day" => format!("{:02}", date.day()),
            _ => caps[0].to_string(),
        })
        .into_owned()
}
