use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Current UTC wall-clock time without a zone, the form used in every record.
///
/// This is the single timestamp source for sessions, changesets and archive names.
pub fn utc_now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn iso_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(ISO_FORMAT).to_string()
}

pub fn parse_iso_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("invalid timestamp: {raw}"))
}

/// Render a byte count the way operators read it in status lines.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[0])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}
