//! Output formatting utilities

use crate::OutputFormat;
use serde::Serialize;

/// Print output in the specified format
pub fn print_output<T: Serialize + std::fmt::Display>(
    value: &T,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format an optional speed limit
pub fn format_limit(bytes_per_sec: Option<u64>) -> String {
    match bytes_per_sec {
        Some(limit) if limit > 0 => format!("{}/s", format_bytes(limit)),
        _ => "Unlimited".to_string(),
    }
}

/// "received / total" with an unknown total shown as "?"
pub fn format_transfer(received: u64, total: Option<u64>) -> String {
    match total {
        Some(total) => format!("{} / {}", format_bytes(received), format_bytes(total)),
        None => format!("{} / ?", format_bytes(received)),
    }
}
