//! CLI command implementations

use crate::output::{format_bytes, format_limit, format_transfer, print_output};
use crate::progress::FetchProgress;
use crate::{ConfigAction, GetArgs, ModeArg, OutputFormat, StoreAction};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use hfetch_core::config::save_config;
use hfetch_core::{FetchAttr, FetchEngine, FetchFlags};
use hfetch_types::{EngineConfig, StorageMode, StoredEntry};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

impl From<ModeArg> for StorageMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Default => StorageMode::Default,
            ModeArg::Append => StorageMode::Append,
            ModeArg::Replace => StorageMode::Replace,
            ModeArg::NoDownload => StorageMode::NoDownload,
        }
    }
}

// ============================================================================
// Get
// ============================================================================

/// Result of a `get`, printed once the transfer is over
#[derive(Serialize)]
struct FetchSummary {
    id: u32,
    url: String,
    status: u16,
    status_text: String,
    bytes: u64,
    total_bytes: Option<u64>,
    stored_as: Option<String>,
    written_to: Option<PathBuf>,
    error: Option<String>,
}

impl fmt::Display for FetchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => writeln!(f, "{} {}", style("✗").red().bold(), style(&self.url).bold())?,
            None => writeln!(f, "{} {}", style("✓").green().bold(), style(&self.url).bold())?,
        }
        writeln!(f, "  Status: {} {}", self.status, self.status_text)?;
        write!(f, "  Size: {}", format_transfer(self.bytes, self.total_bytes))?;
        if let Some(path) = &self.stored_as {
            write!(f, "\n  Stored as: {}", path)?;
        }
        if let Some(path) = &self.written_to {
            write!(f, "\n  Written to: {}", path.display())?;
        }
        if let Some(error) = &self.error {
            write!(f, "\n  Error: {}", style(error).red())?;
        }
        Ok(())
    }
}

pub fn get(config: EngineConfig, args: GetArgs, format: OutputFormat) -> Result<()> {
    let engine = FetchEngine::new(config)?;
    if let Some(limit) = args.limit_rate {
        engine.set_speed_limit(Some(limit))?;
    }

    let mut attr = FetchAttr::new();
    if let Some(method) = &args.method {
        attr.set_method(&method.to_uppercase())
            .map_err(|e| anyhow!("Invalid method {}: {}", method, e))?;
    }
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid header {:?}, expected \"Name: value\"", header))?;
        attr.with_header(name.trim(), value.trim());
    }
    if let Some(data) = args.data {
        attr.with_body(data);
    }
    if let Some(user) = &args.user {
        let (name, password) = user.split_once(':').unwrap_or((user.as_str(), ""));
        attr.credentials = Some((name.to_string(), password.to_string()));
    }
    attr.timeout = args.timeout_ms.map(Duration::from_millis);

    let mut flags = FetchFlags::empty();
    if args.out.is_some() {
        flags.insert(FetchFlags::LOAD_TO_MEMORY);
    }
    if args.stream {
        flags.insert(FetchFlags::STREAM_DATA);
    }
    if let Some(path) = &args.save {
        flags.insert(FetchFlags::PERSIST_FILE);
        attr.set_destination_path(path)
            .map_err(|e| anyhow!("Invalid store path {}: {}", path, e))?;
    }
    attr.with_flags(flags);
    attr.set_storage_mode(args.mode.into());

    let progress = FetchProgress::new(&args.url, matches!(format, OutputFormat::Human));
    let stream = args.stream;

    let bar = progress.clone();
    attr.on_progress(move |f| {
        let received = if stream {
            f.data_offset() + f.num_bytes()
        } else {
            f.num_bytes()
        };
        bar.update(received, f.total_bytes());

        if let Some(chunk) = f.data() {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(&chunk).and_then(|_| stdout.flush()) {
                warn!("Failed to write to stdout: {}", e);
            }
        }
    });
    let bar = progress.clone();
    attr.on_success(move |f| bar.finish(f.status()));
    let bar = progress.clone();
    attr.on_error(move |f| {
        let reason = f
            .error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| f.status_text());
        bar.fail(&reason);
    });

    let fetch = engine.fetch(&attr, &args.url);
    fetch.wait(None)?;

    let error = fetch.error().map(|e| e.to_string());
    let mut written_to = None;
    if error.is_none() {
        if let Some(out) = &args.out {
            let body = fetch.data().unwrap_or_default();
            std::fs::write(out, &body)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            written_to = Some(out.clone());
        }
    }

    let summary = FetchSummary {
        id: fetch.id(),
        url: args.url.clone(),
        status: fetch.status(),
        status_text: fetch.status_text(),
        bytes: fetch.num_bytes(),
        total_bytes: fetch.total_bytes(),
        stored_as: args.save.clone().filter(|_| error.is_none()),
        written_to,
        error: error.clone(),
    };
    fetch.close()?;

    // Streamed bodies own stdout in human mode
    if stream && matches!(format, OutputFormat::Human) {
        eprintln!("{}", summary);
    } else {
        print_output(&summary, format)?;
    }

    match error {
        Some(error) => bail!("Fetch of {} failed: {}", args.url, error),
        None => Ok(()),
    }
}

// ============================================================================
// Store
// ============================================================================

pub fn store_action(config: EngineConfig, action: StoreAction, format: OutputFormat) -> Result<()> {
    let engine = FetchEngine::new(config)?;

    match action {
        StoreAction::List => {
            let entries = engine.stored_files()?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                }
                OutputFormat::Table => {
                    use tabled::{Table, Tabled};

                    #[derive(Tabled)]
                    struct EntryRow {
                        path: String,
                        size: String,
                        progress: String,
                        url: String,
                        updated: String,
                    }

                    let rows: Vec<EntryRow> = entries
                        .iter()
                        .map(|e| EntryRow {
                            path: e.path.clone(),
                            size: format_transfer(e.stored_bytes, e.total_bytes),
                            progress: format!("{:.1}%", e.progress()),
                            url: if e.url.len() > 50 {
                                format!("{}...", truncate_at_char(&e.url, 47))
                            } else {
                                e.url.clone()
                            },
                            updated: e.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();

                    println!("{}", Table::new(rows));
                }
                OutputFormat::Human => {
                    if entries.is_empty() {
                        println!("{}", style("Store is empty").dim());
                        return Ok(());
                    }

                    for entry in &entries {
                        print_entry(entry, false);
                    }
                    println!();
                    println!("{} file(s) stored", style(entries.len()).bold());
                }
            }
        }

        StoreAction::Show { path } => {
            let entry = engine
                .stored_file(&path)?
                .ok_or_else(|| anyhow!("Nothing stored under {}", path))?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&entry)?);
                }
                _ => print_entry(&entry, true),
            }
        }

        StoreAction::Rm { path } => {
            if engine.remove_stored(&path)? {
                println!("{} Removed {}", style("✓").green().bold(), path);
            } else {
                bail!("Nothing stored under {}", path);
            }
        }

        StoreAction::Clear { yes } => {
            if !yes && !confirm("Delete every stored file?")? {
                return Ok(());
            }
            let removed = engine.clear_store()?;
            println!(
                "{} Removed {} stored file(s)",
                style("✓").green().bold(),
                removed
            );
        }
    }

    Ok(())
}

fn print_entry(entry: &StoredEntry, detailed: bool) {
    let status_icon = if entry.complete {
        style("✓").green()
    } else {
        style("…").yellow()
    };

    println!(
        "{} {} {} [{}]",
        status_icon,
        style(&entry.path).bold(),
        style(format_bytes(entry.stored_bytes)).dim(),
        style(if entry.complete { "complete" } else { "partial" }).dim()
    );

    if detailed {
        println!("    URL: {}", entry.url);
        println!(
            "    Size: {} ({:.1}%)",
            format_transfer(entry.stored_bytes, entry.total_bytes),
            entry.progress()
        );
        println!("    Updated: {}", entry.updated_at.to_rfc3339());
    }
}

fn truncate_at_char(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn confirm(prompt: &str) -> Result<bool> {
    use dialoguer::Confirm;

    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn config_action(
    path: &Path,
    config: &EngineConfig,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(config)?);
            }
            _ => {
                println!("hfetch Configuration ({}):", path.display());
                println!();
                println!(
                    "  Store directory: {}",
                    config
                        .data_dir
                        .as_ref()
                        .map(|d| d.display().to_string())
                        .unwrap_or_else(|| "disabled".to_string())
                );
                println!("  User agent: {}", config.user_agent);
                println!("  Connect timeout: {}s", config.connect_timeout_secs);
                println!(
                    "  Request timeout: {}",
                    config
                        .request_timeout_secs
                        .map(|s| format!("{}s", s))
                        .unwrap_or_else(|| "none".to_string())
                );
                println!("  Speed limit: {}", format_limit(config.speed_limit));
                println!(
                    "  Retries: {} (delay {}ms)",
                    config.max_retries, config.retry_delay_ms
                );
                println!("  Progress interval: {}ms", config.progress_interval_ms);
                println!("  Proxy: {:?}", config.proxy.mode);
            }
        },

        Some(ConfigAction::Path) => {
            println!("{}", path.display());
        }

        Some(ConfigAction::Reset { yes }) => {
            if !yes && !confirm("Reset all settings to defaults?")? {
                return Ok(());
            }
            save_config(path, &EngineConfig::default())?;
            println!("{} Settings reset to defaults", style("✓").green().bold());
        }
    }

    Ok(())
}
