//! Corpus statistics and run overviews.
//!
//! The read-only commands: `mrqa stats`, `mrqa index`, `mrqa templates`,
//! `mrqa runs`, and `mrqa show`. Each prints a human-readable table to
//! stdout, or JSON with `--json`.

use anyhow::Result;
use chrono::{DateTime, Local};

use crate::pipeline::Orchestrator;
use crate::progress::format_number;
use crate::templates::{Role, TemplateSource};

/// Print document counts and sizes for the configured corpus.
pub fn run_stats(orch: &Orchestrator, subdirs: &[String], json: bool) -> Result<()> {
    let index = orch.index(subdirs)?;
    let stats = index.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Corpus Stats");
    println!("============");
    println!();
    println!("  Root:        {}", index.root().display());
    if !subdirs.is_empty() {
        println!("  Subdirs:     {}", subdirs.join(", "));
    }
    println!("  Documents:   {}", format_number(stats.document_count as u64));
    println!("  Total size:  {}", format_bytes(stats.total_bytes));
    if !index.warnings().is_empty() {
        println!("  Skipped:     {} (not UTF-8 text)", index.warnings().len());
    }

    if !stats.per_category_counts.is_empty() {
        println!();
        println!("  By category:");
        println!("  {:<32} {:>6}", "CATEGORY", "DOCS");
        println!("  {}", "-".repeat(40));
        for (category, count) in &stats.per_category_counts {
            println!("  {:<32} {:>6}", category, count);
        }
    }
    println!();
    Ok(())
}

/// Print the numbered document list of one indexing pass.
pub fn run_index(orch: &Orchestrator, subdirs: &[String], show_hash: bool, json: bool) -> Result<()> {
    let index = orch.index(subdirs)?;

    if json {
        println!("{}", serde_json::to_string_pretty(index.documents())?);
        return Ok(());
    }

    if show_hash {
        println!("{:<5} {:<20} {:>10}  {:<8}  PATH", "ID", "CATEGORY", "SIZE", "HASH");
    } else {
        println!("{:<5} {:<20} {:>10}  PATH", "ID", "CATEGORY", "SIZE");
    }
    for doc in index.documents() {
        if show_hash {
            println!(
                "{:<5} {:<20} {:>10}  {:<8}  {}",
                doc.display_id(),
                doc.category,
                format_bytes(doc.size),
                doc.hash,
                doc.relative_path
            );
        } else {
            println!(
                "{:<5} {:<20} {:>10}  {}",
                doc.display_id(),
                doc.category,
                format_bytes(doc.size),
                doc.relative_path
            );
        }
    }
    for warning in index.warnings() {
        eprintln!("skipped {}: {}", warning.path.display(), warning.reason);
    }
    Ok(())
}

/// Print registered templates, optionally for one role only.
pub fn run_templates(orch: &Orchestrator, role: Option<Role>) -> Result<()> {
    let registry = orch.templates();
    println!("{:<10} {:<16} SOURCE", "ROLE", "NAME");
    for role in Role::ALL.into_iter().filter(|r| role.map_or(true, |only| only == *r)) {
        for name in registry.list_templates(role) {
            let source = match registry.find(role, name).map(|t| t.source()) {
                Some(TemplateSource::File(path)) => path.display().to_string(),
                _ => "built-in".to_string(),
            };
            println!("{:<10} {:<16} {}", role, name, source);
        }
    }
    Ok(())
}

/// Print past runs, most recent first.
pub fn run_runs(orch: &Orchestrator, json: bool) -> Result<()> {
    let runs = orch.runs().list_runs()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs under {}", orch.runs().root().display());
        return Ok(());
    }

    println!(
        "{:<18} {:<10} {:>7} {:>4}  {:<14} QUESTION",
        "RUN", "STATUS", "RECORDS", "AGG", "CREATED"
    );
    for run in &runs {
        println!(
            "{:<18} {:<10} {:>7} {:>4}  {:<14} {}",
            run.run_id,
            run.status,
            run.record_count,
            run.aggregate_count,
            format_relative(&run.created_at),
            truncate(run.question.as_deref().unwrap_or("-"), 60)
        );
    }
    Ok(())
}

/// Print one run's metadata, failures, and its latest aggregate answer.
pub fn run_show(orch: &Orchestrator, run_id: &str, json: bool) -> Result<()> {
    let run = orch.runs().resolve_run(run_id)?;
    let meta = run.read_metadata()?;
    let aggregates = run.load_aggregates()?;

    if json {
        let value = serde_json::json!({
            "metadata": meta,
            "record_count": run.record_count()?,
            "latest_aggregate": aggregates.last(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Run {}", meta.run_id);
    println!("{}", "=".repeat(4 + meta.run_id.len()));
    println!();
    println!("  Status:      {}", meta.status);
    println!(
        "  Created:     {} ({})",
        meta.created_at.format("%Y-%m-%d %H:%M:%S"),
        format_relative(&meta.created_at)
    );
    if let Some(params) = &meta.parameters {
        println!("  Question:    {}", params.question);
        println!(
            "  Templates:   {} / {}",
            params.single_template, params.aggregate_template
        );
        println!("  Model:       {}", params.model);
        println!("  Parallelism: {}", params.parallelism);
        if !params.subdirs.is_empty() {
            println!("  Subdirs:     {}", params.subdirs.join(", "));
        }
    }
    println!(
        "  Documents:   {} dispatched / {} total, {} ok, {} failed{}",
        meta.map.dispatched,
        meta.map.total_documents,
        meta.map.succeeded,
        meta.map.failed,
        if meta.map.cancelled { " (cancelled)" } else { "" }
    );
    println!("  Records:     {}", run.record_count()?);
    if let Some(error) = &meta.error {
        println!("  Last error:  {}", error);
    }

    if !meta.map.failures.is_empty() {
        println!();
        println!("  Failures:");
        for failure in &meta.map.failures {
            println!(
                "    {:03}  {:<32} [{}] {}",
                failure.document_id,
                failure.label,
                failure.kind,
                truncate(&failure.message, 80)
            );
        }
    }

    if !meta.aggregates.is_empty() {
        println!();
        println!("  Aggregates:");
        for entry in &meta.aggregates {
            println!(
                "    {:03}  {:<12} {} used, {} omitted  {}",
                entry.sequence,
                entry.template,
                entry.used_records,
                entry.omitted_records,
                entry.file
            );
        }
    }

    if let Some(latest) = aggregates.last() {
        println!();
        println!("--- aggregate {:03} ({}) ---", latest.sequence, latest.template);
        println!("{}", latest.answer.trim_end());
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_relative(ts: &DateTime<Local>) -> String {
    let delta = (Local::now() - *ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max_chars && line.len() == s.len() {
        return line.to_string();
    }
    let cut: String = line.chars().take(max_chars).collect();
    format!("{}…", cut)
}
