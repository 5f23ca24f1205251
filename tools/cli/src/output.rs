//! Rendering of command output.

use anyhow::Result;
use serde::Serialize;
use std::io::Write;

use strata_queue::{FindResults, QueuedMessage};
use strata_sync::SyncReport;

/// Machine readable output formats of `list-queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

/// One queued message, flattened for output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueRow {
    pub storage: String,
    pub action: String,
    pub path: String,
    pub source: Option<usize>,
    pub destination: usize,
    pub retry_count: u32,
    pub created_at: String,
    pub available_at: String,
}

impl From<&QueuedMessage> for QueueRow {
    fn from(record: &QueuedMessage) -> Self {
        let message = &record.message;
        Self {
            storage: message.storage().to_string(),
            action: message.kind().to_string(),
            path: message.path().to_string(),
            source: message.source(),
            destination: message.destination(),
            retry_count: message.retry_count(),
            created_at: record.created_at.to_rfc3339(),
            available_at: record.available_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct QueuePage {
    limit: usize,
    total: usize,
    page: usize,
    items: Vec<QueueRow>,
}

/// Write a page of queued messages as JSON.
pub fn write_json(out: &mut impl Write, results: &FindResults, pretty: bool) -> Result<()> {
    let page = QueuePage {
        limit: results.limit,
        total: results.total,
        page: results.page,
        items: results.items.iter().map(QueueRow::from).collect(),
    };

    if pretty {
        serde_json::to_writer_pretty(&mut *out, &page)?;
    } else {
        serde_json::to_writer(&mut *out, &page)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Write a page of queued messages as CSV, one line per message.
pub fn write_csv(out: &mut impl Write, results: &FindResults) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for record in &results.items {
        writer.serialize(QueueRow::from(record))?;
    }
    writer.flush()?;
    Ok(())
}

/// Human readable table of queued messages.
///
/// The storage column is left out when every row belongs to the same,
/// explicitly requested storage.
pub fn queue_table(results: &FindResults, show_storage: bool) -> String {
    let mut headers = Vec::new();
    if show_storage {
        headers.push("Storage");
    }
    headers.extend([
        "Action",
        "Path",
        "Source",
        "Destination",
        "Retry count",
        "Creation date",
        "Availability date",
    ]);

    let rows: Vec<Vec<String>> = results
        .items
        .iter()
        .map(|record| {
            let row = QueueRow::from(record);
            let mut cells = Vec::new();
            if show_storage {
                cells.push(row.storage);
            }
            cells.extend([
                row.action,
                row.path,
                row.source.map(|s| s.to_string()).unwrap_or_default(),
                row.destination.to_string(),
                row.retry_count.to_string(),
                record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                record.available_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]);
            cells
        })
        .collect();

    render_table(&headers, &rows)
}

/// Summary line printed under the queue table.
pub fn queue_footer(results: &FindResults) -> String {
    if results.page == 1 && results.total <= results.limit {
        return format!("Displayed all of {} items.", results.total);
    }

    let range = if results.is_empty() {
        "none".to_string()
    } else {
        format!(
            "{}-{}",
            results.first_item_number(),
            results.last_item_number()
        )
    };
    format!(
        "Displayed {} of {} items (page {}/{}).",
        range,
        results.total,
        results.page,
        results.total_pages()
    )
}

/// Summary of a reconciliation run.
pub fn sync_summary(report: &SyncReport, show_deleted: bool) -> String {
    let mut summary = format!(
        "Storages are synced, {} file(s) has been replicated",
        report.total_replicated()
    );
    if show_deleted {
        summary.push_str(&format!(" and {} deleted", report.total_deleted()));
    }
    summary.push('.');
    summary
}

/// Per-backend table of a reconciliation run.
pub fn sync_table(report: &SyncReport, show_deleted: bool) -> String {
    let mut headers = vec!["Storage", "Replicated files"];
    if show_deleted {
        headers.push("Deleted files");
    }

    let rows: Vec<Vec<String>> = report
        .backends
        .iter()
        .map(|backend| {
            let mut cells = vec![
                format!("{} #{}", report.storage, backend.index),
                backend.replicated.to_string(),
            ];
            if show_deleted {
                cells.push(backend.deleted.to_string());
            }
            cells
        })
        .collect();

    render_table(&headers, &rows)
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut table = Vec::with_capacity(rows.len() + 2);
    table.push(render_line(headers.iter().copied(), &widths));
    table.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    for row in rows {
        table.push(render_line(row.iter().map(String::as_str), &widths));
    }
    table.join("\n")
}

fn render_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect();
    padded.join("  ").trim_end().to_string()
}
