//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use nestsync_core::sync::SyncReport;
use nestsync_core::{ChangeEntry, Document, Revision};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a single document
    pub fn print_document(&self, doc: &Document) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:       {}", doc.id);
                println!("Revision: {}", doc.revision);
                if doc.deleted {
                    println!("Deleted:  yes");
                }
                if !doc.body.is_empty() {
                    println!();
                    println!("{}", to_json(&doc.body));
                }
            }
            OutputFormat::Json => println!("{}", to_json(doc)),
            OutputFormat::Quiet => println!("{}", doc.revision),
        }
    }

    /// Print a list of documents
    pub fn print_documents(&self, docs: &[Document]) {
        match self.format {
            OutputFormat::Human => {
                if docs.is_empty() {
                    println!("No documents found.");
                    return;
                }
                for doc in docs {
                    let marker = if doc.deleted { " (deleted)" } else { "" };
                    println!(
                        "{} | {}{} | {}",
                        truncate(&doc.id, 24),
                        short_revision(&doc.revision),
                        marker,
                        truncate(&compact_json(&doc.body), 50)
                    );
                }
                println!("\n{} document(s)", docs.len());
            }
            OutputFormat::Json => println!("{}", to_json(docs)),
            OutputFormat::Quiet => {
                for doc in docs {
                    println!("{}", doc.id);
                }
            }
        }
    }

    /// Print a list of revisions under a heading
    pub fn print_revisions(&self, heading: &str, empty: &str, revisions: &[Revision]) {
        match self.format {
            OutputFormat::Human => {
                if revisions.is_empty() {
                    println!("{}", empty);
                    return;
                }
                println!("{}:", heading);
                for rev in revisions {
                    println!("  {}", rev);
                }
            }
            OutputFormat::Json => println!("{}", to_json(revisions)),
            OutputFormat::Quiet => {
                for rev in revisions {
                    println!("{}", rev);
                }
            }
        }
    }

    /// Print change feed entries
    pub fn print_changes(&self, changes: &[ChangeEntry]) {
        match self.format {
            OutputFormat::Human => {
                if changes.is_empty() {
                    println!("No changes.");
                    return;
                }
                for change in changes {
                    println!(
                        "{:>6} | {} | {} | {}{}",
                        change.seq,
                        change.committed_at.format("%Y-%m-%d %H:%M:%S"),
                        truncate(&change.id, 24),
                        short_revision(&change.revision),
                        if change.deleted { " (deleted)" } else { "" }
                    );
                }
                println!("\n{} change(s)", changes.len());
            }
            OutputFormat::Json => println!("{}", to_json(changes)),
            OutputFormat::Quiet => {
                for change in changes {
                    println!("{}", change.seq);
                }
            }
        }
    }

    /// Print the outcome of syncing one collection
    pub fn print_sync_report(&self, collection: &str, peer: &str, report: &SyncReport) {
        match self.format {
            OutputFormat::Human => {
                let mut line = format!(
                    "{}: pushed {} / pulled {} with {}",
                    collection, report.push.applied, report.pull.applied, peer
                );
                if report.push.cancelled || report.pull.cancelled {
                    line.push_str(" (cancelled)");
                }
                println!("✓ {}", line);
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "collection": collection,
                        "peer": peer,
                        "push": report.push,
                        "pull": report.pull,
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print any serializable value as JSON
    pub fn print_json<T: Serialize>(&self, value: &T) {
        println!("{}", to_json(value));
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unprintable: {}>", e))
}

fn compact_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Revision with its hash cut to 8 characters
fn short_revision(rev: &Revision) -> String {
    format!("{}-{}", rev.generation, rev.hash.get(..8).unwrap_or(&rev.hash))
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
