//! Split result reporting.
//!
//! One line per split, written to stdout and to a report file in the fixed
//! order train, validate, test. The file is flushed after every line so an
//! abnormal exit between splits keeps the lines already written.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

use crate::eval::SplitSummary;

/// Format one result line. `{:?}` float formatting keeps the trailing `.0`
/// on whole values, so a perfect split reads `perplexity: 1.0`.
pub fn format_line(split: &str, summary: SplitSummary) -> String {
    match summary {
        SplitSummary::Measured(p) => format!("{split} perplexity: {p:?}"),
        SplitSummary::Empty => format!("{split} perplexity: no data"),
    }
}

/// Writes split results to stdout and a report file opened once.
pub struct Reporter {
    file: BufWriter<File>,
}

impl Reporter {
    /// Create the report file (and its parent directory if needed).
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create report directory {}", parent.display()))?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("create report file {}", path.display()))?;
        Ok(Self {
            file: BufWriter::new(file),
        })
    }

    /// Record one split's result on stdout and in the file, flushed.
    pub fn record(&mut self, split: &str, summary: SplitSummary) -> anyhow::Result<()> {
        let line = format_line(split, summary);
        println!("{line}");
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_formats() {
        assert_eq!(
            format_line("train", SplitSummary::Measured(1.0)),
            "train perplexity: 1.0"
        );
        assert_eq!(
            format_line("validate", SplitSummary::Measured(12.3456)),
            "validate perplexity: 12.3456"
        );
        assert_eq!(
            format_line("test", SplitSummary::Empty),
            "test perplexity: no data"
        );
    }

    #[test]
    fn report_file_has_three_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ppl.txt");
        let mut reporter = Reporter::create(&path).unwrap();
        reporter.record("train", SplitSummary::Measured(2.5)).unwrap();
        reporter.record("validate", SplitSummary::Measured(3.5)).unwrap();
        reporter.record("test", SplitSummary::Empty).unwrap();
        drop(reporter);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "train perplexity: 2.5");
        assert_eq!(lines[1], "validate perplexity: 3.5");
        assert_eq!(lines[2], "test perplexity: no data");
    }

    #[test]
    fn lines_are_flushed_as_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ppl.txt");
        let mut reporter = Reporter::create(&path).unwrap();
        reporter.record("train", SplitSummary::Measured(2.0)).unwrap();

        // Still open, but the first line must already be on disk.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "train perplexity: 2.0\n");
        drop(reporter);
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("ppl.txt");
        let mut reporter = Reporter::create(&path).unwrap();
        reporter.record("train", SplitSummary::Measured(1.5)).unwrap();
        assert!(path.exists());
    }
}
