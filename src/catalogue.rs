//! SExtractor ASCII catalogues
//!
//! Catalogues are written with `CATALOG_TYPE ASCII_HEAD`: one `#` line per
//! column giving its 1-based index and name, followed by whitespace
//! separated rows. Vector columns occupy several positions but are named
//! once, so indices are taken from the header rather than counted.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

pub const COLUMN_FLAGS: &str = "FLAGS";
pub const COLUMN_FWHM: &str = "FWHM_IMAGE";

fn header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^#\s*(\d+)\s+([A-Za-z0-9_]+)").expect("static pattern is valid")
    })
}

#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    columns: HashMap<String, usize>,
    rows: Vec<Vec<f64>>,
}

impl Catalogue {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalogue: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Malformed catalogue: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut columns = HashMap::new();
        let mut rows = Vec::new();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                if let Some(caps) = header_pattern().captures(line) {
                    let index: usize = caps[1].parse()?;
                    anyhow::ensure!(index > 0, "column index 0 on line {}", line_no + 1);
                    columns.insert(caps[2].to_string(), index - 1);
                }
                continue;
            }
            let row = line
                .split_whitespace()
                .map(|field| {
                    field.parse::<f64>().with_context(|| {
                        format!("bad value {:?} on line {}", field, line_no + 1)
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.get(name).copied()
    }

    /// Values of a named column; rows too short to hold it are skipped
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|r| r.get(index).copied()).collect())
    }

    /// Mean `FWHM_IMAGE` of unflagged sources, in pixels
    pub fn mean_unflagged_fwhm(&self) -> Option<f64> {
        let flags = self.column_index(COLUMN_FLAGS)?;
        let fwhm = self.column_index(COLUMN_FWHM)?;

        let (sum, count) = self
            .rows
            .iter()
            .filter(|row| row.get(flags) == Some(&0.0))
            .filter_map(|row| row.get(fwhm))
            .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));

        (count > 0).then(|| sum / count as f64)
    }
}
