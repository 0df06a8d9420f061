//! Financial table analyzer for spreadsheet sources.
//!
//! Inspects the row/column grid produced by the extractor, matching header
//! cells against an ordered vocabulary of financial concepts. When a
//! concept is recognized it emits per-concept totals, chart-ready series
//! (label → value pairs), and a natural-language summary line that joins
//! the flattened text fed to the chunker. A grid with no recognized
//! financial structure yields `None` and the document is ingested as plain
//! text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered concept vocabulary; within a concept the first matching alias
/// wins. Matching is case-insensitive substring over the header cell.
const CONCEPTS: &[(&str, &[&str])] = &[
    ("revenue", &["revenue", "sales", "turnover", "income"]),
    ("expenses", &["expense", "cost", "expenditure"]),
    ("profit", &["profit", "net income", "earnings"]),
    ("assets", &["asset"]),
    ("liabilities", &["liabilit"]),
];

/// A chart payload ready for a charting frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSeries {
    pub id: String,
    pub title: String,
    /// `bar`, `pie`, or `line`.
    #[serde(rename = "type")]
    pub kind: String,
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

/// Output of a successful analysis.
#[derive(Debug, Clone)]
pub struct FinancialAnalysis {
    /// Concept → summed value, in vocabulary order.
    pub metrics: BTreeMap<String, f64>,
    pub charts: Vec<ChartSeries>,
    /// One-line natural-language summary appended to the chunkable text.
    pub summary_text: String,
}

/// Analyze a cell grid. Returns `None` when no financial vocabulary is
/// recognized in the headers.
pub fn analyze(table: &[Vec<String>]) -> Option<FinancialAnalysis> {
    if table.len() < 2 {
        return None;
    }

    let header = &table[0];
    let data = &table[1..];

    // Map recognized concept → column index (first matching column wins,
    // concepts matched in vocabulary order).
    let mut concept_cols: Vec<(&'static str, usize)> = Vec::new();
    for &(concept, aliases) in CONCEPTS {
        if concept_cols.iter().any(|&(c, _)| c == concept) {
            continue;
        }
        'cols: for (j, cell) in header.iter().enumerate() {
            let lower = cell.to_lowercase();
            for alias in aliases {
                if lower.contains(alias) {
                    concept_cols.push((concept, j));
                    break 'cols;
                }
            }
        }
    }

    if concept_cols.is_empty() {
        return None;
    }

    // Label column: the first column that is not claimed by a concept and
    // holds mostly non-numeric cells.
    let label_col = (0..header.len())
        .filter(|j| !concept_cols.iter().any(|(_, cj)| cj == j))
        .find(|&j| {
            let non_numeric = data
                .iter()
                .filter_map(|row| row.get(j))
                .filter(|cell| !cell.is_empty() && parse_amount(cell).is_none())
                .count();
            non_numeric * 2 > data.len()
        });

    let mut metrics = BTreeMap::new();
    let mut charts = Vec::new();

    for (concept, j) in &concept_cols {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        let mut total = 0.0;

        for row in data {
            let Some(value) = row.get(*j).and_then(|cell| parse_amount(cell)) else {
                continue;
            };
            total += value;
            if let Some(lj) = label_col {
                if let Some(label) = row.get(lj) {
                    if !label.is_empty() {
                        labels.push(label.clone());
                        values.push(value);
                    }
                }
            }
        }

        metrics.insert(concept.to_string(), round2(total));

        if labels.len() > 1 {
            charts.push(ChartSeries {
                id: format!("{}_by_category", concept),
                title: format!("{} by category", capitalize(concept)),
                kind: "bar".to_string(),
                labels,
                values: values.into_iter().map(round2).collect(),
            });
        }
    }

    if let (Some(&revenue), Some(&expenses)) = (metrics.get("revenue"), metrics.get("expenses")) {
        charts.push(ChartSeries {
            id: "revenue_vs_expenses".to_string(),
            title: "Revenue vs Expenses".to_string(),
            kind: "pie".to_string(),
            labels: vec!["Revenue".to_string(), "Expenses".to_string()],
            values: vec![revenue.abs(), expenses.abs()],
        });
    }

    let summary_text = {
        let parts: Vec<String> = metrics
            .iter()
            .map(|(k, v)| format!("{}: {:.2}", capitalize(k), v))
            .collect();
        format!("Financial summary — {}.", parts.join(", "))
    };

    Some(FinancialAnalysis {
        metrics,
        charts,
        summary_text,
    })
}

/// Parse an amount cell: tolerates thousands separators, currency symbols,
/// and accounting-style parenthesized negatives. `None` for non-numeric
/// cells.
pub fn parse_amount(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() || trimmed.chars().any(|c| c.is_alphabetic()) {
        return None;
    }

    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }

    cleaned.parse::<f64>().ok().map(|v| {
        if negative {
            -v.abs()
        } else {
            v
        }
    })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
