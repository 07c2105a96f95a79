use crate::models::Citation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One side of a comparison. A failed side carries its error text instead of
/// an answer and never blocks the other side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonSide {
    pub document_id: String,
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    pub error: Option<String>,
}

impl ComparisonSide {
    pub fn answered(document_id: &str, answer: String, citations: Vec<Citation>) -> Self {
        Self {
            document_id: document_id.to_string(),
            answer: Some(answer),
            citations,
            error: None,
        }
    }

    pub fn failed(document_id: &str, error: String) -> Self {
        Self {
            document_id: document_id.to_string(),
            answer: None,
            citations: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonOutcome {
    pub side_a: ComparisonSide,
    pub side_b: ComparisonSide,
    pub diff_summary: String,
    pub partial: bool,
}

impl ComparisonOutcome {
    pub fn new(side_a: ComparisonSide, side_b: ComparisonSide) -> Self {
        let partial = side_a.error.is_some() || side_b.error.is_some();
        let diff_summary = match (&side_a.answer, &side_b.answer) {
            (Some(a), Some(b)) => diff_summary(a, b),
            _ => "comparison incomplete: one side produced no answer".to_string(),
        };

        Self {
            side_a,
            side_b,
            diff_summary,
            partial,
        }
    }
}

/// Word-level comparison of two answers: agreement ratio plus the most
/// telling terms unique to each side.
pub fn diff_summary(answer_a: &str, answer_b: &str) -> String {
    let words_a = significant_words(answer_a);
    let words_b = significant_words(answer_b);

    if words_a.is_empty() && words_b.is_empty() {
        return "both answers are empty".to_string();
    }

    let shared: BTreeSet<_> = words_a.intersection(&words_b).cloned().collect();
    let union_size = words_a.union(&words_b).count();
    let overlap = if union_size == 0 {
        0.0
    } else {
        shared.len() as f64 / union_size as f64
    };

    let unique_a = sample_difference(&words_a, &words_b);
    let unique_b = sample_difference(&words_b, &words_a);

    let mut summary = format!("answers agree on {:.0}% of significant terms", overlap * 100.0);
    if !unique_a.is_empty() {
        summary.push_str(&format!("; only A mentions: {}", unique_a.join(", ")));
    }
    if !unique_b.is_empty() {
        summary.push_str(&format!("; only B mentions: {}", unique_b.join(", ")));
    }

    summary
}

fn significant_words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|word| word.to_lowercase())
        .filter(|word| word.len() > 3)
        .collect()
}

fn sample_difference(from: &BTreeSet<String>, other: &BTreeSet<String>) -> Vec<String> {
    from.difference(other).take(5).cloned().collect()
}
