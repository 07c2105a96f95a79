use crate::chunking::normalize_whitespace;
use crate::models::{Citation, RetrievalResult};

/// One retrieved chunk admitted into the prompt, tagged with its citation.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub citation: Citation,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
    pub rendered: String,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn citations(&self) -> Vec<Citation> {
        self.blocks.iter().map(|block| block.citation.clone()).collect()
    }
}

/// Assemble retrieved chunks into a bounded prompt context.
///
/// Results are consumed in descending-score order. Near-duplicate texts
/// (overlapping-window artifacts) keep only the highest-scoring copy. When the
/// character budget runs out, whole lowest-ranked chunks are dropped; a chunk
/// is never split, so every rendered span maps back to exactly one citation.
/// The top result is always admitted even if it alone exceeds the budget.
pub fn assemble_context(results: &[RetrievalResult], max_chars: usize) -> AssembledContext {
    let mut ordered: Vec<&RetrievalResult> = results.iter().collect();
    ordered.sort_by(|left, right| right.score.total_cmp(&left.score));

    let mut blocks: Vec<ContextBlock> = Vec::new();
    let mut accepted_keys: Vec<String> = Vec::new();
    let mut budget_used = 0usize;

    for result in ordered {
        let key = normalize_whitespace(&result.chunk.text).to_lowercase();
        if key.is_empty() || is_near_duplicate(&key, &accepted_keys) {
            continue;
        }

        let block_chars = result.chunk.text.chars().count();
        if !blocks.is_empty() && budget_used + block_chars > max_chars {
            continue;
        }

        budget_used += block_chars;
        accepted_keys.push(key);
        blocks.push(ContextBlock {
            citation: Citation::from_result(result),
            text: result.chunk.text.clone(),
        });
    }

    let rendered = render_blocks(&blocks);
    AssembledContext { blocks, rendered }
}

fn is_near_duplicate(key: &str, accepted: &[String]) -> bool {
    accepted
        .iter()
        .any(|existing| existing.contains(key) || key.contains(existing.as_str()))
}

fn render_blocks(blocks: &[ContextBlock]) -> String {
    blocks
        .iter()
        .enumerate()
        .map(|(index, block)| {
            format!(
                "[Source {}: {}, Page {}] (Relevance: {:.2})\n{}\n",
                index + 1,
                block.citation.document,
                block.citation.page,
                block.citation.score,
                block.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}
