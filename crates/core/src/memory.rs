use crate::models::{Citation, ConversationTurn};
use chrono::Utc;
use std::collections::VecDeque;

/// Session-scoped question/answer history with FIFO eviction.
///
/// Turns are append-only and never mutated; once the window is full the oldest
/// turn is dropped. Not durable by itself, but `snapshot`/`restore` let a
/// hosting process persist sessions elsewhere.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
    next_sequence: u64,
}

impl ConversationMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            capacity: capacity.max(1),
            next_sequence: 0,
        }
    }

    pub fn append(&mut self, question: &str, answer: &str, citations: Vec<Citation>) {
        let turn = ConversationTurn {
            question: question.to_string(),
            answer: answer.to_string(),
            citations,
            sequence: self.next_sequence,
            created_at: Utc::now(),
        };
        self.next_sequence += 1;

        self.turns.push_back(turn);
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
    }

    /// Last `n` turns in chronological order, most recent last.
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn restore(capacity: usize, turns: Vec<ConversationTurn>) -> Self {
        let next_sequence = turns.iter().map(|t| t.sequence + 1).max().unwrap_or(0);
        let mut memory = Self::new(capacity);
        memory.next_sequence = next_sequence;
        memory.turns = turns.into_iter().collect();
        while memory.turns.len() > memory.capacity {
            memory.turns.pop_front();
        }
        memory
    }
}
