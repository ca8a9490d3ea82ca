use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::db::error::UnknownVariant;

/// How a job picks the next credential among the eligible ones.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeySelectionStrategy {
    /// Greatest remaining units; the first in file-name order wins ties.
    #[default]
    MaxRemaining,
    /// Always the first eligible credential in file-name order.
    FilenameOrder,
    /// Rotating index over the current eligible list.
    RoundRobin,
}

impl KeySelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySelectionStrategy::MaxRemaining => "MAX_REMAINING",
            KeySelectionStrategy::FilenameOrder => "FILENAME_ORDER",
            KeySelectionStrategy::RoundRobin => "ROUND_ROBIN",
        }
    }
}

impl fmt::Display for KeySelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeySelectionStrategy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "MAX_REMAINING" => Ok(KeySelectionStrategy::MaxRemaining),
            "FILENAME_ORDER" => Ok(KeySelectionStrategy::FilenameOrder),
            "ROUND_ROBIN" => Ok(KeySelectionStrategy::RoundRobin),
            _ => Err(UnknownVariant {
                kind: "key selection strategy",
                value: s.to_string(),
            }),
        }
    }
}

/// Rotation cursor for [`KeySelectionStrategy::RoundRobin`], one per job run.
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    cursor: AtomicUsize,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index into an eligible list of `size` entries. A list of zero or one
    /// entries yields 0 without moving the cursor.
    pub fn next_index(&self, size: usize) -> usize {
        if size <= 1 {
            return 0;
        }
        self.cursor.fetch_add(1, Ordering::Relaxed) % size
    }

    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

/// Picks an index into `remaining`, the remaining units of each eligible
/// credential in file-name order. `None` when the list is empty.
pub fn select(
    strategy: KeySelectionStrategy,
    remaining: &[i64],
    cursor: &RoundRobinCursor,
) -> Option<usize> {
    if remaining.is_empty() {
        return None;
    }
    let index = match strategy {
        KeySelectionStrategy::MaxRemaining => {
            let mut best = 0;
            for (i, units) in remaining.iter().enumerate().skip(1) {
                if *units > remaining[best] {
                    best = i;
                }
            }
            best
        }
        KeySelectionStrategy::FilenameOrder => 0,
        KeySelectionStrategy::RoundRobin => cursor.next_index(remaining.len()),
    };
    Some(index)
}
