use std::sync::Arc;

use crate::sentinels::tag_chapter;

/// One chapter, ready to be sent to the model. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterUnit {
    pub id: String,
    pub tagged_text: String,
    /// Estimated input cost; never zero.
    pub token_cost: usize,
    /// Original image fragments, indexed by the placeholders in the text.
    pub image_assets: Vec<String>,
}

impl ChapterUnit {
    pub fn new(id: impl Into<String>, text: &str, token_cost: usize, image_assets: Vec<String>) -> Self {
        let id = id.into();
        Self {
            tagged_text: tag_chapter(&id, text),
            id,
            token_cost: token_cost.max(1),
            image_assets,
        }
    }
}

/// Ordered, non-empty group of chapters submitted in one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    units: Vec<Arc<ChapterUnit>>,
}

impl Chunk {
    pub fn new(units: Vec<Arc<ChapterUnit>>) -> Option<Self> {
        if units.is_empty() {
            None
        } else {
            Some(Self { units })
        }
    }

    pub fn units(&self) -> &[Arc<ChapterUnit>] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn total_cost(&self) -> usize {
        self.units.iter().map(|u| u.token_cost).sum()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.id.as_str())
    }

    pub fn first_id(&self) -> &str {
        &self.units[0].id
    }

    pub fn last_id(&self) -> &str {
        &self.units[self.units.len() - 1].id
    }

    /// Tagged texts of all members, in order.
    pub fn prompt_text(&self) -> String {
        self.units.iter().map(|u| u.tagged_text.as_str()).collect()
    }

    /// Splits into `floor(n/2)` and the rest. `None` for a single chapter.
    pub fn bisect(&self) -> Option<(Chunk, Chunk)> {
        if self.units.len() < 2 {
            return None;
        }
        let mid = self.units.len() / 2;
        let (a, b) = self.units.split_at(mid);
        Some((
            Self { units: a.to_vec() },
            Self { units: b.to_vec() },
        ))
    }
}

/// Spreads one token count for the whole text over chapters by character share.
pub fn apportion_tokens(char_counts: &[usize], total_tokens: usize) -> Vec<usize> {
    let total_chars: usize = char_counts.iter().sum();
    char_counts
        .iter()
        .map(|&chars| {
            if total_chars == 0 {
                return 1;
            }
            let share = (total_tokens as u128 * chars as u128 / total_chars as u128) as usize;
            share.max(1)
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn unit(id: &str, cost: usize) -> Arc<ChapterUnit> {
    Arc::new(ChapterUnit::new(id, &format!("text of {id}"), cost, Vec::new()))
}
