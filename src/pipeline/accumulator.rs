use std::collections::HashMap;

/// Run-wide map from chapter id to translated text. Entries are never overwritten.
#[derive(Debug, Default, Clone)]
pub struct ResultAccumulator {
    results: HashMap<String, String>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds entries whose id is not yet present; returns how many were new.
    pub fn merge(&mut self, entries: HashMap<String, String>) -> usize {
        let mut added = 0;
        for (id, text) in entries {
            if let std::collections::hash_map::Entry::Vacant(slot) = self.results.entry(id) {
                slot.insert(text);
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, id: &str) -> bool {
        self.results.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.results.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.results
    }

    pub fn into_map(self) -> HashMap<String, String> {
        self.results
    }
}
