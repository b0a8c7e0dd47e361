use std::sync::Arc;

use super::unit::{ChapterUnit, Chunk};

/// Greedy single-pass packing of chapters into chunks.
///
/// A chunk closes before a unit that would push it past `budget` or past
/// `max_units` members. A unit costlier than the whole budget still gets a chunk of its own.
pub fn build_chunks(
    units: &[Arc<ChapterUnit>],
    budget: usize,
    max_units: Option<usize>,
) -> Vec<Chunk> {
    let max_units = max_units.filter(|n| *n > 0);
    let mut chunks = Vec::new();
    let mut current: Vec<Arc<ChapterUnit>> = Vec::new();
    let mut current_cost = 0usize;

    for unit in units {
        let over_budget = current_cost + unit.token_cost > budget;
        let full = max_units.is_some_and(|n| current.len() >= n);
        if !current.is_empty() && (over_budget || full) {
            chunks.extend(Chunk::new(std::mem::take(&mut current)));
            current_cost = 0;
        }
        current.push(Arc::clone(unit));
        current_cost += unit.token_cost;
    }
    chunks.extend(Chunk::new(current));
    chunks
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::pipeline::unit::unit;

    fn ids(chunks: &[Chunk]) -> Vec<Vec<String>> {
        chunks
            .iter()
            .map(|c| c.ids().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn empty_input_gives_no_chunks() {
        assert!(build_chunks(&[], 100, None).is_empty());
    }

    #[test]
    fn packs_until_budget() {
        let units = vec![unit("a", 40), unit("b", 40), unit("c", 40), unit("d", 10)];
        let chunks = build_chunks(&units, 100, None);
        assert_eq!(ids(&chunks), vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn exact_budget_fits() {
        let units = vec![unit("a", 50), unit("b", 50)];
        assert_eq!(build_chunks(&units, 100, None).len(), 1);
    }

    #[test]
    fn oversized_chapter_stands_alone() {
        let units = vec![unit("a", 10), unit("big", 500), unit("c", 10)];
        let chunks = build_chunks(&units, 100, None);
        assert_eq!(ids(&chunks), vec![vec!["a"], vec!["big"], vec!["c"]]);
    }

    #[test]
    fn respects_member_cap() {
        let units: Vec<_> = (0..5).map(|i| unit(&format!("c{i}"), 1)).collect();
        let chunks = build_chunks(&units, 1_000, Some(2));
        assert_eq!(chunks.iter().map(Chunk::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(build_chunks(&units, 1_000, Some(0)).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_chunks_fit_budget_or_are_singletons(
            costs in prop::collection::vec(1usize..300, 0..60),
            budget in 1usize..500,
            cap in prop::option::of(1usize..8),
        ) {
            let units: Vec<_> = costs.iter().enumerate().map(|(i, c)| unit(&format!("c{i}"), *c)).collect();
            let chunks = build_chunks(&units, budget, cap);
            for c in &chunks {
                prop_assert!(c.total_cost() <= budget || c.len() == 1);
                if let Some(n) = cap {
                    prop_assert!(c.len() <= n);
                }
            }
        }

        #[test]
        fn prop_chunks_preserve_order(
            costs in prop::collection::vec(1usize..300, 0..60),
            budget in 1usize..500,
        ) {
            let units: Vec<_> = costs.iter().enumerate().map(|(i, c)| unit(&format!("c{i}"), *c)).collect();
            let flat: Vec<String> = build_chunks(&units, budget, None)
                .iter()
                .flat_map(|c| c.ids().map(str::to_string).collect::<Vec<_>>())
                .collect();
            let expected: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
            prop_assert_eq!(flat, expected);
        }
    }
}
