use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::unit::{ChapterUnit, Chunk};
use crate::sentinels::{decode_id, ID_MARKER_RE, SEPARATOR_RE};

/// What a response yielded for the chapters that were asked for.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub translated: HashMap<String, String>,
    /// Requested chapters with no usable body, in chunk order.
    pub missing: Vec<Arc<ChapterUnit>>,
    /// Ids the response carried that were never requested.
    pub foreign: Vec<String>,
    /// Non-blank text that sat outside any id marker.
    pub stray_text: bool,
}

impl Reconciliation {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Attributes the text of a (possibly trimmed) response to the chunk's chapters.
///
/// Each id marker opens a body that runs to the next marker or separator. An empty body
/// counts as missing; the first non-empty body for an id wins.
pub fn reconcile(chunk: &Chunk, raw: &str) -> Reconciliation {
    let requested: HashSet<&str> = chunk.ids().collect();
    let mut out = Reconciliation::default();

    for segment in SEPARATOR_RE.split(raw) {
        let markers: Vec<_> = ID_MARKER_RE.captures_iter(segment).collect();
        let lead_end = markers
            .first()
            .and_then(|c| c.get(0))
            .map_or(segment.len(), |m| m.start());
        if !segment[..lead_end].trim().is_empty() {
            out.stray_text = true;
        }

        for (i, caps) in markers.iter().enumerate() {
            let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let body_end = markers
                .get(i + 1)
                .and_then(|c| c.get(0))
                .map_or(segment.len(), |m| m.start());
            let id = decode_id(id.as_str());
            if !requested.contains(id.as_str()) {
                if !out.foreign.contains(&id) {
                    out.foreign.push(id);
                }
                continue;
            }
            let body = segment[whole.end()..body_end].trim();
            if body.is_empty() || out.translated.contains_key(&id) {
                continue;
            }
            out.translated.insert(id, body.to_string());
        }
    }

    out.missing = chunk
        .units()
        .iter()
        .filter(|u| !out.translated.contains_key(&u.id))
        .cloned()
        .collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::unit::unit;

    fn chunk(ids: &[&str]) -> Chunk {
        Chunk::new(ids.iter().map(|id| unit(id, 1)).collect()).expect("chunk")
    }

    fn missing_ids(r: &Reconciliation) -> Vec<&str> {
        r.missing.iter().map(|u| u.id.as_str()).collect()
    }

    #[test]
    fn full_response_is_complete() {
        let c = chunk(&["a", "b"]);
        let r = reconcile(&c, "[CHAPTER_ID::a]\nUno\n[CHAPTER_END]\n[CHAPTER_ID::b]\nDos\n[CHAPTER_END]\n");
        assert!(r.is_complete());
        assert_eq!(r.translated["a"], "Uno");
        assert_eq!(r.translated["b"], "Dos");
        assert!(!r.stray_text);
    }

    #[test]
    fn dropped_chapter_is_reported_missing() {
        let c = chunk(&["c1", "c2", "c3", "c4"]);
        let raw = "[CHAPTER_ID::c1]\nT1\n[CHAPTER_END]\n[CHAPTER_ID::c2]\nT2\n[CHAPTER_END]\n[CHAPTER_ID::c4]\nT4\n[CHAPTER_END]\n";
        let r = reconcile(&c, raw);
        assert_eq!(missing_ids(&r), ["c3"]);
        assert_eq!(r.translated.len(), 3);
    }

    #[test]
    fn empty_body_counts_as_missing() {
        let c = chunk(&["a", "b"]);
        let r = reconcile(&c, "[CHAPTER_ID::a]\n   \n[CHAPTER_END]\n[CHAPTER_ID::b]\nB\n[CHAPTER_END]");
        assert_eq!(missing_ids(&r), ["a"]);
    }

    #[test]
    fn unrequested_ids_are_discarded() {
        let c = chunk(&["a"]);
        let r = reconcile(&c, "[CHAPTER_ID::zzz]\nZ\n[CHAPTER_END]\n[CHAPTER_ID::a]\nA\n[CHAPTER_END]");
        assert!(r.is_complete());
        assert_eq!(r.foreign, ["zzz"]);
        assert!(!r.translated.contains_key("zzz"));
    }

    #[test]
    fn markers_without_separator_between_them_split_bodies() {
        let c = chunk(&["a", "b"]);
        let r = reconcile(&c, "[CHAPTER_ID::a]\nA\n[CHAPTER_ID::b]\nB\n[CHAPTER_END]");
        assert_eq!(r.translated["a"], "A");
        assert_eq!(r.translated["b"], "B");
    }

    #[test]
    fn text_outside_markers_is_flagged_not_attributed() {
        let c = chunk(&["a"]);
        let r = reconcile(&c, "Here you go!\n[CHAPTER_ID::a]\nA\n[CHAPTER_END]\nHope this helps.");
        assert!(r.stray_text);
        assert_eq!(r.translated["a"], "A");
    }

    #[test]
    fn first_non_empty_body_wins_for_duplicates() {
        let c = chunk(&["a"]);
        let r = reconcile(&c, "[CHAPTER_ID::a]\nfirst\n[CHAPTER_END]\n[CHAPTER_ID::a]\nsecond\n[CHAPTER_END]");
        assert_eq!(r.translated["a"], "first");
    }

    #[test]
    fn spaced_markers_are_recognized() {
        let c = chunk(&["x.xhtml"]);
        let r = reconcile(&c, "[ CHAPTER_ID :: x.xhtml ]\nX\n[ CHAPTER_END ]");
        assert_eq!(r.translated["x.xhtml"], "X");
    }

    #[test]
    fn hrefs_with_spaces_are_recovered() {
        let c = chunk(&["Text/Chapter 1.xhtml", "Text/[2].xhtml"]);
        let echoed: String = c.units().iter().map(|u| u.tagged_text.as_str()).collect();
        let r = reconcile(&c, &echoed);
        assert!(r.is_complete());
        assert_eq!(r.translated["Text/Chapter 1.xhtml"], "text of Text/Chapter 1.xhtml");
        assert!(!r.stray_text);
    }

    #[test]
    fn empty_response_misses_everything() {
        let c = chunk(&["a", "b"]);
        let r = reconcile(&c, "");
        assert_eq!(missing_ids(&r), ["a", "b"]);
    }
}
