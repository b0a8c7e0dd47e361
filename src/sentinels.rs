use once_cell::sync::Lazy;
use regex::Regex;

pub const ID_PREFIX: &str = "CHAPTER_ID::";
pub const SEPARATOR: &str = "[CHAPTER_END]";

// Models echo markers with stray spaces inside the brackets; accept them.
pub static ID_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\s*CHAPTER_ID\s*::\s*([^\]\s]+)\s*\]").expect("chapter id regex")
});

pub static SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*CHAPTER_END\s*\]").expect("separator regex"));

pub static IMAGE_PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[\s*IMAGE_PLACEHOLDER_(\d+)\s*\]$").expect("image placeholder regex")
});

/// Opening marker for a chapter; the id is escaped so any href survives the grammar.
pub fn id_marker(id: &str) -> String {
    format!("[{ID_PREFIX}{}]", encode_id(id))
}

/// Percent-escapes the characters an id marker cannot carry (`%`, `[`, `]`, whitespace).
pub fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for ch in id.chars() {
        if ch == '%' || ch == '[' || ch == ']' || ch.is_whitespace() {
            let mut buf = [0u8; 4];
            for b in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Inverse of [`encode_id`]. Malformed escapes are kept literally.
pub fn decode_id(marker_id: &str) -> String {
    let bytes = marker_id.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn image_placeholder(index: usize) -> String {
    format!("[IMAGE_PLACEHOLDER_{index}]")
}

/// Wraps extracted chapter text with its id marker and trailing separator.
pub fn tag_chapter(id: &str, text: &str) -> String {
    format!("{}\n{}\n{SEPARATOR}\n", id_marker(id), text.trim())
}

/// Index of a placeholder line (`[IMAGE_PLACEHOLDER_3]` -> 3).
pub fn placeholder_index(line: &str) -> Option<usize> {
    IMAGE_PLACEHOLDER_RE
        .captures(line.trim())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Cuts a length-limited response back to its last fully delimited chapter.
///
/// A chapter whose opening marker is present but whose separator never arrived was cut off
/// mid-body and is dropped together with everything after it.
pub fn trim_to_last_boundary(text: &str) -> &str {
    let Some(last) = ID_MARKER_RE.find_iter(text).last() else {
        return "";
    };
    match SEPARATOR_RE.find(&text[last.end()..]) {
        Some(sep) => &text[..last.end() + sep.end()],
        None => &text[..last.start()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_text_round_trips_through_marker_regex() {
        let tagged = tag_chapter("Text/ch01.xhtml", "  hello  ");
        assert_eq!(tagged, "[CHAPTER_ID::Text/ch01.xhtml]\nhello\n[CHAPTER_END]\n");
        let caps = ID_MARKER_RE.captures(&tagged).expect("marker");
        assert_eq!(&caps[1], "Text/ch01.xhtml");
    }

    #[test]
    fn ids_with_spaces_and_brackets_survive_the_marker() {
        for id in ["Text/Chapter 1.xhtml", "Text/a]b.xhtml", "Text/100%.xhtml", "Text/章\t2.xhtml"] {
            let tagged = tag_chapter(id, "body");
            let caps = ID_MARKER_RE.captures(&tagged).expect("marker");
            assert_eq!(decode_id(&caps[1]), id);
        }
        assert_eq!(id_marker("Text/Chapter 1.xhtml"), "[CHAPTER_ID::Text/Chapter%201.xhtml]");
        assert_eq!(encode_id("Text/ch01.xhtml"), "Text/ch01.xhtml");
        assert_eq!(decode_id("bad%zz%4"), "bad%zz%4");
    }

    #[test]
    fn marker_regex_tolerates_inner_whitespace() {
        let caps = ID_MARKER_RE.captures("[ CHAPTER_ID :: c7.xhtml ]").expect("marker");
        assert_eq!(&caps[1], "c7.xhtml");
        assert!(SEPARATOR_RE.is_match("[ CHAPTER_END ]"));
    }

    #[test]
    fn trim_drops_chapter_without_separator() {
        let text = "[CHAPTER_ID::a]\nA\n[CHAPTER_END]\n[CHAPTER_ID::b]\nhalf of B";
        assert_eq!(trim_to_last_boundary(text), "[CHAPTER_ID::a]\nA\n[CHAPTER_END]\n");
    }

    #[test]
    fn trim_keeps_complete_last_chapter() {
        let text = "[CHAPTER_ID::a]\nA\n[CHAPTER_END]\n[CHAPTER_ID::b]\nB\n[CHAPTER_END]\ntrail";
        assert_eq!(
            trim_to_last_boundary(text),
            "[CHAPTER_ID::a]\nA\n[CHAPTER_END]\n[CHAPTER_ID::b]\nB\n[CHAPTER_END]"
        );
    }

    #[test]
    fn trim_without_markers_is_empty() {
        assert_eq!(trim_to_last_boundary("no markers at all"), "");
        assert_eq!(trim_to_last_boundary("[CHAPTER_ID::a]\nonly a start"), "");
    }

    #[test]
    fn placeholder_index_parses_lines() {
        assert_eq!(placeholder_index(&image_placeholder(3)), Some(3));
        assert_eq!(placeholder_index("  [IMAGE_PLACEHOLDER_12] "), Some(12));
        assert_eq!(placeholder_index("[IMAGE_PLACEHOLDER_x]"), None);
        assert_eq!(placeholder_index("text [IMAGE_PLACEHOLDER_1]"), None);
    }
}
