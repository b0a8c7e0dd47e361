use once_cell::sync::Lazy;
use regex::Regex;

static CJK_KANA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u4e00-\u9fff\u3040-\u309f\u30a0-\u30ff]+").expect("cjk"));

const END_MARKS: [char; 10] = ['.', '?', '!', '"', '\'', '”', '’', ')', ']', '*'];

pub fn contains_cjk_or_kana(text: &str) -> bool {
    CJK_KANA_RE.is_match(text)
}

pub fn ends_with_end_mark(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .is_some_and(|c| END_MARKS.contains(&c))
}

/// Rough token count used when the backend cannot count for us.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4).max(1)
}

/// Shortens text for log lines, keeping char boundaries.
pub fn clip_for_log(text: &str, max_chars: usize) -> String {
    let flat = text.replace(['\r', '\n'], " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_untranslated_scripts() {
        assert!(contains_cjk_or_kana("He said 你好 twice"));
        assert!(contains_cjk_or_kana("カタカナ"));
        assert!(!contains_cjk_or_kana("Plain English, café."));
    }

    #[test]
    fn end_marks() {
        assert!(ends_with_end_mark("Done."));
        assert!(ends_with_end_mark("“Really?”  "));
        assert!(!ends_with_end_mark("and then"));
        assert!(!ends_with_end_mark(""));
    }

    #[test]
    fn approx_tokens_never_zero() {
        assert_eq!(approx_tokens(""), 1);
        assert_eq!(approx_tokens("abcdefgh"), 2);
        assert_eq!(approx_tokens("abcdefghi"), 3);
    }

    #[test]
    fn clip_respects_multibyte() {
        assert_eq!(clip_for_log("第一章\n开始", 3), "第一章…");
        assert_eq!(clip_for_log("short", 10), "short");
    }
}
