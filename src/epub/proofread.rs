use std::fmt::Write as _;
use std::path::Path;

use super::EpubBook;
use crate::textutil::{contains_cjk_or_kana, ends_with_end_mark};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParagraphIssue {
    pub chapter: String,
    /// 1-based position among the chapter's `<p>` elements.
    pub paragraph: usize,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProofreadReport {
    pub chapters_scanned: usize,
    /// Paragraphs still carrying CJK or kana characters.
    pub untranslated: Vec<ParagraphIssue>,
    /// Paragraphs that stop without closing punctuation.
    pub missing_end_mark: Vec<ParagraphIssue>,
}

impl ProofreadReport {
    pub fn is_clean(&self) -> bool {
        self.untranslated.is_empty() && self.missing_end_mark.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        render_section(&mut out, "Untranslated Character Report", &self.untranslated);
        out.push('\n');
        render_section(&mut out, "Missing End Mark Report", &self.missing_end_mark);
        out
    }
}

fn render_section(out: &mut String, heading: &str, issues: &[ParagraphIssue]) {
    let _ = writeln!(out, "{heading}\n{}\n", "=".repeat(30));
    if issues.is_empty() {
        out.push_str("No issues found.\n");
        return;
    }
    for issue in issues {
        let _ = writeln!(
            out,
            "--------------------\nChapter: {}\nParagraph: {}\n\n{}\n--------------------\n",
            issue.chapter, issue.paragraph, issue.text
        );
    }
}

pub fn proofread_book(book: &EpubBook) -> anyhow::Result<ProofreadReport> {
    let mut report = ProofreadReport::default();
    for ch in book.chapters() {
        let page = book.read_chapter(&ch)?;
        report.chapters_scanned += 1;
        let chapter = page
            .heading
            .clone()
            .or_else(|| page.title.clone())
            .unwrap_or_else(|| ch.id.clone());
        for (i, text) in page.paragraphs.iter().enumerate() {
            if text.is_empty() {
                continue;
            }
            let issue = || ParagraphIssue {
                chapter: chapter.clone(),
                paragraph: i + 1,
                text: text.clone(),
            };
            if contains_cjk_or_kana(text) {
                report.untranslated.push(issue());
            }
            if !ends_with_end_mark(text) {
                report.missing_end_mark.push(issue());
            }
        }
    }
    Ok(report)
}

pub fn proofread_epub(path: &Path) -> anyhow::Result<ProofreadReport> {
    proofread_book(&EpubBook::open(path)?)
}
