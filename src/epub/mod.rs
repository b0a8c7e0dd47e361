//! EPUB container handling: reading chapters out as plain text and writing translated ones back.

mod extract;
mod opf;
mod package;
mod proofread;
mod rebuild;
mod stylefix;
#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

use anyhow::Context;

pub use extract::{decode_document, extract_chapter, ChapterText};
pub use opf::{locate_opf, ManifestItem, OpfDocument};
pub use package::EpubPackage;
pub use proofread::{proofread_epub, ParagraphIssue, ProofreadReport};
pub use rebuild::{rebuild_epub, render_chapter_xhtml, RebuildSummary};
pub use stylefix::{default_fixed_path, fix_stylesheets, StyleFixReport};

/// A chapter document, identified by its manifest href.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterRef {
    pub id: String,
    /// Path inside the zip.
    pub path: String,
}

pub struct EpubBook {
    pub package: EpubPackage,
    pub opf: OpfDocument,
}

impl EpubBook {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let package = EpubPackage::read(path)?;
        let opf = locate_opf(&package).with_context(|| format!("read package: {}", path.display()))?;
        Ok(Self { package, opf })
    }

    /// Chapter documents in reading order.
    pub fn chapters(&self) -> Vec<ChapterRef> {
        self.opf
            .chapter_items()
            .into_iter()
            .map(|item| ChapterRef {
                id: item.href.clone(),
                path: self.opf.resolve(&item.href),
            })
            .filter(|c| self.package.contains(&c.path))
            .collect()
    }

    pub fn read_chapter(&self, chapter: &ChapterRef) -> anyhow::Result<ChapterText> {
        let bytes = self.package.data(&chapter.path)?;
        extract_chapter(&decode_document(bytes))
            .with_context(|| format!("parse chapter: {}", chapter.path))
    }
}

/// `<dir>/<stem>_translated.epub` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_string());
    input.with_file_name(format!("{stem}_translated.epub"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::testing::sample_epub;

    #[test]
    fn lists_chapters_in_spine_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("book.epub");
        sample_epub(&path);
        let book = EpubBook::open(&path).expect("open");
        let ids: Vec<String> = book.chapters().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, ["Text/ch1.xhtml", "Text/ch2.xhtml", "Text/ch3.xhtml"]);
        assert_eq!(book.chapters()[0].path, "OEBPS/Text/ch1.xhtml");
    }

    #[test]
    fn output_name_gets_suffix() {
        assert_eq!(
            default_output_path(Path::new("/books/novel.epub")),
            PathBuf::from("/books/novel_translated.epub")
        );
    }
}
