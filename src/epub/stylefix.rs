use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use regex::Regex;

use super::opf::relative_path;
use super::rebuild::STYLESHEET_ID;
use super::{decode_document, EpubBook};

static HEAD_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(?:[a-z_][\w.-]*:)?head\s*>").expect("head end regex"));
static DEFAULT_CSS_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(?:[a-z_][\w.-]*:)?link\b[^>]*\bhref\s*=\s*["'][^"']*default\.css"#)
        .expect("stylesheet link regex")
});
static DECLARED_ENCODING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(<\?xml[^>]*?encoding\s*=\s*["'])[^"']*(["'])"#).expect("xml declaration regex")
});

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StyleFixReport {
    pub documents_scanned: usize,
    /// Paths inside the zip that gained a stylesheet link.
    pub fixed: Vec<String>,
    /// Written only when something was fixed.
    pub output: Option<PathBuf>,
}

/// `<dir>/<stem>_fixed.epub` next to the input.
pub fn default_fixed_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_string());
    input.with_file_name(format!("{stem}_fixed.epub"))
}

/// Links the shared `default.css` from every XHTML document whose head lacks it.
///
/// The book must already carry the stylesheet under the manifest id `style_default`.
pub fn fix_stylesheets(input: &Path, output: &Path) -> anyhow::Result<StyleFixReport> {
    let book = EpubBook::open(input)?;
    let style = book.opf.item(STYLESHEET_ID).ok_or_else(|| {
        anyhow!("{} has no `{STYLESHEET_ID}` stylesheet; nothing to link", input.display())
    })?;
    let css_path = book.opf.resolve(&style.href);

    let mut report = StyleFixReport::default();
    let mut replacements: HashMap<String, Vec<u8>> = HashMap::new();
    for item in book.opf.manifest.iter().filter(|i| i.is_xhtml()) {
        let path = book.opf.resolve(&item.href);
        if !book.package.contains(&path) {
            continue;
        }
        report.documents_scanned += 1;
        let text = decode_document(book.package.data(&path)?);
        if let Some(fixed) = link_stylesheet(&text, &relative_path(&path, &css_path)) {
            replacements.insert(path.clone(), fixed.into_bytes());
            report.fixed.push(path);
        }
    }

    if !report.fixed.is_empty() {
        book.package
            .write_with_changes(output, &replacements, &[])
            .with_context(|| format!("write fixed epub: {}", output.display()))?;
        report.output = Some(output.to_path_buf());
    }
    Ok(report)
}

/// Returns the document with a `<link>` to `css_href` appended to its head, or `None` when
/// the head already links `default.css` or there is no head.
fn link_stylesheet(xhtml: &str, css_href: &str) -> Option<String> {
    let head_end = HEAD_END_RE.find(xhtml)?;
    if DEFAULT_CSS_LINK_RE.is_match(&xhtml[..head_end.start()]) {
        return None;
    }
    let link = format!(
        "<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>\n",
        css_href.replace('&', "&amp;").replace('"', "&quot;")
    );
    let mut out = String::with_capacity(xhtml.len() + link.len());
    out.push_str(&xhtml[..head_end.start()]);
    out.push_str(&link);
    out.push_str(&xhtml[head_end.start()..]);
    // Written back as UTF-8 whatever the source declared.
    Some(DECLARED_ENCODING_RE.replace(&out, "${1}utf-8${2}").into_owned())
}
