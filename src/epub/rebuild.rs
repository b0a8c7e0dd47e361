use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use regex::Regex;

use super::opf::relative_path;
use super::EpubBook;
use crate::sentinels::placeholder_index;

pub const STYLESHEET_ID: &str = "style_default";
/// Relative to the OPF directory.
pub const STYLESHEET_HREF: &str = "style/default.css";

pub const STYLESHEET_CSS: &str = "body { font-family: serif; line-height: 1.6; margin: 5px; }
h1 { text-align: center; font-weight: bold; page-break-before: always; margin-top: 2em; margin-bottom: 2em; }
p { text-align: justify; text-indent: 1.5em; margin-top: 0; margin-bottom: 0; }
img { max-width: 100%; height: auto; display: block; margin-left: auto; margin-right: auto; padding-top: 1em; padding-bottom: 1em; }
";

static MANIFEST_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</(?:[A-Za-z_][\w.-]*:)?manifest\s*>").expect("manifest end regex"));
static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*\n]+?)\*\*").expect("bold regex"));
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+?)\*").expect("italic regex"));

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub replaced: usize,
    pub stylesheet_added: bool,
}

/// Generates the XHTML page for one translated chapter.
///
/// A first line of the form `**Title**` becomes the heading; otherwise `fallback_title`
/// names the page. Placeholder lines bring back the stored image tags.
pub fn render_chapter_xhtml(
    translated: &str,
    images: &[String],
    fallback_title: Option<&str>,
    css_href: &str,
) -> String {
    let lines: Vec<&str> = translated.trim().lines().collect();
    let mut body = String::new();
    let mut title = fallback_title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Chapter")
        .to_string();
    let mut rest = lines.as_slice();

    if let Some(first) = lines.first().map(|l| l.trim()) {
        if first.len() > 4 && first.starts_with("**") && first.ends_with("**") {
            title = first.trim_matches(|c| c == '*' || c == ' ').to_string();
            body.push_str(&format!("<h1>{}</h1>\n", escape_text(&title)));
            rest = &lines[1..];
        }
    }

    for line in rest {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match placeholder_index(line).and_then(|i| images.get(i)) {
            Some(tag) => {
                body.push_str(tag);
                body.push('\n');
            }
            None => {
                body.push_str(&format!("<p>{}</p>\n", inline_markup(line)));
            }
        }
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
<!DOCTYPE html>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
<head>\n<title>{}</title>\n<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>\n</head>\n\
<body>\n{body}</body>\n</html>\n",
        escape_text(&title),
        escape_attr(css_href)
    )
}

/// Inserts a manifest `<item>` just before the closing manifest tag.
pub fn add_manifest_item(opf_xml: &str, id: &str, href: &str, media_type: &str) -> anyhow::Result<String> {
    let end = MANIFEST_END_RE
        .find(opf_xml)
        .ok_or_else(|| anyhow!("package document has no </manifest>"))?;
    let item = format!(
        "  <item id=\"{}\" href=\"{}\" media-type=\"{}\"/>\n",
        escape_attr(id),
        escape_attr(href),
        escape_attr(media_type)
    );
    let mut out = String::with_capacity(opf_xml.len() + item.len());
    out.push_str(&opf_xml[..end.start()]);
    out.push_str(&item);
    out.push_str(&opf_xml[end.start()..]);
    Ok(out)
}

/// Writes `output` with every translated chapter replaced and the shared stylesheet in place.
pub fn rebuild_epub(
    book: &EpubBook,
    translations: &HashMap<String, String>,
    images: &HashMap<String, Vec<String>>,
    output: &Path,
) -> anyhow::Result<RebuildSummary> {
    let css_path = book.opf.resolve(STYLESHEET_HREF);
    let mut replacements: HashMap<String, Vec<u8>> = HashMap::new();
    let mut additions: Vec<(String, Vec<u8>)> = Vec::new();
    let mut summary = RebuildSummary::default();

    for ch in book.chapters() {
        let Some(text) = translations.get(&ch.id) else {
            continue;
        };
        let original = book
            .read_chapter(&ch)
            .with_context(|| format!("read chapter {}", ch.id))?;
        let chapter_images = images.get(&ch.id).map(Vec::as_slice).unwrap_or_default();
        let xhtml = render_chapter_xhtml(
            text,
            chapter_images,
            original.title.as_deref(),
            &relative_path(&ch.path, &css_path),
        );
        replacements.insert(ch.path.clone(), xhtml.into_bytes());
        summary.replaced += 1;
    }

    if summary.replaced > 0 && book.opf.item_by_href(STYLESHEET_HREF).is_none() {
        if !book.package.contains(&css_path) {
            additions.push((css_path.clone(), STYLESHEET_CSS.as_bytes().to_vec()));
        }
        let mut id = STYLESHEET_ID.to_string();
        let mut n = 1;
        while book.opf.item(&id).is_some() {
            id = format!("{STYLESHEET_ID}_{n}");
            n += 1;
        }
        let opf_text = String::from_utf8_lossy(book.package.data(&book.opf.path)?).into_owned();
        let opf_text = add_manifest_item(&opf_text, &id, STYLESHEET_HREF, "text/css")?;
        replacements.insert(book.opf.path.clone(), opf_text.into_bytes());
        summary.stylesheet_added = true;
    }

    book.package
        .write_with_changes(output, &replacements, &additions)
        .with_context(|| format!("write translated epub: {}", output.display()))?;
    Ok(summary)
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

fn inline_markup(line: &str) -> String {
    let escaped = escape_text(line);
    let bold = BOLD_RE.replace_all(&escaped, "<strong>$1</strong>");
    ITALIC_RE.replace_all(&bold, "<em>$1</em>").into_owned()
}
