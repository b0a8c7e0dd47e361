use anyhow::{anyhow, Context};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::package::EpubPackage;

const CONTAINER_PATH: &str = "META-INF/container.xml";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    /// As written in the manifest, relative to the OPF file.
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn is_xhtml(&self) -> bool {
        matches!(
            self.media_type.trim(),
            "application/xhtml+xml" | "text/html"
        )
    }

    pub fn is_nav(&self) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|p| p.split_whitespace().any(|t| t == "nav"))
    }
}

#[derive(Clone, Debug, Default)]
pub struct OpfDocument {
    /// Zip path of the OPF file itself.
    pub path: String,
    pub title: Option<String>,
    pub manifest: Vec<ManifestItem>,
    pub spine: Vec<String>,
}

impl OpfDocument {
    /// Directory of the OPF inside the zip, with trailing slash (empty at root).
    pub fn base_dir(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[..=i],
            None => "",
        }
    }

    /// Zip path for a manifest href.
    pub fn resolve(&self, href: &str) -> String {
        let href = href.split('#').next().unwrap_or_default();
        normalize_path(&format!("{}{}", self.base_dir(), percent_decode(href)))
    }

    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|i| i.id == id)
    }

    pub fn item_by_href(&self, href: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|i| i.href == href)
    }

    /// Content documents in reading order, without the navigation document.
    /// Falls back to manifest order when the spine lists nothing usable.
    pub fn chapter_items(&self) -> Vec<&ManifestItem> {
        let keep = |i: &&ManifestItem| i.is_xhtml() && !i.is_nav();
        let from_spine: Vec<&ManifestItem> = self
            .spine
            .iter()
            .filter_map(|idref| self.item(idref))
            .filter(keep)
            .collect();
        if !from_spine.is_empty() {
            return from_spine;
        }
        self.manifest.iter().filter(keep).collect()
    }
}

pub fn locate_opf(pkg: &EpubPackage) -> anyhow::Result<OpfDocument> {
    let container = pkg.data(CONTAINER_PATH).context("epub without container.xml")?;
    let opf_path = parse_container_xml(container)?;
    let bytes = pkg
        .data(&opf_path)
        .with_context(|| format!("package document listed in container: {opf_path}"))?;
    let text = String::from_utf8_lossy(strip_bom(bytes));
    parse_opf(&opf_path, &text)
}

pub fn parse_container_xml(bytes: &[u8]) -> anyhow::Result<String> {
    let content = std::str::from_utf8(strip_bom(bytes)).context("container.xml is not utf-8")?;
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event().context("read container.xml")? {
            Event::Start(e) | Event::Empty(e) if local_name(e.name().as_ref()) == b"rootfile" => {
                if let Some(path) = attr(&e, b"full-path")? {
                    return Ok(path);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(anyhow!("no rootfile in container.xml"))
}

pub fn parse_opf(path: &str, content: &str) -> anyhow::Result<OpfDocument> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut doc = OpfDocument {
        path: path.to_string(),
        ..Default::default()
    };
    let mut in_title = false;
    let mut title = String::new();

    loop {
        match reader.read_event().context("read opf")? {
            Event::Start(e) | Event::Empty(e) => match local_name(e.name().as_ref()) {
                b"item" => {
                    let id = attr(&e, b"id")?.unwrap_or_default();
                    if id.is_empty() {
                        continue;
                    }
                    doc.manifest.push(ManifestItem {
                        id,
                        href: attr(&e, b"href")?.unwrap_or_default(),
                        media_type: attr(&e, b"media-type")?.unwrap_or_default(),
                        properties: attr(&e, b"properties")?,
                    });
                }
                b"itemref" => {
                    if let Some(idref) = attr(&e, b"idref")? {
                        doc.spine.push(idref);
                    }
                }
                b"title" if doc.title.is_none() => in_title = true,
                _ => {}
            },
            Event::Text(t) if in_title => {
                title.push_str(&t.unescape().unwrap_or_default());
            }
            Event::End(e) if in_title && local_name(e.name().as_ref()) == b"title" => {
                in_title = false;
                let t = title.trim();
                if !t.is_empty() {
                    doc.title = Some(t.to_string());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(doc)
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> anyhow::Result<Option<String>> {
    for a in e.attributes().flatten() {
        if local_name(a.key.as_ref()) == key {
            let v = a.unescape_value().context("attribute value")?;
            return Ok(Some(v.into_owned()));
        }
    }
    Ok(None)
}

pub fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data)
}

/// `dc:title` -> `title`.
pub fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
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

/// Resolves `.` and `..` segments of a zip path.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Path from the directory of `from` to `to`, both zip paths.
pub fn relative_path(from: &str, to: &str) -> String {
    let from_dir: Vec<&str> = match from.rfind('/') {
        Some(i) => from[..i].split('/').collect(),
        None => Vec::new(),
    };
    let to_parts: Vec<&str> = to.split('/').collect();
    let (to_dirs, to_file) = to_parts.split_at(to_parts.len() - 1);
    let common = from_dir
        .iter()
        .zip(to_dirs.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out: Vec<&str> = vec![".."; from_dir.len() - common];
    out.extend_from_slice(&to_dirs[common..]);
    out.extend_from_slice(to_file);
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>A &amp; B</dc:title>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c2" href="Text/ch%202.xhtml" media-type="application/xhtml+xml"/>
    <item id="c1" href="Text/ch1.xhtml" media-type="application/xhtml+xml"></item>
    <item id="css" href="Styles/main.css" media-type="text/css"/>
  </manifest>
  <spine>
    <itemref idref="nav"/>
    <itemref idref="c1"/>
    <itemref idref="c2"/>
  </spine>
</package>"#;

    #[test]
    fn container_points_at_opf() {
        let xml = br#"<?xml version="1.0"?><container><rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles></container>"#;
        assert_eq!(parse_container_xml(xml).expect("container"), "OEBPS/content.opf");
        assert!(parse_container_xml(b"<container/>").is_err());
    }

    #[test]
    fn chapters_follow_spine_and_skip_nav() {
        let doc = parse_opf("OEBPS/content.opf", OPF).expect("opf");
        assert_eq!(doc.title.as_deref(), Some("A & B"));
        let ids: Vec<&str> = doc.chapter_items().iter().map(|i| i.href.as_str()).collect();
        assert_eq!(ids, ["Text/ch1.xhtml", "Text/ch%202.xhtml"]);
        assert_eq!(doc.resolve("Text/ch%202.xhtml"), "OEBPS/Text/ch 2.xhtml");
    }

    #[test]
    fn empty_spine_falls_back_to_manifest() {
        let mut doc = parse_opf("content.opf", OPF).expect("opf");
        doc.spine.clear();
        assert_eq!(doc.chapter_items().len(), 2);
        assert_eq!(doc.base_dir(), "");
    }

    #[test]
    fn paths_resolve_and_relativize() {
        assert_eq!(normalize_path("OEBPS/Text/../style/a.css"), "OEBPS/style/a.css");
        assert_eq!(relative_path("OEBPS/Text/c1.xhtml", "OEBPS/style/default.css"), "../style/default.css");
        assert_eq!(relative_path("OEBPS/c1.xhtml", "OEBPS/style/default.css"), "style/default.css");
        assert_eq!(relative_path("c1.xhtml", "style/default.css"), "style/default.css");
    }
}
