use anyhow::Context;
use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::bytes::Regex;

use super::opf::local_name;
use crate::sentinels::image_placeholder;

static DECLARED_ENCODING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:encoding|charset)\s*=\s*["']?([A-Za-z0-9._:-]+)"#)
        .expect("declared encoding regex")
});

const BLOCK_TAGS: &[&[u8]] = &[
    b"p", b"div", b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"li", b"ul", b"ol", b"blockquote",
    b"br", b"hr", b"tr", b"td", b"th", b"table", b"section", b"article", b"header", b"footer",
    b"aside", b"pre", b"dt", b"dd", b"figure", b"figcaption",
];

const SKIP_TAGS: &[&[u8]] = &[b"script", b"style", b"noscript"];

/// Text-level view of one chapter document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChapterText {
    /// `<title>` from the head.
    pub title: Option<String>,
    /// First `<h1>` in the body.
    pub heading: Option<String>,
    /// Body text, one block per line, images replaced by placeholder lines.
    pub text: String,
    /// Serialized image tags in placeholder order.
    pub images: Vec<String>,
    /// Text of every `<p>` in document order, empty ones included.
    pub paragraphs: Vec<String>,
}

/// Decodes a content document honouring a BOM, then a declared charset, then UTF-8.
pub fn decode_document(bytes: &[u8]) -> String {
    if let Some((enc, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = enc.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    let head = &bytes[..bytes.len().min(1024)];
    let enc = DECLARED_ENCODING_RE
        .captures(head)
        .and_then(|c| c.get(1))
        .and_then(|m| Encoding::for_label(m.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _) = enc.decode_without_bom_handling(bytes);
    text.into_owned()
}

#[derive(Default)]
struct Walker {
    out: ChapterText,
    lines: Vec<String>,
    line: String,
    in_body: bool,
    skip_depth: usize,
    title: Option<String>,
    heading: Option<String>,
    para: Option<String>,
}

impl Walker {
    fn flush_line(&mut self) {
        let l = self.line.trim();
        if !l.is_empty() {
            self.lines.push(l.to_string());
        }
        self.line.clear();
    }

    fn text(&mut self, t: &str) {
        if self.skip_depth > 0 {
            return;
        }
        if let Some(title) = self.title.as_mut() {
            append_collapsed(title, t);
        }
        if !self.in_body {
            return;
        }
        append_collapsed(&mut self.line, t);
        if let Some(h) = self.heading.as_mut() {
            append_collapsed(h, t);
        }
        if let Some(p) = self.para.as_mut() {
            append_collapsed(p, t);
        }
    }

    fn image(&mut self, e: &BytesStart<'_>) {
        let tag = if local_name(e.name().as_ref()) == b"img" {
            format!("<{}/>", String::from_utf8_lossy(e).trim_end_matches('/').trim_end())
        } else {
            // SVG <image>: keep it displayable as a plain <img>.
            let href = e
                .attributes()
                .flatten()
                .find(|a| local_name(a.key.as_ref()) == b"href")
                .map(|a| String::from_utf8_lossy(&a.value).into_owned())
                .unwrap_or_default();
            format!(r#"<img src="{href}" alt=""/>"#)
        };
        self.flush_line();
        self.lines.push(image_placeholder(self.out.images.len()));
        self.out.images.push(tag);
    }

    fn start(&mut self, e: &BytesStart<'_>, empty: bool) {
        let qname = e.name();
        let name = local_name(qname.as_ref());
        if SKIP_TAGS.contains(&name) {
            if !empty {
                self.skip_depth += 1;
            }
            return;
        }
        match name {
            b"body" => self.in_body = true,
            b"title" if !self.in_body && self.out.title.is_none() && !empty => {
                self.title = Some(String::new())
            }
            b"img" | b"image" if self.in_body && self.skip_depth == 0 => self.image(e),
            _ => {}
        }
        if !self.in_body || self.skip_depth > 0 {
            return;
        }
        if BLOCK_TAGS.contains(&name) {
            self.flush_line();
            if let Some(p) = self.para.as_mut() {
                append_collapsed(p, " ");
            }
        }
        if empty {
            return;
        }
        if name == b"h1" && self.out.heading.is_none() && self.heading.is_none() {
            self.heading = Some(String::new());
        }
        if name == b"p" {
            self.para = Some(String::new());
        }
    }

    fn end(&mut self, name: &[u8]) {
        let name = local_name(name);
        if SKIP_TAGS.contains(&name) {
            self.skip_depth = self.skip_depth.saturating_sub(1);
            return;
        }
        match name {
            b"title" => {
                if let Some(t) = self.title.take() {
                    self.out.title = Some(t.trim().to_string()).filter(|t| !t.is_empty());
                }
            }
            b"body" => {
                self.flush_line();
                self.in_body = false;
            }
            b"h1" => {
                if let Some(h) = self.heading.take() {
                    self.out.heading = Some(h.trim().to_string()).filter(|h| !h.is_empty());
                }
            }
            b"p" => {
                if let Some(p) = self.para.take() {
                    self.out.paragraphs.push(p.trim().to_string());
                }
            }
            _ => {}
        }
        if self.in_body && BLOCK_TAGS.contains(&name) {
            self.flush_line();
        }
    }
}

pub fn extract_chapter(xhtml: &str) -> anyhow::Result<ChapterText> {
    let mut reader = Reader::from_str(xhtml);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut w = Walker::default();
    loop {
        match reader.read_event().context("read xhtml")? {
            Event::Start(e) => w.start(&e, false),
            Event::Empty(e) => w.start(&e, true),
            Event::End(e) => w.end(e.name().as_ref()),
            Event::Text(t) => {
                let text = match t.unescape_with(html_entity) {
                    Ok(s) => s.into_owned(),
                    Err(_) => String::from_utf8_lossy(&t).into_owned(),
                };
                w.text(&text);
            }
            Event::CData(t) => w.text(&String::from_utf8_lossy(&t)),
            Event::Eof => break,
            _ => {}
        }
    }
    w.flush_line();
    let mut out = w.out;
    out.text = w.lines.join("\n");
    Ok(out)
}

fn append_collapsed(buf: &mut String, t: &str) {
    for ch in t.chars() {
        if ch.is_whitespace() {
            if !buf.is_empty() && !buf.ends_with(' ') {
                buf.push(' ');
            }
        } else {
            buf.push(ch);
        }
    }
}

/// Named HTML entities that show up in ebook XHTML but are not predefined in XML.
fn html_entity(name: &str) -> Option<&'static str> {
    let s = match name {
        "lt" => "<",
        "gt" => ">",
        "amp" => "&",
        "apos" => "'",
        "quot" => "\"",
        "nbsp" => "\u{a0}",
        "ensp" => "\u{2002}",
        "emsp" => "\u{2003}",
        "thinsp" => "\u{2009}",
        "shy" => "\u{ad}",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "hellip" => "\u{2026}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "laquo" => "\u{ab}",
        "raquo" => "\u{bb}",
        "middot" => "\u{b7}",
        "bull" => "\u{2022}",
        "copy" => "\u{a9}",
        "reg" => "\u{ae}",
        "trade" => "\u{2122}",
        "deg" => "\u{b0}",
        "times" => "\u{d7}",
        "eacute" => "\u{e9}",
        "egrave" => "\u{e8}",
        "agrave" => "\u{e0}",
        "ccedil" => "\u{e7}",
        "uuml" => "\u{fc}",
        "ouml" => "\u{f6}",
        "auml" => "\u{e4}",
        _ => return None,
    };
    Some(s)
}
