use std::io::Write;
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub fn write_epub(path: &Path, files: &[(&str, &str)]) {
    let f = std::fs::File::create(path).expect("create epub");
    let mut z = ZipWriter::new(f);
    for (name, body) in files {
        let method = if *name == "mimetype" {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        z.start_file(*name, SimpleFileOptions::default().compression_method(method))
            .expect("start file");
        z.write_all(body.as_bytes()).expect("write file");
    }
    z.finish().expect("finish epub");
}

pub const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

pub const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="id">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>Sample</dc:title></metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ch1" href="Text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="Text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch3" href="Text/ch3.xhtml" media-type="application/xhtml+xml"/>
    <item id="pic" href="Images/p.png" media-type="image/png"/>
  </manifest>
  <spine>
    <itemref idref="nav"/>
    <itemref idref="ch1"/>
    <itemref idref="ch2"/>
    <itemref idref="ch3"/>
  </spine>
</package>"#;

pub fn page(title: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>{title}</title></head><body>{body}</body></html>"
    )
}

/// Three chapters plus a navigation document; the first chapter carries an image.
pub fn sample_epub(path: &Path) {
    let ch1 = page(
        "一",
        r#"<h1>第一章</h1><p>彼は歩いた。</p><img src="../Images/p.png" alt="pic"/><p>終わり。</p>"#,
    );
    let ch2 = page("二", "<h1>第二章</h1><p>雨が降った。</p>");
    let ch3 = page("三", "<h1>第三章</h1><p>朝が来た。</p>");
    let nav = page("nav", "<nav><ol><li>1</li></ol></nav>");
    write_epub(
        path,
        &[
            ("mimetype", "application/epub+zip"),
            ("META-INF/container.xml", CONTAINER),
            ("OEBPS/content.opf", OPF),
            ("OEBPS/nav.xhtml", nav.as_str()),
            ("OEBPS/Text/ch1.xhtml", ch1.as_str()),
            ("OEBPS/Text/ch2.xhtml", ch2.as_str()),
            ("OEBPS/Text/ch3.xhtml", ch3.as_str()),
            ("OEBPS/Images/p.png", "png"),
        ],
    );
}
