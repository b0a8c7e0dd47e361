use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{anyhow, Context};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// All entries of an EPUB container, kept in archive order so `mimetype` stays first.
pub struct EpubPackage {
    pub entries: Vec<EpubEntry>,
}

pub struct EpubEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub compression: CompressionMethod,
    pub last_modified: zip::DateTime,
    pub unix_mode: Option<u32>,
    pub is_dir: bool,
}

impl EpubPackage {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let f = File::open(path).with_context(|| format!("open epub: {}", path.display()))?;
        let mut zip = ZipArchive::new(f).context("read zip")?;
        let mut entries = Vec::new();
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).context("zip entry")?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data).context("read zip entry")?;
            entries.push(EpubEntry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }
        Ok(Self { entries })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn data(&self, name: &str) -> anyhow::Result<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.data.as_slice())
            .ok_or_else(|| anyhow!("missing epub entry: {name}"))
    }

    /// Writes a copy with some entries replaced and new files appended at the end.
    pub fn write_with_changes(
        &self,
        output_path: &Path,
        replacements: &HashMap<String, Vec<u8>>,
        additions: &[(String, Vec<u8>)],
    ) -> anyhow::Result<()> {
        let f = File::create(output_path)
            .with_context(|| format!("create output epub: {}", output_path.display()))?;
        let mut zout = ZipWriter::new(f);
        for ent in &self.entries {
            let data = replacements.get(&ent.name).unwrap_or(&ent.data);
            // Readers require the mimetype entry uncompressed.
            let compression = if ent.name == "mimetype" {
                CompressionMethod::Stored
            } else {
                ent.compression
            };
            let mut opts = SimpleFileOptions::default()
                .compression_method(compression)
                .last_modified_time(ent.last_modified);
            if let Some(mode) = ent.unix_mode {
                opts = opts.unix_permissions(mode);
            }
            if ent.is_dir || ent.name.ends_with('/') {
                zout.add_directory(ent.name.as_str(), opts)
                    .with_context(|| format!("add zip dir: {}", ent.name))?;
            } else {
                zout.start_file(ent.name.as_str(), opts)
                    .with_context(|| format!("start zip file: {}", ent.name))?;
                zout.write_all(data)
                    .with_context(|| format!("write zip file: {}", ent.name))?;
            }
        }
        for (name, data) in additions {
            if self.contains(name) {
                continue;
            }
            let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            zout.start_file(name.as_str(), opts)
                .with_context(|| format!("start zip file: {name}"))?;
            zout.write_all(data)
                .with_context(|| format!("write zip file: {name}"))?;
        }
        zout.finish().context("finish zip")?;
        Ok(())
    }
}
