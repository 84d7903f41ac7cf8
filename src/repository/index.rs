// src/repository/index.rs

//! Repository index generation
//!
//! `XmlIndexer` writes `eopkg-index.xml` describing every package in the
//! repository together with the deltas leading to it, an xz-compressed copy,
//! and a `.sha256sum` file for each.

use crate::db::RepoDatabase;
use crate::db::models::Artifact;
use crate::delta::parse_delta_name;
use crate::error::{Error, Result};
use crate::pool::sha256_file;
use crate::repository::layout::{INDEX_PREFIX, shard};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Builds the index of one repository
pub trait Indexer {
    /// Write the index files into `repo_dir`, returning the main index path
    fn build_index(&self, repo_dir: &Path, db: &RepoDatabase) -> Result<PathBuf>;
}

/// Writes `eopkg-index.xml` and its compressed and checksum companions
#[derive(Debug, Clone, Default)]
pub struct XmlIndexer;

struct DeltaEntry {
    from_release: u32,
    uri: String,
    size: u64,
}

impl XmlIndexer {
    fn relative_uri(artifact_source: &str, filename: &str) -> String {
        format!("{}/{}/{}", shard(artifact_source), artifact_source, filename)
    }

    fn deltas_for(repo_dir: &Path, artifact: &Artifact) -> Result<Vec<DeltaEntry>> {
        let dir = repo_dir.join(shard(&artifact.source_name)).join(&artifact.source_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut deltas = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::io("Failed to read", &dir, e))? {
            let entry = entry.map_err(|e| Error::io("Failed to read", &dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_delta_name(&name, &artifact.package_name) else {
                continue;
            };
            if parsed.to_release != artifact.release
                || parsed.architecture != artifact.architecture
                || parsed.distribution_release != artifact.distribution_release
            {
                continue;
            }
            let size = entry
                .metadata()
                .map_err(|e| Error::io("Failed to stat", &entry.path(), e))?
                .len();
            deltas.push(DeltaEntry {
                from_release: parsed.from_release,
                uri: Self::relative_uri(&artifact.source_name, &name),
                size,
            });
        }

        deltas.sort_by(|a, b| b.from_release.cmp(&a.from_release));
        Ok(deltas)
    }

    fn render(repo_dir: &Path, db: &RepoDatabase) -> Result<Vec<u8>> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
        Self::write_document(&mut writer, repo_dir, db)?;
        let mut xml = writer.into_inner();
        xml.push(b'\n');
        Ok(xml)
    }

    fn write_document(writer: &mut Writer<Vec<u8>>, repo_dir: &Path, db: &RepoDatabase) -> Result<()> {
        xml(writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None))))?;
        xml(writer.write_event(Event::Start(BytesStart::new("PISI"))))?;

        for artifact in db.artifacts() {
            let path = repo_dir
                .join(shard(&artifact.source_name))
                .join(&artifact.source_name)
                .join(&artifact.filename);
            let size = fs::metadata(&path)
                .map_err(|e| Error::io("Failed to stat", &path, e))?
                .len();
            let hash = match &artifact.sha256 {
                Some(hash) => hash.clone(),
                None => sha256_file(&path)?,
            };

            xml(writer.write_event(Event::Start(BytesStart::new("Package"))))?;
            text_element(writer, "Name", &artifact.package_name)?;

            xml(writer.write_event(Event::Start(BytesStart::new("Source"))))?;
            text_element(writer, "Name", &artifact.source_name)?;
            xml(writer.write_event(Event::End(BytesEnd::new("Source"))))?;

            xml(writer.write_event(Event::Start(BytesStart::new("History"))))?;
            let release = artifact.release.to_string();
            let mut update = BytesStart::new("Update");
            update.push_attribute(("release", release.as_str()));
            xml(writer.write_event(Event::Start(update)))?;
            text_element(writer, "Version", &artifact.version)?;
            xml(writer.write_event(Event::End(BytesEnd::new("Update"))))?;
            xml(writer.write_event(Event::End(BytesEnd::new("History"))))?;

            text_element(writer, "Architecture", &artifact.architecture)?;
            text_element(writer, "DistributionRelease", &artifact.distribution_release)?;
            text_element(
                writer,
                "PackageURI",
                &Self::relative_uri(&artifact.source_name, &artifact.filename),
            )?;
            text_element(writer, "PackageSize", &size.to_string())?;
            text_element(writer, "PackageHash", &hash)?;

            let deltas = Self::deltas_for(repo_dir, artifact)?;
            if !deltas.is_empty() {
                xml(writer.write_event(Event::Start(BytesStart::new("DeltaPackages"))))?;
                for delta in deltas {
                    let from = delta.from_release.to_string();
                    let mut start = BytesStart::new("Delta");
                    start.push_attribute(("releaseFrom", from.as_str()));
                    xml(writer.write_event(Event::Start(start)))?;
                    text_element(writer, "PackageURI", &delta.uri)?;
                    text_element(writer, "PackageSize", &delta.size.to_string())?;
                    xml(writer.write_event(Event::End(BytesEnd::new("Delta"))))?;
                }
                xml(writer.write_event(Event::End(BytesEnd::new("DeltaPackages"))))?;
            }

            xml(writer.write_event(Event::End(BytesEnd::new("Package"))))?;
        }

        xml(writer.write_event(Event::End(BytesEnd::new("PISI"))))?;
        Ok(())
    }
}

fn xml<T>(result: quick_xml::Result<T>) -> Result<T> {
    result.map_err(|e| Error::IndexError(format!("Failed to write index XML: {}", e)))
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> Result<()> {
    xml(writer.write_event(Event::Start(BytesStart::new(name))))?;
    xml(writer.write_event(Event::Text(BytesText::new(value))))?;
    xml(writer.write_event(Event::End(BytesEnd::new(name))))?;
    Ok(())
}

fn write_checksum(path: &Path) -> Result<()> {
    let sum_path = PathBuf::from(format!("{}.sha256sum", path.display()));
    let hash = sha256_file(path)?;
    fs::write(&sum_path, hash).map_err(|e| Error::io("Failed to write", &sum_path, e))
}

impl Indexer for XmlIndexer {
    fn build_index(&self, repo_dir: &Path, db: &RepoDatabase) -> Result<PathBuf> {
        let index_path = repo_dir.join(format!("{}.xml", INDEX_PREFIX));
        let xz_path = repo_dir.join(format!("{}.xml.xz", INDEX_PREFIX));

        info!("Indexing {} ({} packages)", repo_dir.display(), db.len());
        let document = Self::render(repo_dir, db)?;
        fs::write(&index_path, &document).map_err(|e| Error::io("Failed to write", &index_path, e))?;

        let file = File::create(&xz_path).map_err(|e| Error::io("Failed to create", &xz_path, e))?;
        let mut encoder = xz2::write::XzEncoder::new(BufWriter::new(file), 6);
        encoder
            .write_all(&document)
            .map_err(|e| Error::io("Failed to write", &xz_path, e))?;
        encoder
            .finish()
            .and_then(|mut w| w.flush())
            .map_err(|e| Error::io("Failed to write", &xz_path, e))?;

        write_checksum(&index_path)?;
        write_checksum(&xz_path)?;

        debug!("Wrote {}", index_path.display());
        Ok(index_path)
    }
}
