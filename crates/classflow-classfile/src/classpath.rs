//! Class-path resolution: directories and jar archives
//!
//! An ordered list of sources consulted first-hit-wins. A source is either
//! a filesystem root (`a/b/C` resolves to `<root>/a/b/C.class`) or a jar
//! archive whose central directory is indexed once at registration and
//! whose entries are inflated on demand.

use classflow_core::ClassLoader;
use flate2::read::DeflateDecoder;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClassPathError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("bad archive {path}: {reason}")]
    BadArchive { path: PathBuf, reason: String },
}

const STORED: u16 = 0;
const DEFLATED: u16 = 8;

#[derive(Debug, Clone, Copy)]
struct ZipEntry {
    method: u16,
    local_offset: usize,
    compressed_size: usize,
}

/// A jar archive held in memory with an index over its central directory.
#[derive(Debug)]
struct Archive {
    path: PathBuf,
    data: Vec<u8>,
    entries: HashMap<String, ZipEntry>,
}

fn le_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*data.get(pos)?, *data.get(pos + 1)?]))
}

fn le_u32(data: &[u8], pos: usize) -> Option<u32> {
    Some(u32::from_le_bytes([
        *data.get(pos)?,
        *data.get(pos + 1)?,
        *data.get(pos + 2)?,
        *data.get(pos + 3)?,
    ]))
}

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_SIGNATURE: u32 = 0x0403_4b50;

impl Archive {
    fn open(path: PathBuf) -> Result<Self, ClassPathError> {
        let data = fs::read(&path)?;
        let bad = |reason: &str| ClassPathError::BadArchive {
            path: path.clone(),
            reason: reason.to_string(),
        };

        // The end-of-central-directory record sits within the trailing
        // comment span; scan backwards for its signature.
        let eocd = (0..=data.len().saturating_sub(22))
            .rev()
            .find(|&pos| le_u32(&data, pos) == Some(EOCD_SIGNATURE))
            .ok_or_else(|| bad("no end-of-central-directory record"))?;
        let count = le_u16(&data, eocd + 10).ok_or_else(|| bad("truncated record"))? as usize;
        let mut pos = le_u32(&data, eocd + 16).ok_or_else(|| bad("truncated record"))? as usize;

        let mut entries = HashMap::with_capacity(count);
        for _ in 0..count {
            if le_u32(&data, pos) != Some(CENTRAL_SIGNATURE) {
                return Err(bad("bad central directory entry"));
            }
            let method = le_u16(&data, pos + 10).ok_or_else(|| bad("truncated entry"))?;
            let compressed_size =
                le_u32(&data, pos + 20).ok_or_else(|| bad("truncated entry"))? as usize;
            let name_len = le_u16(&data, pos + 28).ok_or_else(|| bad("truncated entry"))? as usize;
            let extra_len = le_u16(&data, pos + 30).ok_or_else(|| bad("truncated entry"))? as usize;
            let comment_len =
                le_u16(&data, pos + 32).ok_or_else(|| bad("truncated entry"))? as usize;
            let local_offset =
                le_u32(&data, pos + 42).ok_or_else(|| bad("truncated entry"))? as usize;
            let name_bytes = data
                .get(pos + 46..pos + 46 + name_len)
                .ok_or_else(|| bad("truncated entry name"))?;
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            entries.insert(
                name,
                ZipEntry {
                    method,
                    local_offset,
                    compressed_size,
                },
            );
            pos += 46 + name_len + extra_len + comment_len;
        }
        Ok(Self { path, data, entries })
    }

    fn read(&self, entry_name: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(entry_name)?;
        if le_u32(&self.data, entry.local_offset) != Some(LOCAL_SIGNATURE) {
            warn!(archive = %self.path.display(), entry = entry_name, "bad local header");
            return None;
        }
        let name_len = le_u16(&self.data, entry.local_offset + 26)? as usize;
        let extra_len = le_u16(&self.data, entry.local_offset + 28)? as usize;
        let start = entry.local_offset + 30 + name_len + extra_len;
        let raw = self.data.get(start..start + entry.compressed_size)?;
        match entry.method {
            STORED => Some(raw.to_vec()),
            DEFLATED => {
                let mut out = Vec::new();
                match DeflateDecoder::new(raw).read_to_end(&mut out) {
                    Ok(_) => Some(out),
                    Err(err) => {
                        warn!(
                            archive = %self.path.display(),
                            entry = entry_name,
                            error = %err,
                            "failed to inflate entry"
                        );
                        None
                    }
                }
            }
            other => {
                warn!(
                    archive = %self.path.display(),
                    entry = entry_name,
                    method = other,
                    "unsupported compression method"
                );
                None
            }
        }
    }
}

/// One registered lookup root.
#[derive(Debug)]
enum ClassSource {
    Directory(PathBuf),
    Archive(Archive),
}

impl ClassSource {
    fn open_class(&self, class_name: &str) -> Option<Vec<u8>> {
        match self {
            ClassSource::Directory(root) => {
                let mut path = root.clone();
                for part in class_name.split('/') {
                    path.push(part);
                }
                path.set_extension("class");
                debug!(path = %path.display(), "looking up class file");
                fs::read(&path).ok()
            }
            ClassSource::Archive(archive) => {
                let entry = format!("{class_name}.class");
                debug!(archive = %archive.path.display(), entry, "looking up archive entry");
                archive.read(&entry)
            }
        }
    }
}

/// Ordered class search path.
#[derive(Debug, Default)]
pub struct ClassPath {
    sources: Vec<ClassSource>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_directory(&mut self, root: impl Into<PathBuf>) {
        self.sources.push(ClassSource::Directory(root.into()));
    }

    pub fn add_archive(&mut self, path: impl Into<PathBuf>) -> Result<(), ClassPathError> {
        self.sources.push(ClassSource::Archive(Archive::open(path.into())?));
        Ok(())
    }

    /// Register a path, dispatching on whether it is a directory or an
    /// archive file.
    pub fn add_entry(&mut self, path: impl AsRef<Path>) -> Result<(), ClassPathError> {
        let path = path.as_ref();
        if path.is_dir() {
            self.add_directory(path);
            Ok(())
        } else {
            self.add_archive(path)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Resolve an internal (slash-separated) class name to its bytes,
    /// first registered source wins.
    pub fn open_class(&self, class_name: &str) -> Option<Vec<u8>> {
        self.sources.iter().find_map(|s| s.open_class(class_name))
    }
}

impl ClassLoader for ClassPath {
    fn open(&self, class_name: &str) -> Option<Vec<u8>> {
        self.open_class(class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    struct ZipBuilder {
        data: Vec<u8>,
        central: Vec<u8>,
        count: u16,
    }

    impl ZipBuilder {
        fn new() -> Self {
            Self {
                data: Vec::new(),
                central: Vec::new(),
                count: 0,
            }
        }

        fn entry(&mut self, name: &str, contents: &[u8], deflate: bool) {
            let local_offset = self.data.len() as u32;
            let (method, payload) = if deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(contents).unwrap();
                (DEFLATED, encoder.finish().unwrap())
            } else {
                (STORED, contents.to_vec())
            };

            // local file header
            self.data.extend_from_slice(&LOCAL_SIGNATURE.to_le_bytes());
            self.data.extend_from_slice(&20u16.to_le_bytes()); // version
            self.data.extend_from_slice(&0u16.to_le_bytes()); // flags
            self.data.extend_from_slice(&method.to_le_bytes());
            self.data.extend_from_slice(&[0; 4]); // time, date
            self.data.extend_from_slice(&[0; 4]); // crc (unchecked)
            self.data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            self.data.extend_from_slice(&(contents.len() as u32).to_le_bytes());
            self.data.extend_from_slice(&(name.len() as u16).to_le_bytes());
            self.data.extend_from_slice(&0u16.to_le_bytes()); // extra
            self.data.extend_from_slice(name.as_bytes());
            self.data.extend_from_slice(&payload);

            // central directory entry
            self.central.extend_from_slice(&CENTRAL_SIGNATURE.to_le_bytes());
            self.central.extend_from_slice(&20u16.to_le_bytes()); // made by
            self.central.extend_from_slice(&20u16.to_le_bytes()); // needed
            self.central.extend_from_slice(&0u16.to_le_bytes()); // flags
            self.central.extend_from_slice(&method.to_le_bytes());
            self.central.extend_from_slice(&[0; 4]); // time, date
            self.central.extend_from_slice(&[0; 4]); // crc
            self.central.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            self.central.extend_from_slice(&(contents.len() as u32).to_le_bytes());
            self.central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            self.central.extend_from_slice(&0u16.to_le_bytes()); // extra
            self.central.extend_from_slice(&0u16.to_le_bytes()); // comment
            self.central.extend_from_slice(&0u16.to_le_bytes()); // disk
            self.central.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            self.central.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            self.central.extend_from_slice(&local_offset.to_le_bytes());
            self.central.extend_from_slice(name.as_bytes());
            self.count += 1;
        }

        fn finish(mut self) -> Vec<u8> {
            let cd_offset = self.data.len() as u32;
            let cd_size = self.central.len() as u32;
            self.data.extend_from_slice(&self.central);
            self.data.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
            self.data.extend_from_slice(&0u16.to_le_bytes()); // disk
            self.data.extend_from_slice(&0u16.to_le_bytes()); // cd disk
            self.data.extend_from_slice(&self.count.to_le_bytes());
            self.data.extend_from_slice(&self.count.to_le_bytes());
            self.data.extend_from_slice(&cd_size.to_le_bytes());
            self.data.extend_from_slice(&cd_offset.to_le_bytes());
            self.data.extend_from_slice(&0u16.to_le_bytes()); // comment
            self.data
        }
    }

    #[test]
    fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg").join("sub");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("Demo.class"), [1, 2, 3]).unwrap();

        let mut cp = ClassPath::new();
        cp.add_directory(dir.path());
        assert_eq!(cp.open_class("pkg/sub/Demo"), Some(vec![1, 2, 3]));
        assert_eq!(cp.open_class("pkg/sub/Missing"), None);
    }

    #[test]
    fn test_archive_source_stored_and_deflated() {
        let mut zip = ZipBuilder::new();
        zip.entry("pkg/Stored.class", b"stored bytes", false);
        zip.entry("pkg/Packed.class", b"packed bytes that deflate down", true);
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("lib.jar");
        fs::write(&jar, zip.finish()).unwrap();

        let mut cp = ClassPath::new();
        cp.add_archive(&jar).unwrap();
        assert_eq!(cp.open_class("pkg/Stored"), Some(b"stored bytes".to_vec()));
        assert_eq!(
            cp.open_class("pkg/Packed"),
            Some(b"packed bytes that deflate down".to_vec())
        );
        assert_eq!(cp.open_class("pkg/Missing"), None);
    }

    #[test]
    fn test_first_source_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for (dir, payload) in [(&first, b"one"), (&second, b"two")] {
            let pkg = dir.path().join("pkg");
            fs::create_dir_all(&pkg).unwrap();
            fs::write(pkg.join("Demo.class"), payload).unwrap();
        }

        let mut cp = ClassPath::new();
        cp.add_entry(first.path()).unwrap();
        cp.add_entry(second.path()).unwrap();
        assert_eq!(cp.open_class("pkg/Demo"), Some(b"one".to_vec()));
    }

    #[test]
    fn test_garbage_archive_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("broken.jar");
        fs::write(&jar, b"not a zip at all").unwrap();
        let mut cp = ClassPath::new();
        assert!(matches!(
            cp.add_archive(&jar),
            Err(ClassPathError::BadArchive { .. })
        ));
    }
}
