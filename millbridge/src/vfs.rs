//! In-memory virtual file store backing the mock controller.
//!
//! The store maps absolute normalized paths to file records. It stands
//! in for the mill's SD card: uploads land here, downloads are served
//! from here, and the `ls`/`cat`/`mv`/`rm` console commands operate on
//! it. Nothing persists across runs; seed contents come from a JSON
//! document at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::md5_hex;

/// A single file in the virtual store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFile {
    /// Absolute normalized path.
    pub path: String,
    /// Size of `contents` in bytes.
    pub size: u64,
    /// Raw file contents.
    #[serde(with = "contents_as_string")]
    pub contents: Vec<u8>,
    /// Lowercase hex MD5 of `contents`.
    pub md5: String,
}

/// JSON stores contents as text; the record keeps bytes.
mod contents_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(de)?.into_bytes())
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name without the parent path.
    pub name: String,
    /// File size; `None` for directories.
    pub size: Option<u64>,
}

/// In-memory path → file mapping.
#[derive(Debug, Clone, Default)]
pub struct VirtualFileStore {
    files: BTreeMap<String, VirtualFile>,
}

/// Seed-file document shapes accepted at startup: a bare list, an
/// object with a `files` list, or a direct path → record mapping.
#[derive(Deserialize)]
#[serde(untagged)]
enum SeedDocument {
    List(Vec<SeedFile>),
    Wrapped { files: Vec<SeedFile> },
    Mapping(BTreeMap<String, SeedFile>),
}

#[derive(Deserialize)]
struct SeedFile {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    contents: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    md5: Option<String>,
}

impl VirtualFileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load seed files from a JSON document on disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Store(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Load seed files from a JSON string.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: SeedDocument = serde_json::from_str(text)?;
        let mut store = Self::new();

        let entries: Vec<(Option<String>, SeedFile)> = match doc {
            SeedDocument::List(list) | SeedDocument::Wrapped { files: list } => {
                list.into_iter().map(|f| (None, f)).collect()
            }
            SeedDocument::Mapping(map) => {
                map.into_iter().map(|(k, f)| (Some(k), f)).collect()
            }
        };

        for (key, seed) in entries {
            let path = seed
                .path
                .or(key)
                .ok_or_else(|| Error::Store("seed file without a path".to_string()))?;
            let contents = seed.contents.unwrap_or_default().into_bytes();
            let md5 = seed.md5.unwrap_or_else(|| md5_hex(&contents));
            let size = seed.size.unwrap_or(contents.len() as u64);
            let path = normalize_path("/", &path);
            store.files.insert(
                path.clone(),
                VirtualFile {
                    path,
                    size,
                    contents,
                    md5,
                },
            );
        }

        Ok(store)
    }

    /// The seed set shipped with the crate.
    pub fn builtin() -> Self {
        Self::from_json(include_str!("../artifacts/files.json"))
            .expect("embedded seed files are valid")
    }

    /// Whether a file exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Look up a file record.
    pub fn read(&self, path: &str) -> Option<&VirtualFile> {
        self.files.get(path)
    }

    /// Store raw bytes at `path`, computing size and MD5.
    pub fn write(&mut self, path: &str, contents: Vec<u8>) {
        let md5 = md5_hex(&contents);
        debug!("store write: {path} ({} bytes, md5 {md5})", contents.len());
        self.files.insert(
            path.to_string(),
            VirtualFile {
                path: path.to_string(),
                size: contents.len() as u64,
                contents,
                md5,
            },
        );
    }

    /// Store the result of an upload.
    ///
    /// Text uploads are stored verbatim. Binary payloads are stored
    /// base64-encoded under `<path>.b64` so the store stays printable.
    /// The recorded MD5 is always the digest of the raw bytes, which
    /// is what a later download handshake compares against.
    pub fn store_upload(&mut self, path: &str, raw: Vec<u8>) -> String {
        let md5 = md5_hex(&raw);
        let (stored_path, contents) = if std::str::from_utf8(&raw).is_ok() {
            (path.to_string(), raw)
        } else {
            (format!("{path}.b64"), BASE64.encode(&raw).into_bytes())
        };
        debug!(
            "store upload: {stored_path} ({} bytes, md5 {md5})",
            contents.len()
        );
        self.files.insert(
            stored_path.clone(),
            VirtualFile {
                path: stored_path.clone(),
                size: contents.len() as u64,
                contents,
                md5,
            },
        );
        stored_path
    }

    /// Remove a file.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::Store(format!("no such file: {path}")))
    }

    /// Move a file to a new path.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let mut file = self
            .files
            .remove(from)
            .ok_or_else(|| Error::Store(format!("no such file: {from}")))?;
        file.path = to.to_string();
        self.files.insert(to.to_string(), file);
        Ok(())
    }

    /// List the entries directly under `path`.
    ///
    /// Directories have no records of their own; they exist implicitly
    /// as path segments of the files beneath them.
    pub fn list_dir(&self, path: &str) -> Vec<DirEntry> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        let mut entries: Vec<DirEntry> = Vec::new();
        for (file_path, file) in &self.files {
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                None => entries.push(DirEntry {
                    name: rest.to_string(),
                    size: Some(file.size),
                }),
                Some((dir, _)) => {
                    let name = format!("{dir}/");
                    if entries.iter().all(|e| e.name != name) {
                        entries.push(DirEntry { name, size: None });
                    }
                }
            }
        }
        entries
    }

    /// Number of files in the store.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate over all files in path order.
    pub fn iter(&self) -> impl Iterator<Item = &VirtualFile> {
        self.files.values()
    }
}

/// Join `path` onto the absolute `cwd` and collapse it lexically.
///
/// `.` and empty segments disappear, `..` pops (stopping at the root),
/// and repeated separators collapse. There are no symlinks in the
/// virtual store, so lexical resolution is exact.
pub fn normalize_path(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cwd}/{path}")
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative_paths() {
        assert_eq!(normalize_path("/", "foo"), "/foo");
        assert_eq!(normalize_path("/foo", "bar.nc"), "/foo/bar.nc");
        assert_eq!(normalize_path("/foo", "../bar"), "/bar");
        assert_eq!(normalize_path("/foo/baz", "./a/./b"), "/foo/baz/a/b");
    }

    #[test]
    fn test_normalize_absolute_paths() {
        assert_eq!(normalize_path("/anywhere", "/sd/gcodes"), "/sd/gcodes");
        assert_eq!(normalize_path("/x", "//sd///gcodes/"), "/sd/gcodes");
        assert_eq!(normalize_path("/x", "/a/b/../../c"), "/c");
    }

    #[test]
    fn test_normalize_does_not_escape_root() {
        assert_eq!(normalize_path("/", "../../.."), "/");
        assert_eq!(normalize_path("/a", "../../b"), "/b");
    }

    #[test]
    fn test_write_and_read() {
        let mut store = VirtualFileStore::new();
        store.write("/sd/part.nc", b"G0 X0\nG1 X10\n".to_vec());

        let file = store.read("/sd/part.nc").unwrap();
        assert_eq!(file.size, 13);
        assert_eq!(file.md5, md5_hex(b"G0 X0\nG1 X10\n"));
        assert!(store.exists("/sd/part.nc"));
        assert!(!store.exists("/sd/other.nc"));
    }

    #[test]
    fn test_store_upload_text() {
        let mut store = VirtualFileStore::new();
        let stored = store.store_upload("/sd/a.txt", b"plain text".to_vec());
        assert_eq!(stored, "/sd/a.txt");
        let file = store.read("/sd/a.txt").unwrap();
        assert_eq!(file.contents, b"plain text");
        assert_eq!(file.md5, md5_hex(b"plain text"));
    }

    #[test]
    fn test_store_upload_binary_gets_b64_suffix() {
        let mut store = VirtualFileStore::new();
        let raw = vec![0x00, 0xFF, 0xFE, 0x80];
        let stored = store.store_upload("/sd/blob.bin", raw.clone());
        assert_eq!(stored, "/sd/blob.bin.b64");

        let file = store.read("/sd/blob.bin.b64").unwrap();
        assert_eq!(file.contents, BASE64.encode(&raw).into_bytes());
        // MD5 is of the raw payload, not the encoded text.
        assert_eq!(file.md5, md5_hex(&raw));
    }

    #[test]
    fn test_delete_and_rename() {
        let mut store = VirtualFileStore::new();
        store.write("/a", b"1".to_vec());
        store.rename("/a", "/b").unwrap();
        assert!(!store.exists("/a"));
        assert_eq!(store.read("/b").unwrap().path, "/b");

        store.delete("/b").unwrap();
        assert!(store.is_empty());
        assert!(store.delete("/b").is_err());
        assert!(store.rename("/nope", "/x").is_err());
    }

    #[test]
    fn test_list_dir() {
        let mut store = VirtualFileStore::new();
        store.write("/sd/gcodes/a.nc", b"a".to_vec());
        store.write("/sd/gcodes/b.nc", b"bb".to_vec());
        store.write("/sd/config.txt", b"cfg".to_vec());

        let root = store.list_dir("/");
        assert_eq!(root, vec![DirEntry { name: "sd/".to_string(), size: None }]);

        let sd = store.list_dir("/sd");
        assert_eq!(sd.len(), 2);
        assert!(sd.contains(&DirEntry { name: "config.txt".to_string(), size: Some(3) }));
        assert!(sd.contains(&DirEntry { name: "gcodes/".to_string(), size: None }));

        let gcodes = store.list_dir("/sd/gcodes");
        assert_eq!(gcodes.len(), 2);
        assert_eq!(gcodes[0].size, Some(1));
    }

    #[test]
    fn test_seed_document_list_shape() {
        let store = VirtualFileStore::from_json(
            r#"[{"path": "/sd/a.nc", "contents": "G0 X1\n"}]"#,
        )
        .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.read("/sd/a.nc").unwrap().size, 6);
    }

    #[test]
    fn test_seed_document_wrapped_shape() {
        let store = VirtualFileStore::from_json(
            r#"{"files": [{"path": "/sd/a.nc", "contents": "x", "md5": "feedface"}]}"#,
        )
        .unwrap();
        // An explicit md5 wins over the computed one.
        assert_eq!(store.read("/sd/a.nc").unwrap().md5, "feedface");
    }

    #[test]
    fn test_seed_document_mapping_shape() {
        let store = VirtualFileStore::from_json(
            r#"{"/sd/a.nc": {"contents": "hello"}, "/sd/b.nc": {"contents": "world"}}"#,
        )
        .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read("/sd/b.nc").unwrap().contents, b"world");
    }

    #[test]
    fn test_builtin_seed_loads() {
        let store = VirtualFileStore::builtin();
        assert!(!store.is_empty());
    }
}
