//! VFS entries and subtree summaries.

use std::collections::BTreeMap;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use plakar_types::Mac;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Device,
}

/// Stat-like attributes captured at scan time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub nlink: u64,
    pub device: u64,
    pub inode: u64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub groupname: String,
}

/// Extended attribute; large values live in their own `XATTR` blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XattrRef {
    pub name: String,
    pub size: u64,
    pub blob: Mac,
}

/// Rolled-up statistics of one subtree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub devices: u64,
    pub size: u64,
    pub min_size: u64,
    pub max_size: u64,
    /// Sum of per-file mean entropies; divide by `files` for the average.
    pub entropy_total: f64,
    /// MIME category -> file count.
    pub mime_categories: BTreeMap<String, u64>,
    pub errors: u64,
}

impl Summary {
    pub fn record_file(&mut self, size: u64, entropy: f64, category: &str) {
        self.files += 1;
        self.size += size;
        if self.files == 1 || size < self.min_size {
            self.min_size = size;
        }
        if size > self.max_size {
            self.max_size = size;
        }
        self.entropy_total += entropy;
        *self.mime_categories.entry(category.to_string()).or_insert(0) += 1;
    }

    /// Fold a child subtree into this one.
    pub fn merge(&mut self, child: &Summary) {
        if child.files > 0 {
            if self.files == 0 || child.min_size < self.min_size {
                self.min_size = child.min_size;
            }
            if child.max_size > self.max_size {
                self.max_size = child.max_size;
            }
        }
        self.files += child.files;
        self.directories += child.directories;
        self.symlinks += child.symlinks;
        self.devices += child.devices;
        self.size += child.size;
        self.entropy_total += child.entropy_total;
        for (category, count) in &child.mime_categories {
            *self.mime_categories.entry(category.clone()).or_insert(0) += count;
        }
        self.errors += child.errors;
    }

    pub fn mean_entropy(&self) -> f64 {
        if self.files == 0 {
            0.0
        } else {
            self.entropy_total / self.files as f64
        }
    }
}

/// One directory or file entry inside a snapshot tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub name: String,
    pub path: String,
    pub stat: FileStat,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub link_target: Option<String>,
    /// Content object for regular files.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub object: Option<Mac>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub xattrs: Vec<XattrRef>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub classifications: Vec<String>,
    /// Present on directories only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<Summary>,
}

impl Entry {
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn resource(&self) -> plakar_types::ResourceType {
        match self.kind {
            EntryKind::Directory => plakar_types::ResourceType::Directory,
            _ => plakar_types::ResourceType::File,
        }
    }
}

/// Shannon entropy over a byte frequency table, in bits per byte.
pub fn shannon_entropy(counts: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let mut entropy = 0.0;
    for &count in counts.iter() {
        if count == 0 {
            continue;
        }
        let p = count as f64 / total as f64;
        entropy -= p * p.log2();
    }
    entropy
}

/// Coarse MIME category derived from the file name.
pub fn mime_category(name: &str) -> &'static str {
    let extension = name.rsplit('.').next().unwrap_or("").to_lowercase();
    match extension.as_str() {
        "txt" | "md" | "csv" | "log" | "json" | "xml" | "yaml" | "yml" | "toml" | "ini"
        | "conf" | "html" | "htm" | "css" => "text",
        "c" | "h" | "cc" | "cpp" | "rs" | "go" | "py" | "js" | "ts" | "sh" | "pl" | "rb"
        | "java" | "sql" => "code",
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "svg" | "webp" | "tiff" | "ico" => "image",
        "mp3" | "wav" | "flac" | "ogg" | "aac" | "m4a" => "audio",
        "mp4" | "mkv" | "avi" | "mov" | "webm" | "wmv" => "video",
        "zip" | "tar" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar" | "ptar" => "archive",
        "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "odt" | "ods" => "document",
        _ => "binary",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn summary_rollup() {
        let mut parent = Summary::default();
        parent.record_file(100, 4.0, "text");

        let mut child = Summary::default();
        child.record_file(10, 2.0, "text");
        child.record_file(1000, 6.0, "image");
        child.directories = 1;

        parent.merge(&child);
        assert_eq!(parent.files, 3);
        assert_eq!(parent.size, 1110);
        assert_eq!(parent.min_size, 10);
        assert_eq!(parent.max_size, 1000);
        assert_eq!(parent.mime_categories["text"], 2);
        assert!((parent.mean_entropy() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn entropy_bounds() {
        let mut counts = [0u64; 256];
        counts[0] = 1000;
        assert_eq!(shannon_entropy(&counts, 1000), 0.0);

        let uniform = [4u64; 256];
        let entropy = shannon_entropy(&uniform, 1024);
        assert!((entropy - 8.0).abs() < 1e-9);
    }

    #[test]
    fn entry_json_round_trip() -> Result<(), Error> {
        let entry = Entry {
            kind: EntryKind::File,
            name: "dummy.txt".into(),
            path: "/subdir/dummy.txt".into(),
            stat: FileStat {
                mode: 0o644,
                size: 11,
                ..Default::default()
            },
            link_target: None,
            object: Some(Mac::new([9; 32])),
            xattrs: Vec::new(),
            classifications: Vec::new(),
            summary: None,
        };
        let parsed = Entry::deserialize(&entry.serialize()?)?;
        assert_eq!(parsed.path, "/subdir/dummy.txt");
        assert_eq!(parsed.object, entry.object);
        Ok(())
    }
}
