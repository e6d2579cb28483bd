//! Cheap fingerprints of external state.
//!
//! A [`Signature`] stands for "the inputs this payload was computed from".
//! Equal signatures mean interchangeable payloads; nothing here reads file
//! contents, only metadata.

use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use super::hash;

/// Comparable fingerprint of the state a payload was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signature {
    /// The source file does not exist or could not be stat-ed.
    Missing,
    /// File modification time and size.
    File { mtime_ns: i64, size: u64 },
    /// Logical version counter supplied by the caller.
    Version(u64),
    /// Several signatures combined in a fixed order.
    Composite(Vec<Signature>),
    /// A signature tagged with the name of what it describes.
    Named { name: String, inner: Box<Signature> },
}

impl Signature {
    pub fn version(counter: u64) -> Self {
        Signature::Version(counter)
    }

    pub fn composite(parts: impl IntoIterator<Item = Signature>) -> Self {
        Signature::Composite(parts.into_iter().collect())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Signature::Missing)
    }

    /// Compact JSON encoding, stable for equal signatures.
    pub fn to_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("null"))
    }

    /// SHA-256 hex digest of the compact JSON encoding.
    pub fn hash(&self) -> String {
        hash::signature_hash(&self.to_compact_json())
    }
}

impl From<(i64, i64)> for Signature {
    fn from((mtime_ns, size): (i64, i64)) -> Self {
        Signature::File { mtime_ns, size: size.max(0) as u64 }
    }
}

/// Signature of a single file: `(mtime_ns, size)`, or `Missing`.
pub fn file_signature(path: impl AsRef<Path>) -> Signature {
    let Ok(meta) = std::fs::metadata(path.as_ref()) else {
        return Signature::Missing;
    };
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    Signature::File { mtime_ns, size: meta.len() }
}

/// Composite of the file signatures of `paths`, in argument order.
pub fn composite_signature<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Signature {
    Signature::Composite(paths.into_iter().map(file_signature).collect())
}

/// Signature over the `limit` most recently modified files in `dir` with the
/// given extension. Ordered newest first, ties broken by file name.
pub fn recent_files_signature(dir: impl AsRef<Path>, extension: &str, limit: usize) -> Signature {
    let Ok(entries) = std::fs::read_dir(dir.as_ref()) else {
        return Signature::Missing;
    };

    let mut files: Vec<(String, Signature)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == extension))
        .filter(|entry| entry.file_type().is_ok_and(|ft| ft.is_file()))
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), file_signature(entry.path())))
        .collect();

    files.sort_by(|(name_a, sig_a), (name_b, sig_b)| {
        mtime_of(sig_b).cmp(&mtime_of(sig_a)).then_with(|| name_a.cmp(name_b))
    });
    files.truncate(limit);

    Signature::Composite(
        files
            .into_iter()
            .map(|(name, inner)| Signature::Named { name, inner: Box::new(inner) })
            .collect(),
    )
}

fn mtime_of(sig: &Signature) -> i64 {
    match sig {
        Signature::File { mtime_ns, .. } => *mtime_ns,
        _ => i64::MIN,
    }
}
