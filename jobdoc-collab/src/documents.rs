//! Where seed text for new sessions comes from.
//!
//! The server never persists edits; it only asks a [`DocumentSource`] whether
//! a document exists and what its stored text is when the first participant
//! connects.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Lookup of job description documents by reference.
pub trait DocumentSource: Send + Sync {
    fn exists(&self, document_ref: &str) -> bool;

    /// Stored text of the document.
    ///
    /// An error means the document exists but its text cannot be loaded; the
    /// session must not be created from it.
    fn seed_text(&self, document_ref: &str) -> io::Result<String>;
}

/// Documents held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDocuments {
    documents: RwLock<HashMap<String, String>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, document_ref: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(document_ref, text);
        self
    }

    pub fn insert(&self, document_ref: impl Into<String>, text: impl Into<String>) {
        if let Ok(mut documents) = self.documents.write() {
            documents.insert(document_ref.into(), text.into());
        }
    }

    pub fn remove(&self, document_ref: &str) -> Option<String> {
        self.documents.write().ok()?.remove(document_ref)
    }
}

impl DocumentSource for InMemoryDocuments {
    fn exists(&self, document_ref: &str) -> bool {
        self.documents
            .read()
            .map(|d| d.contains_key(document_ref))
            .unwrap_or(false)
    }

    fn seed_text(&self, document_ref: &str) -> io::Result<String> {
        let documents = self
            .documents
            .read()
            .map_err(|_| io::Error::other("document table poisoned"))?;
        documents.get(document_ref).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no document {document_ref}"))
        })
    }
}

/// Accepts every reference and seeds sessions with an empty document.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyDocument;

impl DocumentSource for AnyDocument {
    fn exists(&self, _document_ref: &str) -> bool {
        true
    }

    fn seed_text(&self, _document_ref: &str) -> io::Result<String> {
        Ok(String::new())
    }
}

/// Documents stored as `<root>/<document_ref>.txt`.
///
/// References are limited to ASCII letters, digits, `-` and `_`, so a
/// reference can never name a path outside `root`.
#[derive(Debug, Clone)]
pub struct DirectoryDocuments {
    root: PathBuf,
}

impl DirectoryDocuments {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, document_ref: &str) -> Option<PathBuf> {
        let valid = !document_ref.is_empty()
            && document_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.root.join(format!("{document_ref}.txt")))
    }
}

impl DocumentSource for DirectoryDocuments {
    fn exists(&self, document_ref: &str) -> bool {
        self.path_for(document_ref).is_some_and(|p| p.is_file())
    }

    fn seed_text(&self, document_ref: &str) -> io::Result<String> {
        let path = self.path_for(document_ref).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid document reference {document_ref:?}"),
            )
        })?;
        std::fs::read_to_string(&path).inspect_err(|e| {
            log::warn!("Failed to read {}: {e}", path.display());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_documents() {
        let docs = InMemoryDocuments::new().with_document("job-1", "Senior Rust Engineer");
        assert!(docs.exists("job-1"));
        assert!(!docs.exists("job-2"));
        assert_eq!(docs.seed_text("job-1").unwrap(), "Senior Rust Engineer");
        assert!(docs.seed_text("job-2").is_err());

        docs.insert("job-2", "");
        assert!(docs.exists("job-2"));
        assert_eq!(docs.remove("job-1").as_deref(), Some("Senior Rust Engineer"));
        assert!(!docs.exists("job-1"));
    }

    #[test]
    fn test_any_document() {
        assert!(AnyDocument.exists("whatever"));
        assert_eq!(AnyDocument.seed_text("whatever").unwrap(), "");
    }

    #[test]
    fn test_directory_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job-42.txt"), "We are hiring.\n").unwrap();
        let docs = DirectoryDocuments::new(dir.path());

        assert!(docs.exists("job-42"));
        assert_eq!(docs.seed_text("job-42").unwrap(), "We are hiring.\n");
        assert!(!docs.exists("job-43"));
        assert_eq!(
            docs.seed_text("job-43").unwrap_err().kind(),
            std::io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_directory_unreadable_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job-7.txt"), [0xff, 0xfe, 0x00]).unwrap();
        let docs = DirectoryDocuments::new(dir.path());

        assert!(docs.exists("job-7"));
        assert!(docs.seed_text("job-7").is_err());
    }

    #[test]
    fn test_directory_rejects_path_like_refs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("job.txt"), "x").unwrap();
        let docs = DirectoryDocuments::new(dir.path());

        assert!(!docs.exists("nested/job"));
        assert!(!docs.exists("../job"));
        assert!(!docs.exists(""));
        assert_eq!(
            docs.seed_text("nested/job").unwrap_err().kind(),
            std::io::ErrorKind::InvalidInput
        );
    }
}
