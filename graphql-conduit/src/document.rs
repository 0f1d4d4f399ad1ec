//! Resolution of GraphQL documents by name.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;

/// Error types raised while resolving a named GraphQL document.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum DocumentError {
    /// no document found for name '{name}'
    NotFound {
        /// The name that was requested.
        name: String,
    },

    /// could not read document '{name}': {source}
    Io {
        /// The name that was requested.
        name: String,

        /// The underlying filesystem error.
        source: std::io::Error,
    },
}

/// A source of GraphQL documents addressed by name.
///
/// Lets call sites say `client.document_name("hero-by-episode")` instead of
/// embedding operation text at every call site.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Resolve the document registered under `name`.
    async fn resolve(&self, name: &str) -> Result<String, DocumentError>;
}

/// Resolves documents from files under a root directory.
///
/// `<root>/<name><extension>` is probed for each configured extension in
/// order; the first file that exists wins. Files are read on every
/// resolution, there is no caching.
pub struct FileDocumentSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FileDocumentSource {
    /// A source probing `<root>/<name>.graphql` then `<root>/<name>.gql`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_extensions(root, vec![".graphql".to_string(), ".gql".to_string()])
    }

    /// A source probing the given extensions (leading dot included), in
    /// order.
    pub fn with_extensions(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        FileDocumentSource {
            root: root.into(),
            extensions,
        }
    }
}

#[async_trait]
impl DocumentSource for FileDocumentSource {
    async fn resolve(&self, name: &str) -> Result<String, DocumentError> {
        for extension in &self.extensions {
            let candidate = self.root.join(format!("{name}{extension}"));
            match tokio::fs::read_to_string(&candidate).await {
                Ok(document) => {
                    tracing::trace!(
                        document = name,
                        path = %candidate.display(),
                        "resolved document",
                    );
                    return Ok(document);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(DocumentError::Io {
                        name: name.to_string(),
                        source: err,
                    });
                }
            }
        }
        Err(DocumentError::NotFound {
            name: name.to_string(),
        })
    }
}

/// Resolves documents from an in-memory map.
#[derive(Default)]
pub struct StaticDocumentSource {
    documents: HashMap<String, String>,
}

impl StaticDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document under a name, replacing any previous one.
    pub fn with_document(mut self, name: impl Into<String>, document: impl Into<String>) -> Self {
        self.documents.insert(name.into(), document.into());
        self
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn resolve(&self, name: &str) -> Result<String, DocumentError> {
        self.documents
            .get(name)
            .cloned()
            .ok_or_else(|| DocumentError::NotFound {
                name: name.to_string(),
            })
    }
}
