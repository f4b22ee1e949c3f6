//! In-memory file metadata provider
//!
//! Stands in for the namespace service when running standalone and in
//! tests.

use crate::domain::ports::{FileAttributes, FileMetadataProvider};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// File id → attributes map
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    files: RwLock<HashMap<String, FileAttributes>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_id: impl Into<String>, attributes: FileAttributes) {
        self.files.write().insert(file_id.into(), attributes);
    }

    pub fn remove(&self, file_id: &str) -> Option<FileAttributes> {
        self.files.write().remove(file_id)
    }
}

#[async_trait]
impl FileMetadataProvider for InMemoryMetadata {
    async fn file_attributes(&self, file_id: &str) -> Result<FileAttributes> {
        self.files
            .read()
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::FileNotFound {
                file_id: file_id.to_string(),
            })
    }
}
