// src/index/memory.rs
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SurfaceResult;

use super::{AssetDocument, IndexSink};

/// Keeps documents in memory; used for dry runs and tests
#[derive(Default)]
pub struct MemorySink {
    documents: Mutex<Vec<AssetDocument>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<AssetDocument> {
        self.documents.lock().clone()
    }

    /// Number of `index` calls received
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl IndexSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn index(&self, documents: &[AssetDocument]) -> SurfaceResult<usize> {
        *self.writes.lock() += 1;
        self.documents.lock().extend_from_slice(documents);
        Ok(documents.len())
    }
}
