use async_trait::async_trait;
use strom_model::FileRecord;

use crate::error::Result;

/// Flush once this many records have accumulated.
pub const MAX_BATCH_FILES: usize = 1000;
/// Or once the batch is roughly this large.
pub const MAX_BATCH_BYTES: usize = 1 << 20;

/// Destination of a batch flush. Commit errors unwind the producing scan.
#[async_trait]
pub trait BatchSink: Send {
    async fn commit(&mut self, records: Vec<FileRecord>) -> Result<()>;
}

/// Buffers index updates so commits happen in chunks instead of per entry.
#[derive(Default)]
pub struct FileBatch {
    records: Vec<FileRecord>,
    bytes: usize,
}

impl FileBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: FileRecord) {
        // Rough in-memory weight; exact accounting is not worth the bookkeeping.
        self.bytes += record.name.len() + 128;
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= MAX_BATCH_FILES || self.bytes >= MAX_BATCH_BYTES
    }

    pub async fn flush_if_full(&mut self, sink: &mut (dyn BatchSink + Send)) -> Result<()> {
        if self.is_full() {
            self.flush(sink).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self, sink: &mut (dyn BatchSink + Send)) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.records);
        self.bytes = 0;
        sink.commit(records).await
    }
}
