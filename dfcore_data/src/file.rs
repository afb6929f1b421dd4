//! [`File`], [`Writer`], and [`Reader`] (C2): an ordered, append-only
//! Block sequence produced by exactly one writer and consumed by zero or
//! more readers (§3.2, §4.2).

use std::collections::VecDeque;
use std::marker::PhantomData;

use dfcore_block::{Block, BlockPool, PinnedBlock};
use dfcore_error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::trace;

use crate::varint::{read_varint, varint_len, write_varint};

struct Inner {
    blocks: VecDeque<Block>,
    total_bytes: u64,
    total_items: u64,
    closed: bool,
}

/// An ordered sequence of [`Block`]s. Cheap to clone; clones share the
/// same underlying block list (§3.2).
#[derive(Clone)]
pub struct File {
    inner: Arc<Mutex<Inner>>,
}

impl File {
    pub fn new() -> Self {
        File {
            inner: Arc::new(Mutex::new(Inner {
                blocks: VecDeque::new(),
                total_bytes: 0,
                total_items: 0,
                closed: false,
            })),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn total_items(&self) -> u64 {
        self.inner.lock().total_items
    }

    pub fn num_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Opens a typed, non-destructive reader: all emitted blocks remain
    /// on the file and can be re-read by another `keep` reader.
    pub fn open_keep_reader<T: DeserializeOwned>(&self, pool: BlockPool) -> Reader<T> {
        Reader::new(self.clone(), pool, false)
    }

    /// Opens a typed, destructive reader: each block is dropped from the
    /// file (and its bytes released back to the pool) as it is exhausted.
    pub fn open_consume_reader<T: DeserializeOwned>(&self, pool: BlockPool) -> Reader<T> {
        Reader::new(self.clone(), pool, true)
    }

    fn push_block(&self, block: Block, items: u64) {
        let mut inner = self.inner.lock();
        inner.total_bytes += block.len() as u64;
        inner.total_items += items;
        inner.blocks.push_back(block);
    }

    fn mark_closed(&self) {
        self.inner.lock().closed = true;
    }

    fn block_at(&self, index: usize) -> Option<Block> {
        self.inner.lock().blocks.get(index).cloned()
    }

    fn pop_front_if_consumed(&self, expect: &Block) {
        let mut inner = self.inner.lock();
        if let Some(front) = inner.blocks.front() {
            if front.id() == expect.id() {
                inner.blocks.pop_front();
            }
        }
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

struct CurrentBlock {
    block: Block,
    pinned: PinnedBlock,
    /// Items fully written (both started and completed) in this block so far.
    items_completed: u64,
    first_item_offset: Option<usize>,
}

/// Serializes typed items into a [`File`]'s blocks, resuming item
/// boundaries across blocks transparently (§4.2 contract).
pub struct Writer<T> {
    pool: BlockPool,
    file: File,
    current: Option<CurrentBlock>,
    closed: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> Writer<T> {
    pub fn new(file: File, pool: BlockPool) -> Self {
        Writer {
            pool,
            file,
            current: None,
            closed: false,
            _marker: PhantomData,
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    async fn ensure_current(&mut self) -> Result<()> {
        if self.current.is_none() {
            let block = self.pool.allocate_block().await?;
            let pinned = self.pool.pin(&block).await?;
            self.current = Some(CurrentBlock {
                block,
                pinned,
                items_completed: 0,
                first_item_offset: None,
            });
        }
        Ok(())
    }

    /// Finalizes the current block (pushing it onto the file) and drops
    /// its pin, making it swap-eligible again.
    fn finalize_current(&mut self) {
        if let Some(cur) = self.current.take() {
            let items = cur.items_completed;
            drop(cur.pinned);
            self.file.push_block(cur.block, items);
        }
    }

    /// Serializes and appends one item. Items larger than the block
    /// capacity are split across consecutive blocks; the reader
    /// reassembles them transparently.
    pub async fn push(&mut self, item: &T) -> Result<()> {
        if self.closed {
            return Err(Error::logic("push into closed writer"));
        }
        let payload = bincode::serialize(item)
            .map_err(|e| Error::serialization_mismatch(e.to_string()))?;
        let mut record = Vec::with_capacity(varint_len(payload.len() as u64) + payload.len());
        write_varint(payload.len() as u64, &mut record);
        record.extend_from_slice(&payload);

        self.write_record(&record).await
    }

    async fn write_record(&mut self, record: &[u8]) -> Result<()> {
        let capacity = self.pool.block_size();
        let mut written = 0usize;
        let mut started_in_current = false;
        let mut start_offset_in_block = 0usize;

        self.ensure_current().await?;

        while written < record.len() {
            let cur = self.current.as_ref().expect("ensured above");
            let remaining = cur.block.remaining_capacity(capacity);

            if remaining == 0 {
                self.finalize_current();
                self.ensure_current().await?;
                started_in_current = false;
                continue;
            }

            if !started_in_current {
                let cur = self.current.as_ref().expect("ensured above");
                start_offset_in_block = cur.block.len();
                started_in_current = true;
            }

            let chunk_len = remaining.min(record.len() - written);
            let chunk = &record[written..written + chunk_len];
            written += chunk_len;

            let completes_here = written == record.len();
            let cur = self.current.as_mut().expect("ensured above");
            let completes_items = if completes_here { 1 } else { 0 };
            let first_item_offset = if completes_here && cur.items_completed == 0 {
                Some(start_offset_in_block)
            } else {
                None
            };

            cur.block
                .write_item_bytes(&cur.pinned, chunk, completes_items, first_item_offset);

            if completes_here {
                cur.items_completed += 1;
                if cur.first_item_offset.is_none() {
                    cur.first_item_offset = Some(start_offset_in_block);
                }
            }

            if cur.block.remaining_capacity(capacity) == 0 {
                self.finalize_current();
                if written < record.len() {
                    self.ensure_current().await?;
                    started_in_current = false;
                }
            }
        }
        Ok(())
    }

    /// Emits any partially filled block and marks the file complete.
    /// Idempotent-unsafe: calling `close` twice is a [`Error::Logic`].
    pub async fn close(mut self) -> Result<File> {
        if self.closed {
            return Err(Error::logic("double close of writer"));
        }
        self.closed = true;
        self.finalize_current();
        self.file.mark_closed();
        trace!(bytes = self.file.total_bytes(), items = self.file.total_items(), "file closed");
        Ok(self.file)
    }
}

/// Non-destructive ("keep") vs. destructive ("consume") read mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Keep,
    Consume,
}

/// Reads typed items back out of a [`File`] in writer append order,
/// reassembling items that straddled block boundaries (§4.2).
pub struct Reader<T> {
    pool: BlockPool,
    file: File,
    mode: ReadMode,
    next_index: usize,
    current: Option<(Block, PinnedBlock)>,
    cursor: usize,
    carry: Vec<u8>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Reader<T> {
    fn new(file: File, pool: BlockPool, consume: bool) -> Self {
        Reader {
            pool,
            file,
            mode: if consume { ReadMode::Consume } else { ReadMode::Keep },
            next_index: 0,
            current: None,
            cursor: 0,
            carry: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    async fn advance_block(&mut self) -> Result<bool> {
        if let Some((block, pinned)) = self.current.take() {
            drop(pinned);
            if self.mode == ReadMode::Consume {
                self.file.pop_front_if_consumed(&block);
            } else {
                self.next_index += 1;
            }
        }

        let next_block = match self.mode {
            ReadMode::Consume => self.file.block_at(0),
            ReadMode::Keep => self.file.block_at(self.next_index),
        };

        let Some(block) = next_block else {
            return Ok(false);
        };

        let pinned = self.pool.pin(&block).await?;
        self.current = Some((block, pinned));
        self.cursor = 0;
        Ok(true)
    }

    /// Returns the next item, or `None` once every block has been
    /// exhausted and no partial record remains.
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if self.current.is_none() && !self.advance_block().await? {
                return self.end_of_stream();
            }

            let (_, pinned) = self.current.as_ref().expect("just ensured");
            let cursor = self.cursor;
            let mut appended = Vec::new();
            pinned.with_bytes(|bytes| {
                if cursor < bytes.len() {
                    appended.extend_from_slice(&bytes[cursor..]);
                }
            });
            self.cursor += appended.len();
            self.carry.extend_from_slice(&appended);

            if let Some((len, header_bytes)) = read_varint(&self.carry) {
                let total = header_bytes + len as usize;
                if self.carry.len() >= total {
                    let payload = self.carry[header_bytes..total].to_vec();
                    self.carry.drain(..total);
                    let item: T = bincode::deserialize(&payload)
                        .map_err(|e| Error::serialization_mismatch(e.to_string()))?;
                    return Ok(Some(item));
                }
            }

            // Not enough bytes yet for a full record; this block is fully
            // drained, so `advance_block` must run now, while `self.current`
            // still holds it, to perform its index-bump / pop-front.
            if !self.advance_block().await? {
                return self.end_of_stream();
            }
        }
    }

    fn end_of_stream(&self) -> Result<Option<T>> {
        if self.carry.is_empty() {
            Ok(None)
        } else {
            Err(Error::protocol("file ended with a truncated record"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfcore_config::Configuration;

    fn pool(block_size: usize) -> BlockPool {
        let cfg = Configuration {
            block_size,
            ram_limit: 64 * 1024 * 1024,
            workdir: std::env::temp_dir(),
            ..Configuration::default()
        };
        BlockPool::new(cfg)
    }

    #[tokio::test]
    async fn write_then_keep_read_round_trips() {
        let pool = pool(4096);
        let file = File::new();
        let mut writer: Writer<String> = Writer::new(file.clone(), pool.clone());
        for s in ["alpha", "beta", "gamma"] {
            writer.push(&s.to_string()).await.unwrap();
        }
        let file = writer.close().await.unwrap();

        let mut reader: Reader<String> = file.open_keep_reader(pool);
        let mut out = Vec::new();
        while let Some(item) = reader.next().await.unwrap() {
            out.push(item);
        }
        assert_eq!(out, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn items_larger_than_block_split_and_reassemble() {
        // Tiny blocks force every item to straddle several blocks.
        let pool = pool(8);
        let file = File::new();
        let mut writer: Writer<Vec<u8>> = Writer::new(file.clone(), pool.clone());
        let big = vec![7u8; 500];
        writer.push(&big).await.unwrap();
        writer.push(&vec![9u8; 10]).await.unwrap();
        let file = writer.close().await.unwrap();
        assert!(file.num_blocks() > 10);

        let mut reader: Reader<Vec<u8>> = file.open_keep_reader(pool);
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first, vec![7u8; 500]);
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second, vec![9u8; 10]);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keep_reader_can_be_replayed_by_a_second_reader() {
        let pool = pool(4096);
        let file = File::new();
        let mut writer: Writer<i32> = Writer::new(file.clone(), pool.clone());
        for i in 0..20 {
            writer.push(&i).await.unwrap();
        }
        let file = writer.close().await.unwrap();

        let mut r1: Reader<i32> = file.open_keep_reader(pool.clone());
        let mut r2: Reader<i32> = file.open_keep_reader(pool);
        let mut v1 = Vec::new();
        let mut v2 = Vec::new();
        while let Some(x) = r1.next().await.unwrap() {
            v1.push(x);
        }
        while let Some(x) = r2.next().await.unwrap() {
            v2.push(x);
        }
        assert_eq!(v1, v2);
        assert_eq!(v1, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn consume_reader_drops_blocks_as_it_reads() {
        let pool = pool(64);
        let file = File::new();
        let mut writer: Writer<i64> = Writer::new(file.clone(), pool.clone());
        for i in 0..50 {
            writer.push(&i).await.unwrap();
        }
        let file = writer.close().await.unwrap();
        let blocks_before = file.num_blocks();
        assert!(blocks_before > 1);

        let mut reader: Reader<i64> = file.open_consume_reader(pool);
        let mut out = Vec::new();
        while let Some(x) = reader.next().await.unwrap() {
            out.push(x);
        }
        assert_eq!(out, (0..50).collect::<Vec<_>>());
        assert_eq!(file.num_blocks(), 0);
    }

    #[tokio::test]
    async fn push_after_close_is_a_logic_error() {
        let pool = pool(4096);
        let mut writer: Writer<i32> = Writer::new(File::new(), pool.clone());
        writer.push(&1).await.unwrap();
        writer.closed = true;
        let err = writer.push(&2).await.unwrap_err();
        assert!(matches!(err, Error::Logic(_)));
    }
}
