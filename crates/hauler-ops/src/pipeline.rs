//! Overlapped block pipeline for copying one file.
//!
//! Eight buffers cycle through reads and writes so that reading the next
//! block overlaps with writing the previous one. Bytes are credited to the
//! [`OperationStatus`] only when the contiguous durably-written prefix grows,
//! so a pipeline resumed after an error never counts a byte twice.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use thiserror::Error;
use tracing::debug;

use crate::control::JobControl;
use crate::fs::{begin_read, begin_write, disk_full, FileHandle, IoCompletion, IoRequest};
use crate::status::OperationStatus;

/// Number of buffers cycling through the pipeline.
pub const PIPELINE_BLOCKS: usize = 8;
/// At most this many reads, and separately this many writes, are in flight.
const MAX_IN_FLIGHT: usize = PIPELINE_BLOCKS / 2;

/// Which file an I/O error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IoSide {
    #[strum(serialize = "read")]
    Source,
    #[strum(serialize = "write")]
    Target,
}

/// Errors from the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Buffers could not be allocated or no runtime is available; use the
    /// synchronous loop instead.
    #[error("cannot set up asynchronous copy")]
    Allocation,

    /// An I/O error; `offset` is the durable prefix to resume from.
    #[error("{side} error at offset {offset}: {source}")]
    Io {
        side: IoSide,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Life cycle of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BlockState {
    Free,
    Reading,
    /// Reading past the expected end to confirm it.
    TestingEof,
    /// Holds data waiting to be written.
    Read,
    Writing,
    /// Turned out to lie beyond the end of the file.
    Discarded,
}

/// Number of blocks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub free: usize,
    pub reading: usize,
    pub testing_eof: usize,
    pub read: usize,
    pub writing: usize,
    pub discarded: usize,
}

impl BlockCounts {
    pub fn total(&self) -> usize {
        self.free + self.reading + self.testing_eof + self.read + self.writing + self.discarded
    }

    fn reads_in_flight(&self) -> usize {
        self.reading + self.testing_eof
    }
}

#[derive(Debug)]
struct Block {
    state: BlockState,
    offset: u64,
    len: usize,
    buf: Vec<u8>,
    request: Option<IoRequest>,
    /// Issue order, to find the oldest outstanding request.
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Force {
    Read,
    Write,
}

type Failure = (IoSide, io::Error);

/// The block pipeline of one file copy.
#[derive(Debug)]
pub struct Pipeline {
    source: Arc<dyn FileHandle>,
    target: Arc<dyn FileHandle>,
    target_path: PathBuf,
    status: Arc<OperationStatus>,
    buffer_size: usize,
    blocks: Vec<Block>,
    /// Next offset to read.
    read_cursor: u64,
    /// Next offset to write.
    write_cursor: u64,
    /// End of the contiguous durably-written prefix.
    durable: u64,
    /// Completed writes not yet contiguous with `durable`.
    done: BTreeMap<u64, u64>,
    /// Length of the source when opened, updated when it grows.
    expected_len: u64,
    /// End of file as found by a short read.
    known_len: Option<u64>,
    eof_confirmed: bool,
    force: Option<Force>,
    next_seq: u64,
    pending_sleep: Duration,
}

impl Pipeline {
    /// Set up a pipeline copying `source` into `target` with `buffer_size`
    /// byte blocks.
    pub fn new(
        source: Arc<dyn FileHandle>,
        target: Arc<dyn FileHandle>,
        target_path: impl Into<PathBuf>,
        status: Arc<OperationStatus>,
        buffer_size: usize,
    ) -> Result<Self, PipelineError> {
        if tokio::runtime::Handle::try_current().is_err() || buffer_size == 0 {
            return Err(PipelineError::Allocation);
        }
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(PIPELINE_BLOCKS)
            .map_err(|_| PipelineError::Allocation)?;
        for _ in 0..PIPELINE_BLOCKS {
            let mut buf = Vec::new();
            buf.try_reserve_exact(buffer_size)
                .map_err(|_| PipelineError::Allocation)?;
            blocks.push(Block {
                state: BlockState::Free,
                offset: 0,
                len: 0,
                buf,
                request: None,
                seq: 0,
            });
        }
        let expected_len = source.size().map_err(|source| PipelineError::Io {
            side: IoSide::Source,
            offset: 0,
            source,
        })?;
        Ok(Self {
            source,
            target,
            target_path: target_path.into(),
            status,
            buffer_size,
            blocks,
            read_cursor: 0,
            write_cursor: 0,
            durable: 0,
            done: BTreeMap::new(),
            expected_len,
            known_len: None,
            eof_confirmed: false,
            force: None,
            next_seq: 0,
            pending_sleep: Duration::ZERO,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes durably written, contiguous from offset zero.
    pub fn durable(&self) -> u64 {
        self.durable
    }

    pub fn read_cursor(&self) -> u64 {
        self.read_cursor
    }

    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    /// True end of file once a short read or probe found it.
    pub fn known_len(&self) -> Option<u64> {
        self.known_len
    }

    pub fn is_finished(&self) -> bool {
        self.eof_confirmed && self.blocks.iter().all(|b| b.state == BlockState::Free)
    }

    pub fn counts(&self) -> BlockCounts {
        let mut counts = BlockCounts::default();
        for block in &self.blocks {
            match block.state {
                BlockState::Free => counts.free += 1,
                BlockState::Reading => counts.reading += 1,
                BlockState::TestingEof => counts.testing_eof += 1,
                BlockState::Read => counts.read += 1,
                BlockState::Writing => counts.writing += 1,
                BlockState::Discarded => counts.discarded += 1,
            }
        }
        counts
    }

    /// Swap in freshly opened handles after an error.
    pub fn resume(&mut self, source: Arc<dyn FileHandle>, target: Arc<dyn FileHandle>) {
        self.source = source;
        self.target = target;
        self.force = None;
    }

    /// Forget everything and start over from offset zero.
    pub fn restart(&mut self) {
        for block in &mut self.blocks {
            block.state = BlockState::Free;
        }
        self.read_cursor = 0;
        self.write_cursor = 0;
        self.durable = 0;
        self.done.clear();
        self.known_len = None;
        self.eof_confirmed = false;
        self.force = None;
        if let Ok(len) = self.source.size() {
            self.expected_len = len;
        }
    }

    /// Run until the whole file is written.
    pub async fn run(&mut self, control: &JobControl) -> Result<u64, PipelineError> {
        while !self.step(control).await? {}
        Ok(self.durable)
    }

    /// One turn of the driving loop; returns true when the copy is complete.
    pub async fn step(&mut self, control: &JobControl) -> Result<bool, PipelineError> {
        if control.checkpoint().await.is_err() {
            self.drain().await;
            return Err(PipelineError::Cancelled);
        }
        if self.is_finished() {
            return Ok(true);
        }

        let force = self.force.take();
        let mut advanced = false;

        if force != Some(Force::Write) {
            advanced |= self.issue_read();
        }

        for idx in 0..self.blocks.len() {
            let block = &mut self.blocks[idx];
            if block.state == BlockState::Discarded {
                block.state = BlockState::Free;
                advanced = true;
                continue;
            }
            if !block.request.as_ref().is_some_and(IoRequest::is_complete) {
                continue;
            }
            let Some(request) = block.request.take() else {
                continue;
            };
            let inline = request.completed_inline();
            let done = request.wait().await;
            if let Err((side, e)) = self.complete(idx, done, inline) {
                return Err(self.fail(side, e).await);
            }
            advanced = true;
        }

        if force != Some(Force::Read) {
            advanced |= self.issue_writes();
        }

        if !advanced {
            let oldest = self
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.request.is_some())
                .min_by_key(|(_, b)| b.seq)
                .map(|(idx, _)| idx);
            match oldest {
                Some(idx) => {
                    if let Some(request) = self.blocks[idx].request.take() {
                        let done = request.wait().await;
                        if let Err((side, e)) = self.complete(idx, done, false) {
                            return Err(self.fail(side, e).await);
                        }
                    }
                }
                None if force.is_some() || self.is_finished() => {}
                None => {
                    let e = io::Error::other("copy pipeline stalled");
                    return Err(self.fail(IoSide::Target, e).await);
                }
            }
        }

        if !self.pending_sleep.is_zero() {
            let sleep = std::mem::take(&mut self.pending_sleep);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = control.token().cancelled() => {}
            }
        }

        Ok(self.is_finished())
    }

    fn free_block(&self) -> Option<usize> {
        self.blocks.iter().position(|b| b.state == BlockState::Free)
    }

    fn issue_read(&mut self) -> bool {
        if self.eof_confirmed {
            return false;
        }
        let counts = self.counts();
        if counts.free == 0 || counts.reads_in_flight() >= MAX_IN_FLIGHT {
            return false;
        }
        let end = self.known_len.unwrap_or(self.expected_len);
        let probe = self.read_cursor >= end;
        // The end of file is only probed once every other read is back.
        if probe && counts.reads_in_flight() > 0 {
            return false;
        }
        let Some(idx) = self.free_block() else {
            return false;
        };
        let chunk = self.status.chunk_size(self.buffer_size);
        let len = if probe {
            chunk
        } else {
            chunk.min(usize::try_from(end - self.read_cursor).unwrap_or(usize::MAX))
        };

        self.next_seq += 1;
        let offset = self.read_cursor;
        let block = &mut self.blocks[idx];
        block.state = if probe {
            BlockState::TestingEof
        } else {
            BlockState::Reading
        };
        block.offset = offset;
        block.len = len;
        block.seq = self.next_seq;
        let buf = std::mem::take(&mut block.buf);
        block.request = Some(begin_read(&self.source, buf, len, offset));
        if !probe {
            self.read_cursor += len as u64;
        }
        true
    }

    fn issue_writes(&mut self) -> bool {
        let mut issued = false;
        while self.counts().writing < MAX_IN_FLIGHT {
            let next = self.blocks.iter().position(|b| {
                b.state == BlockState::Read && b.offset == self.write_cursor && b.len > 0
            });
            let Some(idx) = next else {
                break;
            };
            self.next_seq += 1;
            let block = &mut self.blocks[idx];
            block.state = BlockState::Writing;
            block.seq = self.next_seq;
            let buf = std::mem::take(&mut block.buf);
            block.request = Some(begin_write(&self.target, buf, block.len, block.offset));
            self.write_cursor += block.len as u64;
            issued = true;
        }
        issued
    }

    fn complete(&mut self, idx: usize, done: IoCompletion, inline: bool) -> Result<(), Failure> {
        let IoCompletion { buf, result } = done;
        let block = &mut self.blocks[idx];
        block.buf = buf;
        match block.state {
            BlockState::Reading | BlockState::TestingEof => {
                if inline {
                    self.force = Some(Force::Write);
                }
                let n = match result {
                    Ok(n) => n,
                    Err(e) => {
                        block.state = BlockState::Free;
                        return Err((IoSide::Source, e));
                    }
                };
                let offset = block.offset;
                if block.state == BlockState::TestingEof {
                    if n == 0 {
                        block.state = BlockState::Free;
                        self.eof_confirmed = true;
                        self.known_len = Some(offset);
                        return Ok(());
                    }
                    block.state = BlockState::Read;
                    block.len = n;
                    self.read_cursor = offset + n as u64;
                    self.known_len = None;
                    let size = self.source.size().map_err(|e| (IoSide::Source, e))?;
                    self.expected_len = size.max(self.read_cursor);
                    debug!(
                        path = %self.target_path.display(),
                        size = self.expected_len,
                        "source grew during copy"
                    );
                    return Ok(());
                }

                if self.known_len.is_some_and(|end| offset >= end) || n == 0 {
                    block.state = BlockState::Discarded;
                    block.len = 0;
                    if self.known_len.is_none() {
                        self.truncate_at(offset);
                    }
                    return Ok(());
                }
                let short = n < block.len;
                block.len = n;
                block.state = BlockState::Read;
                if short {
                    self.truncate_at(offset + n as u64);
                }
                Ok(())
            }
            BlockState::Writing => {
                if inline {
                    self.force = Some(Force::Read);
                }
                match result {
                    Ok(n) if n == block.len => {
                        block.state = BlockState::Free;
                        self.done.insert(block.offset, block.offset + n as u64);
                        self.advance_durable();
                        Ok(())
                    }
                    Ok(_) => {
                        block.state = BlockState::Read;
                        Err((IoSide::Target, disk_full(&self.target_path)))
                    }
                    Err(e) => {
                        block.state = BlockState::Read;
                        Err((IoSide::Target, e))
                    }
                }
            }
            _ => Ok(()),
        }
    }

    /// The source ended at `end`: blocks read beyond it are dropped.
    fn truncate_at(&mut self, end: u64) {
        self.known_len = Some(end);
        self.read_cursor = end;
        for block in &mut self.blocks {
            if block.state == BlockState::Read && block.offset >= end {
                block.state = BlockState::Discarded;
                block.len = 0;
            }
        }
        debug!(path = %self.target_path.display(), size = end, "source shrank during copy");
    }

    fn advance_durable(&mut self) {
        let before = self.durable;
        while let Some(end) = self.done.remove(&self.durable) {
            self.durable = end;
        }
        let delta = self.durable - before;
        if delta > 0 {
            self.pending_sleep += self.status.add_bytes(
                delta,
                false,
                self.buffer_size,
                None,
                self.buffer_size,
            );
        }
    }

    /// Wait for every outstanding request, keep what completed and rewind to
    /// the durable prefix.
    async fn drain(&mut self) {
        for idx in 0..self.blocks.len() {
            let Some(request) = self.blocks[idx].request.take() else {
                continue;
            };
            let IoCompletion { buf, result } = request.wait().await;
            let block = &mut self.blocks[idx];
            block.buf = buf;
            match (block.state, result) {
                (BlockState::Reading | BlockState::TestingEof, Ok(n)) if n > 0 => {
                    block.state = BlockState::Read;
                    block.len = n;
                }
                (BlockState::Reading | BlockState::TestingEof, _) => {
                    block.state = BlockState::Free;
                }
                (BlockState::Writing, Ok(n)) if n == block.len => {
                    block.state = BlockState::Free;
                    self.done.insert(block.offset, block.offset + n as u64);
                }
                (BlockState::Writing, _) => block.state = BlockState::Read,
                _ => {}
            }
        }
        self.advance_durable();
        self.rewind();
    }

    /// Keep only the chain of read blocks that continues the durable prefix.
    fn rewind(&mut self) {
        self.write_cursor = self.durable;
        self.done.clear();
        self.eof_confirmed = false;
        self.force = None;

        let mut order: Vec<usize> = (0..self.blocks.len())
            .filter(|&i| self.blocks[i].state == BlockState::Read)
            .collect();
        order.sort_by_key(|&i| self.blocks[i].offset);

        let mut next = self.durable;
        for idx in order {
            let block = &mut self.blocks[idx];
            if block.offset == next && block.len > 0 {
                next += block.len as u64;
            } else {
                block.state = BlockState::Free;
            }
        }
        for block in &mut self.blocks {
            if block.state == BlockState::Discarded {
                block.state = BlockState::Free;
            }
        }
        self.read_cursor = next;
        if self.known_len.is_some_and(|end| end < next) {
            self.known_len = None;
        }
    }

    async fn fail(&mut self, side: IoSide, source: io::Error) -> PipelineError {
        self.drain().await;
        debug!(
            path = %self.target_path.display(),
            %side,
            offset = self.durable,
            error = %source,
            "copy pipeline stopped"
        );
        PipelineError::Io {
            side,
            offset: self.durable,
            source,
        }
    }
}
