//! Ordered output queue between the worker pool and the reader.
//!
//! Workers fill their slots in whatever order they finish; the reader
//! drains slots strictly in Block order. Each slot owns one Block's worth
//! of decoded bytes behind its own small mutex, while the bookkeeping the
//! reader polls (`pos`, `decoder_in_pos`, `finished`, the terminal result)
//! lives in the queue itself, which the stream decoder keeps under its
//! coder mutex.
//!
//! One drained allocation may be cached for reuse so that a run of
//! same-sized Blocks does not free and reallocate identical buffers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ruxz_core::error::{Error, Result};

use crate::Status;

/// Implemented by a slot's producer so the queue can ask it to start
/// publishing partial progress.
pub trait PartialOutputTarget: Send + Sync {
    /// Called (under the coder mutex) when the producer's slot becomes the
    /// oldest unfinished one.
    fn enable_partial_output(&self);
}

/// One slot of the queue.
struct Outbuf {
    seq: u64,
    /// The decoded bytes; written by one worker, read by the main thread.
    buf: Arc<Mutex<Vec<u8>>>,
    /// Allocation size (the Block's uncompressed size).
    allocated: usize,
    /// Bytes the producer has published as readable.
    pos: usize,
    /// Compressed bytes the producer has consumed; the liveness probe for
    /// truncated input.
    decoder_in_pos: usize,
    /// Bytes already copied to the reader.
    read_pos: usize,
    finished: bool,
    /// Terminal error of the producing Block decoder, if any.
    error: Option<Error>,
    /// The producer to poke for partial output.
    producer: Option<Arc<dyn PartialOutputTarget>>,
    partial_enabled: bool,
}

/// Ordered multi-slot output queue.
pub struct OutQueue {
    bufs: VecDeque<Outbuf>,
    /// Allocation waiting for [`OutQueue::get_buf`].
    pending: Option<(Arc<Mutex<Vec<u8>>>, usize)>,
    cached: Option<Vec<u8>>,
    next_seq: u64,
    max_slots: usize,
    mem_in_use: u64,
    mem_allocated: u64,
}

impl OutQueue {
    /// Queue with one slot per worker thread.
    pub fn new(threads_max: usize) -> Self {
        Self {
            bufs: VecDeque::with_capacity(threads_max),
            pending: None,
            cached: None,
            next_seq: 0,
            max_slots: threads_max.max(1),
            mem_in_use: 0,
            mem_allocated: 0,
        }
    }

    /// Memory in live slots (including a preallocated one).
    pub fn mem_in_use(&self) -> u64 {
        self.mem_in_use
    }

    /// Memory in live slots plus the cache.
    pub fn mem_allocated(&self) -> u64 {
        self.mem_allocated
    }

    /// Memory an outbuf of `size` will account for.
    pub fn outbuf_mem_usage(size: u64) -> u64 {
        size
    }

    /// Whether a slot can be reserved right now.
    pub fn has_buf(&self) -> bool {
        self.pending.is_none() && self.bufs.len() < self.max_slots
    }

    /// Whether no slot holds or expects data.
    pub fn is_empty(&self) -> bool {
        self.pending.is_none() && self.bufs.is_empty()
    }

    /// Whether the reader could make progress right now.
    pub fn is_readable(&self) -> bool {
        match self.bufs.front() {
            Some(head) => head.read_pos < head.pos || head.finished,
            None => false,
        }
    }

    /// Reserve the next slot with a buffer of `size` bytes, reusing the
    /// cached allocation when it fits exactly.
    pub fn prealloc_buf(&mut self, size: usize) -> Result<()> {
        if !self.has_buf() {
            return Err(Error::prog("no free output slot to preallocate"));
        }

        let buf = match self.cached.take() {
            Some(cached) if cached.len() == size => cached,
            Some(cached) => {
                self.mem_allocated -= cached.len() as u64;
                drop(cached);
                let mut fresh = Vec::new();
                fresh.try_reserve_exact(size).map_err(|_| Error::Mem)?;
                fresh.resize(size, 0);
                self.mem_allocated += size as u64;
                fresh
            }
            None => {
                let mut fresh = Vec::new();
                fresh.try_reserve_exact(size).map_err(|_| Error::Mem)?;
                fresh.resize(size, 0);
                self.mem_allocated += size as u64;
                fresh
            }
        };

        self.mem_in_use += size as u64;
        self.pending = Some((Arc::new(Mutex::new(buf)), size));
        Ok(())
    }

    /// Hand the preallocated slot to its producer. Returns the slot's
    /// sequence number and shared buffer.
    pub fn get_buf(
        &mut self,
        producer: Arc<dyn PartialOutputTarget>,
    ) -> Result<(u64, Arc<Mutex<Vec<u8>>>)> {
        let (buf, allocated) = self
            .pending
            .take()
            .ok_or_else(|| Error::prog("get_buf without a preallocated slot"))?;

        let seq = self.next_seq;
        self.next_seq += 1;

        self.bufs.push_back(Outbuf {
            seq,
            buf: Arc::clone(&buf),
            allocated,
            pos: 0,
            decoder_in_pos: 0,
            read_pos: 0,
            finished: false,
            error: None,
            producer: Some(producer),
            partial_enabled: false,
        });

        Ok((seq, buf))
    }

    /// Publish a producer's progress on its slot.
    pub fn set_progress(&mut self, seq: u64, pos: usize, decoder_in_pos: usize) {
        if let Some(slot) = self.bufs.iter_mut().find(|b| b.seq == seq) {
            slot.pos = pos.max(slot.pos);
            slot.decoder_in_pos = decoder_in_pos;
        }
    }

    /// Mark a slot finished with its terminal result.
    pub fn finish(&mut self, seq: u64, pos: usize, decoder_in_pos: usize, error: Option<Error>) {
        if let Some(slot) = self.bufs.iter_mut().find(|b| b.seq == seq) {
            slot.pos = pos.max(slot.pos);
            slot.decoder_in_pos = decoder_in_pos;
            slot.finished = true;
            slot.error = error;
            slot.producer = None;
        }
    }

    /// Progress of the head slot, for the liveness check: `(seq,
    /// decoder_in_pos, partial_enabled)`.
    pub fn head_progress(&self) -> Option<(u64, usize, bool)> {
        self.bufs
            .front()
            .map(|head| (head.seq, head.decoder_in_pos, head.partial_enabled))
    }

    /// Ask the oldest unfinished slot's producer to publish partial
    /// output, if it was not asked already.
    pub fn enable_partial_output(&mut self) {
        if let Some(slot) = self.bufs.iter_mut().find(|b| !b.finished) {
            if !slot.partial_enabled {
                slot.partial_enabled = true;
                if let Some(producer) = &slot.producer {
                    producer.enable_partial_output();
                }
            }
        }
    }

    /// Copy readable bytes from the head slot into `out`.
    ///
    /// Returns `Status::StreamEnd` when a slot was fully drained and
    /// released (the caller should loop: the next slot may be ready too).
    /// A slot that terminated with an error yields that error once its
    /// decoded bytes have been drained, preserving output order.
    pub fn read(&mut self, out: &mut [u8], out_pos: &mut usize) -> Result<Status> {
        let Some(head) = self.bufs.front_mut() else {
            return Ok(Status::Ok);
        };

        if head.read_pos < head.pos {
            let n = (head.pos - head.read_pos).min(out.len() - *out_pos);
            if n > 0 {
                let buf = head.buf.lock().map_err(|_| Error::prog("output slot poisoned"))?;
                out[*out_pos..*out_pos + n].copy_from_slice(&buf[head.read_pos..head.read_pos + n]);
                *out_pos += n;
                head.read_pos += n;
            }
        }

        if head.finished && head.read_pos == head.pos {
            let slot = self
                .bufs
                .pop_front()
                .ok_or_else(|| Error::prog("output queue lost its head"))?;
            self.mem_in_use -= slot.allocated as u64;

            if let Some(error) = slot.error {
                self.mem_allocated -= slot.allocated as u64;
                return Err(error);
            }

            // Keep one drained allocation for reuse. If the producer still
            // holds a reference the allocation is simply let go.
            match Arc::try_unwrap(slot.buf).map(Mutex::into_inner) {
                Ok(Ok(buf)) => {
                    if let Some(old) = self.cached.take() {
                        self.mem_allocated -= old.len() as u64;
                    }
                    self.cached = Some(buf);
                }
                _ => self.mem_allocated -= slot.allocated as u64,
            }

            return Ok(Status::StreamEnd);
        }

        Ok(Status::Ok)
    }

    /// Drop the cached allocation.
    pub fn clear_cache(&mut self) {
        if let Some(cached) = self.cached.take() {
            self.mem_allocated -= cached.len() as u64;
        }
    }

    /// Drop the cached allocation unless it is exactly `keep_size` bytes.
    pub fn clear_cache2(&mut self, keep_size: usize) {
        if self.cached.as_ref().is_some_and(|c| c.len() != keep_size) {
            self.clear_cache();
        }
    }
}
