//! Multithreaded .xz Stream decoder.
//!
//! A sequential state machine runs on the caller's thread: it peels off
//! Stream and Block framing, decides per Block between handing the payload
//! to a worker thread (threaded mode) or decoding inline (direct mode),
//! and drains the ordered output queue into the caller's buffer. Workers
//! decode independently and rendezvous through two kinds of locks:
//!
//! - the *coder* lock guards the output queue, the memory counters, the
//!   free-worker stack and the first-error slot;
//! - each worker's own lock guards its state and input buffer.
//!
//! Lock order is strictly coder → worker → slot buffer. A worker never
//! takes the coder lock while holding its own; it snapshots what it needs,
//! releases, then publishes.
//!
//! Memory is governed by two caps: `memlimit_stop` is hard (exceeding it
//! is an error the caller can lift), `memlimit_threading` is soft: when a
//! Block does not fit, the decoder waits for memory to drain or falls back
//! to direct mode for that Block.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ruxz_core::check::CheckKind;
use ruxz_core::error::{Error, Result};
use ruxz_core::vli::vli_ceil4;

use crate::block::decoder::BlockDecoder;
use crate::block::header::{
    block_header_decode, block_header_size_decode, BlockOptions, BLOCK_HEADER_SIZE_MAX,
};
use crate::filter::chain_mem_usage;
use crate::header::{
    stream_footer_decode, stream_header_decode, StreamFlags, STREAM_HEADER_SIZE,
};
use crate::index::IndexHash;
use crate::outq::{OutQueue, PartialOutputTarget};
use crate::{Action, MtDecoderOptions, Status};

/// Input is handed to the Block decoder in slices of this size so workers
/// react quickly to state changes and publish progress often enough.
const CHUNK_SIZE: usize = 16384;

/// Floor reported by `memusage` even when nothing is allocated.
const MEMUSAGE_FLOOR: u64 = crate::filter::MEMUSAGE_BASE;

/// Lock a mutex, riding over poisoning: a worker that panicked cannot
/// corrupt the protocol state beyond what the error paths already handle.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    /// Waiting for work; the main thread may start or retire it.
    Idle,
    /// Decoding a Block.
    Running,
    /// Asked to abandon the current Block and go idle.
    Stopping,
    /// Asked to free everything and terminate.
    Exiting,
}

/// The per-Block context a worker runs with.
struct Job {
    out_buf: Arc<Mutex<Vec<u8>>>,
    seq: u64,
    /// Total input this Block will deliver (payload + padding + check).
    in_size: usize,
    in_pos: usize,
    out_pos: usize,
}

struct WorkerInner {
    state: WorkerState,
    /// Input copied in by the main thread; its length is the fill level.
    in_buf: Vec<u8>,
    /// Whether this worker must publish progress to the coder.
    partial_update: bool,
    /// The Block decoder; kept after a Block finishes as a cached
    /// allocation until reused or freed under memory pressure.
    decoder: Option<BlockDecoder>,
    job: Option<Job>,
    /// Memory accounted for the decoder chain.
    mem_filters: u64,
    /// Memory accounted for the input buffer.
    in_reserved: u64,
    progress_in: u64,
    progress_out: u64,
}

struct Worker {
    inner: Mutex<WorkerInner>,
    cond: Condvar,
    shared: Arc<CoderShared>,
}

impl PartialOutputTarget for Worker {
    fn enable_partial_output(&self) {
        let mut inner = lock(&self.inner);
        inner.partial_update = true;
        self.cond.notify_one();
    }
}

struct CoderState {
    /// First error any worker reported.
    thread_error: Option<Error>,
    /// Finished-Block progress totals.
    progress_in: u64,
    progress_out: u64,
    /// Memory held by running workers (input buffers + filter chains).
    mem_in_use: u64,
    /// Memory held by the cached chains of idle workers.
    mem_cached: u64,
    threads_free: Vec<Arc<Worker>>,
    outq: OutQueue,
}

struct CoderShared {
    state: Mutex<CoderState>,
    cond: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seq {
    StreamHeader,
    BlockHeader,
    BlockInit,
    BlockThrInit,
    BlockThrRun,
    BlockDirectInit,
    BlockDirectRun,
    IndexWaitOutput,
    IndexDecode,
    StreamFooter,
    StreamPadding,
    Error,
}

enum HeaderOutcome {
    Incomplete,
    IndexDetected,
    Ready,
}

enum Wait {
    Done,
    TimedOut,
}

/// The multithreaded Stream decoder handle.
pub struct MtStreamDecoder {
    shared: Arc<CoderShared>,
    /// Every worker created so far, in creation order.
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    /// The worker currently receiving input, with main-side fill tracking.
    thr: Option<Arc<Worker>>,
    thr_seq: u64,
    thr_in_filled: usize,
    thr_in_size: usize,

    sequence: Seq,
    /// Staging buffer for Stream Header/Footer and Block Headers.
    buffer: Vec<u8>,
    pos: usize,
    header_size: usize,

    stream_flags: Option<StreamFlags>,
    block_options: Option<BlockOptions>,
    index_hash: IndexHash,

    direct_decoder: Option<BlockDecoder>,
    mem_direct_mode: u64,
    mem_next_filters: u64,
    mem_next_in: u64,
    mem_next_block: u64,

    /// Framing bytes consumed on the main thread.
    progress_in_main: u64,
    progress_out_main: u64,

    threads_max: usize,
    timeout: Option<Duration>,
    memlimit_threading: u64,
    memlimit_stop: u64,
    tell_no_check: bool,
    tell_unsupported_check: bool,
    tell_any_check: bool,
    ignore_check: bool,
    concatenated: bool,
    first_stream: bool,

    /// Error to report once queued output has been drained.
    pending_error: Option<Error>,
    /// Set after one whole call made no progress; the next such call
    /// reports that no progress is possible.
    allow_buf_error: bool,
    /// The Stream (including trailing padding) completed.
    done: bool,
}

impl MtStreamDecoder {
    /// Create a decoder. Worker threads are spawned lazily, one per
    /// concurrently decoded Block.
    pub fn new(options: MtDecoderOptions) -> Result<Self> {
        options.validate()?;

        let threads_max = options.threads_max as usize;
        let memlimit_stop = options.memlimit_stop.max(1);
        let memlimit_threading = options.memlimit_threading.max(1).min(memlimit_stop);

        Ok(Self {
            shared: Arc::new(CoderShared {
                state: Mutex::new(CoderState {
                    thread_error: None,
                    progress_in: 0,
                    progress_out: 0,
                    mem_in_use: 0,
                    mem_cached: 0,
                    threads_free: Vec::new(),
                    outq: OutQueue::new(threads_max),
                }),
                cond: Condvar::new(),
            }),
            workers: Vec::new(),
            handles: Vec::new(),
            thr: None,
            thr_seq: 0,
            thr_in_filled: 0,
            thr_in_size: 0,
            sequence: Seq::StreamHeader,
            buffer: vec![0u8; BLOCK_HEADER_SIZE_MAX as usize],
            pos: 0,
            header_size: 0,
            stream_flags: None,
            block_options: None,
            index_hash: IndexHash::new(),
            direct_decoder: None,
            mem_direct_mode: 0,
            mem_next_filters: 0,
            mem_next_in: 0,
            mem_next_block: 0,
            progress_in_main: 0,
            progress_out_main: 0,
            threads_max,
            timeout: (options.timeout_ms > 0).then(|| Duration::from_millis(options.timeout_ms)),
            memlimit_threading,
            memlimit_stop,
            tell_no_check: options.tell_no_check,
            tell_unsupported_check: options.tell_unsupported_check,
            tell_any_check: options.tell_any_check,
            ignore_check: options.ignore_check,
            concatenated: options.concatenated,
            first_stream: true,
            pending_error: None,
            allow_buf_error: false,
            done: false,
        })
    }

    /// The check kind of the current Stream, once its header was decoded.
    pub fn get_check(&self) -> Option<CheckKind> {
        self.stream_flags.map(|f| f.check)
    }

    /// Total compressed and uncompressed bytes processed so far.
    pub fn get_progress(&self) -> (u64, u64) {
        let state = lock(&self.shared.state);
        let mut progress_in = self.progress_in_main + state.progress_in;
        let mut progress_out = self.progress_out_main + state.progress_out;
        for worker in &self.workers {
            let inner = lock(&worker.inner);
            progress_in += inner.progress_in;
            progress_out += inner.progress_out;
        }
        (progress_in, progress_out)
    }

    /// Memory currently accounted to decoding.
    pub fn memusage(&self) -> u64 {
        let state = lock(&self.shared.state);
        (self.mem_direct_mode + state.mem_in_use + state.outq.mem_in_use()).max(MEMUSAGE_FLOOR)
    }

    /// The hard memory limit.
    pub fn memlimit_get(&self) -> u64 {
        self.memlimit_stop
    }

    /// Raise or lower the hard limit. Lowering below the current usage is
    /// refused with a memory-limit error.
    pub fn memlimit_set(&mut self, new_limit: u64) -> Result<()> {
        let usage = self.memusage();
        if new_limit < usage {
            return Err(Error::memlimit(usage, new_limit));
        }
        self.memlimit_stop = new_limit;
        Ok(())
    }

    /// Raise the soft threading limit (it can never exceed the hard
    /// limit, nor be lowered). Returns the effective value.
    pub fn memlimit_threading_set(&mut self, new_limit: u64) -> u64 {
        self.memlimit_threading = self
            .memlimit_threading
            .max(new_limit)
            .min(self.memlimit_stop);
        self.memlimit_threading
    }

    /// Release the worker pool and every buffer. Dropping the decoder
    /// does the same.
    pub fn end(self) {}

    /// Decode: consume from `input[*in_pos..]`, produce into
    /// `out[*out_pos..]`. Output bytes appear strictly in Block order.
    pub fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        if *in_pos > input.len() || *out_pos > out.len() {
            return Err(Error::prog("buffer positions out of range"));
        }
        if action == Action::SyncFlush {
            return Err(Error::prog("sync flush is not supported by the stream decoder"));
        }
        if self.done {
            return Ok(Status::StreamEnd);
        }

        let call_in_start = *in_pos;
        let call_out_start = *out_pos;
        // Waiting to fill the output buffer is allowed only when the call
        // brought no input; otherwise the caller gets control back fast so
        // it can feed more.
        let no_new_input = call_in_start == input.len();
        let mut deadline: Option<Instant> = None;

        let result = self.run(input, in_pos, out, out_pos, action, no_new_input, &mut deadline);

        match &result {
            Ok(Status::Ok) => {
                if *in_pos == call_in_start && *out_pos == call_out_start {
                    if self.allow_buf_error {
                        self.allow_buf_error = false;
                        return Err(Error::Buf);
                    }
                    self.allow_buf_error = true;
                } else {
                    self.allow_buf_error = false;
                }
            }
            Ok(Status::StreamEnd) => {
                self.allow_buf_error = false;
                self.done = true;
            }
            _ => self.allow_buf_error = false,
        }

        result
    }

    #[allow(clippy::too_many_lines)]
    fn run(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
        no_new_input: bool,
        deadline: &mut Option<Instant>,
    ) -> Result<Status> {
        loop {
            match self.sequence {
                Seq::StreamHeader => {
                    let in_old = *in_pos;
                    bufcpy(input, in_pos, &mut self.buffer, &mut self.pos, STREAM_HEADER_SIZE);
                    self.progress_in_main += (*in_pos - in_old) as u64;

                    if self.pos < STREAM_HEADER_SIZE {
                        return Ok(Status::Ok);
                    }
                    self.pos = 0;

                    let header: [u8; STREAM_HEADER_SIZE] = self.buffer[..STREAM_HEADER_SIZE]
                        .try_into()
                        .map_err(|_| Error::prog("header staging buffer too small"))?;
                    let flags = match stream_header_decode(&header) {
                        Ok(flags) => flags,
                        // Later Streams of a concatenated file are known
                        // to be .xz; garbage there is corruption, not a
                        // foreign format.
                        Err(Error::Format(msg)) if !self.first_stream => {
                            return Err(Error::Data(msg))
                        }
                        Err(err) => return Err(err),
                    };

                    self.first_stream = false;
                    self.stream_flags = Some(flags);
                    self.sequence = Seq::BlockHeader;

                    if self.tell_no_check && flags.check == CheckKind::None {
                        return Ok(Status::NoCheck);
                    }
                    if self.tell_unsupported_check && !flags.check.is_supported() {
                        return Ok(Status::UnsupportedCheck);
                    }
                    if self.tell_any_check {
                        return Ok(Status::GetCheck);
                    }
                }

                Seq::BlockHeader => {
                    let in_old = *in_pos;
                    let outcome = self.decode_block_header(input, in_pos);
                    self.progress_in_main += (*in_pos - in_old) as u64;

                    match outcome {
                        Ok(HeaderOutcome::Incomplete) => {
                            // Drain queued output before returning so the
                            // caller is never starved just because it has
                            // no fresh input ready.
                            match self.read_output_and_wait(
                                out, out_pos, None, no_new_input, deadline,
                            )? {
                                Wait::TimedOut => return Ok(Status::TimedOut),
                                Wait::Done => {}
                            }
                            if self.pending_error.is_some() {
                                self.sequence = Seq::Error;
                                continue;
                            }
                            return Ok(Status::Ok);
                        }
                        Ok(HeaderOutcome::IndexDetected) => {
                            self.sequence = Seq::IndexWaitOutput;
                        }
                        Ok(HeaderOutcome::Ready) => {
                            let options = self
                                .block_options
                                .as_ref()
                                .ok_or_else(|| Error::prog("block options missing"))?;
                            self.mem_next_filters = chain_mem_usage(&options.filters);
                            self.sequence = Seq::BlockInit;
                        }
                        Err(err) => {
                            // Flush what was decoded before reporting,
                            // matching single-threaded behavior.
                            self.set_pending(err);
                            self.sequence = Seq::Error;
                        }
                    }
                }

                Seq::BlockInit => {
                    // The hard limit is checked first so the caller can
                    // raise it and resume from this very state.
                    if self.mem_next_filters > self.memlimit_stop {
                        match self.read_output_and_wait(out, out_pos, None, true, deadline)? {
                            Wait::TimedOut => return Ok(Status::TimedOut),
                            Wait::Done => {}
                        }
                        if !self.outq_is_empty() {
                            return Ok(Status::Ok);
                        }
                        return Err(Error::memlimit(self.mem_next_filters, self.memlimit_stop));
                    }

                    let options = self
                        .block_options
                        .as_ref()
                        .ok_or_else(|| Error::prog("block options missing"))?;
                    let compressed = options.compressed_size;
                    let uncompressed = options.uncompressed_size;

                    if needs_direct_mode(compressed) || needs_direct_mode(uncompressed) {
                        self.sequence = Seq::BlockDirectInit;
                        continue;
                    }

                    // Both sizes are known and small enough that the sums
                    // below cannot overflow.
                    let compressed = compressed.ok_or_else(|| Error::prog("size vanished"))?;
                    let uncompressed = uncompressed.ok_or_else(|| Error::prog("size vanished"))?;

                    self.mem_next_in =
                        vli_ceil4(compressed) + options.check.size() as u64;
                    let mem_buffers =
                        self.mem_next_in + OutQueue::outbuf_mem_usage(uncompressed);

                    match self.mem_next_filters.checked_add(mem_buffers) {
                        Some(total) if total <= self.memlimit_threading => {
                            self.mem_next_block = total;
                        }
                        // Doesn't fit the soft cap (or overflows): decode
                        // this Block inline instead.
                        _ => {
                            self.sequence = Seq::BlockDirectInit;
                            continue;
                        }
                    }

                    self.direct_decoder = None;
                    self.mem_direct_mode = 0;

                    // The sizes are declared, so the Index verifier can be
                    // fed now; the Block decoder will prove them.
                    let unpadded = options
                        .unpadded_size()
                        .ok_or_else(|| Error::prog("unpadded size vanished"))?;
                    if let Err(err) = self.index_hash.append(unpadded, uncompressed) {
                        self.set_pending(err);
                        self.sequence = Seq::Error;
                        continue;
                    }

                    self.sequence = Seq::BlockThrInit;
                }

                Seq::BlockThrInit => {
                    let mut block_can_start = false;
                    match self.read_output_and_wait(
                        out,
                        out_pos,
                        Some(&mut block_can_start),
                        true,
                        deadline,
                    )? {
                        Wait::TimedOut => return Ok(Status::TimedOut),
                        Wait::Done => {}
                    }

                    if self.pending_error.is_some() {
                        self.sequence = Seq::Error;
                        continue;
                    }

                    if !block_can_start {
                        // The output buffer is full while the queue still
                        // holds data; the caller must drain first.
                        return Ok(Status::Ok);
                    }

                    self.start_threaded_block()?;
                    if self.pending_error.is_some() {
                        // Block decoder construction failed; the queue
                        // still needs draining before the error surfaces.
                        self.sequence = Seq::Error;
                        continue;
                    }
                    self.sequence = Seq::BlockThrRun;
                }

                Seq::BlockThrRun => {
                    let thr = self
                        .thr
                        .clone()
                        .ok_or_else(|| Error::prog("no worker assigned"))?;

                    // Copy input into the worker's buffer.
                    let want = self.thr_in_size - self.thr_in_filled;
                    let n = want.min(input.len() - *in_pos);
                    if n > 0 {
                        let mut inner = lock(&thr.inner);
                        inner.in_buf.extend_from_slice(&input[*in_pos..*in_pos + n]);
                        thr.cond.notify_one();
                        drop(inner);
                        *in_pos += n;
                        self.thr_in_filled += n;
                    }

                    match self.read_output_and_wait(out, out_pos, None, no_new_input, deadline)? {
                        Wait::TimedOut => return Ok(Status::TimedOut),
                        Wait::Done => {}
                    }

                    if self.pending_error.is_some() {
                        self.sequence = Seq::Error;
                        continue;
                    }

                    if self.thr_in_filled < self.thr_in_size {
                        return Ok(Status::Ok);
                    }

                    // The whole Block reached its worker; move on.
                    self.thr = None;
                    self.sequence = Seq::BlockHeader;
                }

                Seq::BlockDirectInit => {
                    // Wait until every worker is done and drained, then
                    // tear the pool down; direct mode runs alone.
                    match self.read_output_and_wait(out, out_pos, None, true, deadline)? {
                        Wait::TimedOut => return Ok(Status::TimedOut),
                        Wait::Done => {}
                    }
                    if !self.outq_is_empty() {
                        return Ok(Status::Ok);
                    }

                    {
                        let mut state = lock(&self.shared.state);
                        state.outq.clear_cache();
                    }
                    self.threads_end();

                    let options = self
                        .block_options
                        .as_ref()
                        .ok_or_else(|| Error::prog("block options missing"))?;
                    let mut thread_options = options.clone();
                    thread_options.ignore_check = self.ignore_check;

                    self.direct_decoder = Some(BlockDecoder::new(&thread_options)?);
                    self.mem_direct_mode = self.mem_next_filters;
                    self.sequence = Seq::BlockDirectRun;
                }

                Seq::BlockDirectRun => {
                    let decoder = self
                        .direct_decoder
                        .as_mut()
                        .ok_or_else(|| Error::prog("direct decoder missing"))?;

                    let in_old = *in_pos;
                    let out_old = *out_pos;
                    let ret = decoder.code(input, in_pos, out, out_pos, action)?;
                    self.progress_in_main += (*in_pos - in_old) as u64;
                    self.progress_out_main += (*out_pos - out_old) as u64;

                    if ret != Status::StreamEnd {
                        return Ok(ret);
                    }

                    let options = self
                        .block_options
                        .as_ref()
                        .ok_or_else(|| Error::prog("block options missing"))?;
                    let unpadded = u64::from(options.header_size)
                        + decoder.compressed_seen()
                        + options.check.size() as u64;
                    let uncompressed = decoder.uncompressed_seen();
                    self.index_hash.append(unpadded, uncompressed)?;

                    self.sequence = Seq::BlockHeader;
                }

                Seq::IndexWaitOutput => {
                    match self.read_output_and_wait(out, out_pos, None, true, deadline)? {
                        Wait::TimedOut => return Ok(Status::TimedOut),
                        Wait::Done => {}
                    }
                    if !self.outq_is_empty() {
                        return Ok(Status::Ok);
                    }
                    self.sequence = Seq::IndexDecode;
                }

                Seq::IndexDecode => {
                    if *in_pos >= input.len() {
                        return Ok(Status::Ok);
                    }

                    let in_old = *in_pos;
                    let ret = self.index_hash.decode(input, in_pos);
                    self.progress_in_main += (*in_pos - in_old) as u64;

                    match ret? {
                        Status::StreamEnd => self.sequence = Seq::StreamFooter,
                        _ => return Ok(Status::Ok),
                    }
                }

                Seq::StreamFooter => {
                    let in_old = *in_pos;
                    bufcpy(input, in_pos, &mut self.buffer, &mut self.pos, STREAM_HEADER_SIZE);
                    self.progress_in_main += (*in_pos - in_old) as u64;

                    if self.pos < STREAM_HEADER_SIZE {
                        return Ok(Status::Ok);
                    }
                    self.pos = 0;

                    let footer_buf: [u8; STREAM_HEADER_SIZE] = self.buffer
                        [..STREAM_HEADER_SIZE]
                        .try_into()
                        .map_err(|_| Error::prog("header staging buffer too small"))?;
                    let footer = match stream_footer_decode(&footer_buf) {
                        Ok(footer) => footer,
                        // The format was already recognized; a bad footer
                        // magic is corruption.
                        Err(Error::Format(msg)) => return Err(Error::Data(msg)),
                        Err(err) => return Err(err),
                    };

                    if Some(self.index_hash.size()) != footer.backward_size {
                        return Err(Error::data(
                            "stream footer disagrees with the index size",
                        ));
                    }

                    let header_flags = self
                        .stream_flags
                        .ok_or_else(|| Error::prog("stream flags missing"))?;
                    crate::header::stream_flags_compare(header_flags, footer)?;

                    if !self.concatenated {
                        return Ok(Status::StreamEnd);
                    }
                    self.sequence = Seq::StreamPadding;
                }

                Seq::StreamPadding => {
                    loop {
                        if *in_pos >= input.len() {
                            // Without Finish there is no way to know if
                            // another Stream follows.
                            if action != Action::Finish {
                                return Ok(Status::Ok);
                            }
                            return if self.pos == 0 {
                                Ok(Status::StreamEnd)
                            } else {
                                Err(Error::data(
                                    "stream padding is not a multiple of four bytes",
                                ))
                            };
                        }

                        if input[*in_pos] != 0x00 {
                            break;
                        }
                        *in_pos += 1;
                        self.progress_in_main += 1;
                        self.pos = (self.pos + 1) & 3;
                    }

                    if self.pos != 0 {
                        *in_pos += 1;
                        self.progress_in_main += 1;
                        return Err(Error::data(
                            "stream padding is not a multiple of four bytes",
                        ));
                    }

                    // A new Stream begins.
                    self.index_hash = IndexHash::new();
                    self.sequence = Seq::StreamHeader;
                }

                Seq::Error => {
                    // Flush everything decodable before the error, exactly
                    // like the single-threaded decoder would.
                    match self.read_output_and_wait(out, out_pos, None, true, deadline)? {
                        Wait::TimedOut => return Ok(Status::TimedOut),
                        Wait::Done => {}
                    }
                    if !self.outq_is_empty() {
                        return Ok(Status::Ok);
                    }

                    return Err(self
                        .pending_error
                        .clone()
                        .unwrap_or_else(|| Error::prog("error state without an error")));
                }
            }
        }
    }

    fn set_pending(&mut self, err: Error) {
        if self.pending_error.is_none() {
            self.pending_error = Some(err);
        }
    }

    fn outq_is_empty(&self) -> bool {
        lock(&self.shared.state).outq.is_empty()
    }

    fn decode_block_header(&mut self, input: &[u8], in_pos: &mut usize) -> Result<HeaderOutcome> {
        if *in_pos >= input.len() {
            return Ok(HeaderOutcome::Incomplete);
        }

        if self.pos == 0 {
            if input[*in_pos] == 0x00 {
                return Ok(HeaderOutcome::IndexDetected);
            }
            // The size byte stays in the buffer; the header decoder wants
            // to see it too.
            self.header_size = block_header_size_decode(input[*in_pos]) as usize;
        }

        bufcpy(input, in_pos, &mut self.buffer, &mut self.pos, self.header_size);
        if self.pos < self.header_size {
            return Ok(HeaderOutcome::Incomplete);
        }
        self.pos = 0;

        let check = self
            .stream_flags
            .ok_or_else(|| Error::prog("stream flags missing"))?
            .check;
        let mut options = block_header_decode(&self.buffer[..self.header_size], check)?;
        options.ignore_check = self.ignore_check;
        self.block_options = Some(options);
        Ok(HeaderOutcome::Ready)
    }

    /// Reserve memory, get a worker (cached or fresh), hand it the next
    /// Block. Call only after `read_output_and_wait` reported that the
    /// Block can start.
    fn start_threaded_block(&mut self) -> Result<()> {
        let options = self
            .block_options
            .as_ref()
            .ok_or_else(|| Error::prog("block options missing"))?;
        let uncompressed = options
            .uncompressed_size
            .ok_or_else(|| Error::prog("threaded block without a size"))? as usize;
        let in_size = self.mem_next_in as usize;

        let mut thread_options = options.clone();
        thread_options.ignore_check = self.ignore_check;

        // Trim caches if existing allocations would push the start of this
        // Block over the soft limit. The snapshot may lag the workers, but
        // only toward more favorable values.
        let worker = {
            let mut state = lock(&self.shared.state);
            let mem_max = self.memlimit_threading.saturating_sub(self.mem_next_block);

            if state.mem_in_use + state.mem_cached + state.outq.mem_allocated() > mem_max {
                // Drop the buffer cache first, keeping a buffer that
                // already has the right size.
                state.outq.clear_cache2(uncompressed);
            }

            if !state.threads_free.is_empty()
                && state.mem_in_use + state.mem_cached + state.outq.mem_in_use() > mem_max
            {
                // Free cached decoder chains, sparing the first free
                // worker when its chain is small enough to reuse.
                let mut freed = 0u64;
                for (i, cached) in state.threads_free.iter().enumerate() {
                    let mut inner = lock(&cached.inner);
                    if i == 0 && inner.mem_filters <= self.mem_next_filters {
                        continue;
                    }
                    inner.decoder = None;
                    freed += inner.mem_filters;
                    inner.mem_filters = 0;
                }
                state.mem_cached -= freed;
            }

            state.mem_in_use += self.mem_next_in + self.mem_next_filters;
            state.outq.prealloc_buf(uncompressed)?;

            match state.threads_free.pop() {
                Some(worker) => {
                    let cached_mem = lock(&worker.inner).mem_filters;
                    state.mem_cached -= cached_mem;
                    Some(worker)
                }
                None => None,
            }
        };

        let worker = match worker {
            Some(worker) => worker,
            None => self.spawn_worker()?,
        };

        // Building the chain allocates; do it outside every lock.
        let decoder = match BlockDecoder::new(&thread_options) {
            Ok(decoder) => decoder,
            Err(err) => {
                self.set_pending(err);
                self.sequence = Seq::Error;
                // Return the worker unused. Its cached chain was already
                // uncounted when it was popped, so clear it for real; the
                // reserved Block memory is settled at teardown.
                {
                    let mut inner = lock(&worker.inner);
                    inner.decoder = None;
                    inner.mem_filters = 0;
                }
                let mut state = lock(&self.shared.state);
                state.threads_free.push(worker);
                return Ok(());
            }
        };

        let (seq, out_buf) = {
            let mut state = lock(&self.shared.state);
            state
                .outq
                .get_buf(Arc::clone(&worker) as Arc<dyn PartialOutputTarget>)?
        };

        {
            let mut inner = lock(&worker.inner);
            inner.in_buf = Vec::with_capacity(in_size);
            inner.partial_update = false;
            inner.decoder = Some(decoder);
            inner.job = Some(Job {
                out_buf,
                seq,
                in_size,
                in_pos: 0,
                out_pos: 0,
            });
            inner.mem_filters = self.mem_next_filters;
            inner.in_reserved = self.mem_next_in;
            inner.progress_in = 0;
            inner.progress_out = 0;
            inner.state = WorkerState::Running;
            worker.cond.notify_one();
        }

        self.thr = Some(Arc::clone(&worker));
        self.thr_seq = seq;
        self.thr_in_filled = 0;
        self.thr_in_size = in_size;

        // Arm partial output on whichever worker owns the oldest slot.
        let mut state = lock(&self.shared.state);
        state.outq.enable_partial_output();
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<Arc<Worker>> {
        let worker = Arc::new(Worker {
            inner: Mutex::new(WorkerInner {
                state: WorkerState::Idle,
                in_buf: Vec::new(),
                partial_update: false,
                decoder: None,
                job: None,
                mem_filters: 0,
                in_reserved: 0,
                progress_in: 0,
                progress_out: 0,
            }),
            cond: Condvar::new(),
            shared: Arc::clone(&self.shared),
        });

        let thread_worker = Arc::clone(&worker);
        let handle = std::thread::Builder::new()
            .name(format!("xz-dec-{}", self.workers.len()))
            .spawn(move || worker_loop(&thread_worker))
            .map_err(|_| Error::Mem)?;

        self.workers.push(Arc::clone(&worker));
        self.handles.push(handle);
        Ok(worker)
    }

    /// Ask every busy worker to abandon its Block.
    fn threads_stop(&self) {
        for worker in &self.workers {
            let mut inner = lock(&worker.inner);
            if inner.state != WorkerState::Idle {
                inner.state = WorkerState::Stopping;
                worker.cond.notify_one();
            }
        }
    }

    /// Terminate and join every worker, resetting the pool accounting.
    fn threads_end(&mut self) {
        for worker in &self.workers {
            let mut inner = lock(&worker.inner);
            inner.state = WorkerState::Exiting;
            worker.cond.notify_one();
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.workers.clear();
        self.thr = None;

        let mut state = lock(&self.shared.state);
        state.threads_free.clear();
        state.mem_in_use = 0;
        state.mem_cached = 0;
    }

    /// Copy queued output to the caller and wait for the queue, the
    /// memory budget, or the pool, whichever the current state needs.
    fn read_output_and_wait(
        &mut self,
        out: &mut [u8],
        out_pos: &mut usize,
        mut input_is_possible: Option<&mut bool>,
        waiting_allowed: bool,
        deadline: &mut Option<Instant>,
    ) -> Result<Wait> {
        let shared = Arc::clone(&self.shared);
        let mut state = lock(&shared.state);

        let result = loop {
            // Drain whatever is readable without blocking. Keep looping on
            // StreamEnd: an empty Block finishes without any output and
            // the next slot may already have bytes.
            loop {
                match state.outq.read(out, out_pos) {
                    Ok(Status::StreamEnd) => state.outq.enable_partial_output(),
                    Ok(_) => break,
                    Err(err) => {
                        drop(state);
                        self.threads_stop();
                        return Err(err);
                    }
                }
            }

            if let Some(err) = &state.thread_error {
                if self.pending_error.is_none() {
                    self.pending_error = Some(err.clone());
                }
            }

            // Can the next Block be admitted? Checked after draining:
            // reading output frees slots and memory.
            if let Some(flag) = input_is_possible.as_deref_mut() {
                let fits = state
                    .mem_in_use
                    .checked_add(state.outq.mem_in_use())
                    .and_then(|v| v.checked_add(self.mem_next_block))
                    .is_some_and(|total| total <= self.memlimit_threading);
                if fits
                    && state.outq.has_buf()
                    && (self.workers.len() < self.threads_max
                        || !state.threads_free.is_empty())
                {
                    *flag = true;
                    break Ok(Wait::Done);
                }
            }

            if !waiting_allowed {
                break Ok(Wait::Done);
            }

            // Nothing queued and nothing awaited: the caller must bring
            // more input.
            if input_is_possible.is_none() && state.outq.is_empty() {
                break Ok(Wait::Done);
            }

            // Data is ready but the output buffer is full.
            if state.outq.is_readable() {
                break Ok(Wait::Done);
            }

            // The worker being fed consumed everything it was given: only
            // more input can unblock things, so do not sleep. This is what
            // turns a truncated file into "no progress" instead of a hang.
            // Applies only when that worker's slot is the head (a single
            // Block in flight).
            if self.thr.is_some() {
                if let Some((seq, decoder_in_pos, partial_enabled)) = state.outq.head_progress() {
                    if partial_enabled
                        && seq == self.thr_seq
                        && decoder_in_pos == self.thr_in_filled
                    {
                        break Ok(Wait::Done);
                    }
                }
            }

            if let Some(timeout) = self.timeout {
                let until = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                let now = Instant::now();
                if now >= until {
                    break Ok(Wait::TimedOut);
                }
                let (guard, wait_result) = shared
                    .cond
                    .wait_timeout(state, until - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state = guard;
                if wait_result.timed_out() {
                    // Drain once more before reporting the timeout.
                    loop {
                        match state.outq.read(out, out_pos) {
                            Ok(Status::StreamEnd) => state.outq.enable_partial_output(),
                            Ok(_) => break,
                            Err(err) => {
                                drop(state);
                                self.threads_stop();
                                return Err(err);
                            }
                        }
                    }
                    break Ok(Wait::TimedOut);
                }
            } else {
                state = shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        drop(state);
        result
    }
}

impl Drop for MtStreamDecoder {
    fn drop(&mut self) {
        self.threads_end();
    }
}

/// Copy as much as possible from `input` into `buf[..want]`.
fn bufcpy(input: &[u8], in_pos: &mut usize, buf: &mut [u8], buf_pos: &mut usize, want: usize) {
    let n = (want - *buf_pos).min(input.len() - *in_pos);
    buf[*buf_pos..*buf_pos + n].copy_from_slice(&input[*in_pos..*in_pos + n]);
    *buf_pos += n;
    *in_pos += n;
}

/// Threading needs both sizes, small enough to never overflow address
/// arithmetic while Blocks are in flight.
fn needs_direct_mode(size: Option<u64>) -> bool {
    match size {
        None => true,
        Some(size) => size > (usize::MAX / 3) as u64,
    }
}

/// Body of each worker thread.
fn worker_loop(worker: &Arc<Worker>) {
    let mut scratch: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);

    'outer: loop {
        let mut inner = lock(&worker.inner);

        // Wait for work, honoring state changes.
        let (decoder, job, chunk_len) = loop {
            match inner.state {
                WorkerState::Idle => {
                    inner = worker
                        .cond
                        .wait(inner)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }

                WorkerState::Exiting => {
                    inner.in_buf = Vec::new();
                    inner.decoder = None;
                    inner.job = None;
                    return;
                }

                WorkerState::Stopping => {
                    inner.state = WorkerState::Idle;
                    let in_reserved = inner.in_reserved;
                    let mem_filters = inner.mem_filters;
                    inner.in_buf = Vec::new();
                    inner.in_reserved = 0;
                    inner.job = None;
                    drop(inner);

                    release_to_pool(worker, in_reserved, mem_filters);
                    continue 'outer;
                }

                WorkerState::Running => {
                    let Some(job_ref) = inner.job.as_ref() else {
                        inner.state = WorkerState::Idle;
                        continue;
                    };

                    if inner.in_buf.len() == job_ref.in_pos {
                        // No new input. Remember where we are in case the
                        // main thread armed partial updates while nothing
                        // changes: it needs to see our position to detect
                        // a stalled (truncated) stream.
                        let stalled_at = (job_ref.seq, job_ref.out_pos, job_ref.in_pos);
                        inner = worker
                            .cond
                            .wait(inner)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());

                        let still_stalled = inner.state == WorkerState::Running
                            && inner.partial_update
                            && inner
                                .job
                                .as_ref()
                                .is_some_and(|j| inner.in_buf.len() == j.in_pos);
                        if still_stalled {
                            drop(inner);
                            publish_progress(worker, stalled_at.0, stalled_at.1, stalled_at.2);
                            continue 'outer;
                        }
                        continue;
                    }

                    let start = job_ref.in_pos;
                    let end = inner.in_buf.len().min(start + CHUNK_SIZE);
                    scratch.clear();
                    scratch.extend_from_slice(&inner.in_buf[start..end]);

                    let decoder = inner.decoder.take();
                    let job = inner.job.take();
                    break (decoder, job, end - start);
                }
            }
        };
        drop(inner);

        let (mut decoder, mut job) = match (decoder, job) {
            (Some(decoder), Some(job)) => (decoder, job),
            _ => {
                // State said Running but the job is gone; go idle.
                let mut inner = lock(&worker.inner);
                inner.state = WorkerState::Idle;
                drop(inner);
                release_to_pool(worker, 0, 0);
                continue;
            }
        };

        // Decode one chunk outside the worker lock. The slot buffer lock
        // is only contended by the main thread copying finished bytes out.
        let out_before = job.out_pos;
        let mut chunk_pos = 0usize;
        let ret = {
            let mut out = lock(&job.out_buf);
            decoder.code(
                &scratch[..chunk_len],
                &mut chunk_pos,
                &mut out,
                &mut job.out_pos,
                Action::Run,
            )
        };
        job.in_pos += chunk_pos;

        match ret {
            Ok(Status::StreamEnd) => finish_block(worker, Some(decoder), job, None),

            Err(err) => finish_block(worker, Some(decoder), job, Some(err)),

            Ok(_) => {
                if chunk_pos == 0 && job.out_pos == out_before {
                    // A nonempty chunk consumed nothing and produced
                    // nothing: the Block cannot satisfy its declared
                    // sizes.
                    let err = Error::data("block payload stalled inside its declared sizes");
                    finish_block(worker, Some(decoder), job, Some(err));
                } else if job.in_pos == job.in_size {
                    // All input consumed without reaching the Block's end.
                    let err = Error::data("block ended without completing its payload");
                    finish_block(worker, Some(decoder), job, Some(err));
                } else {
                    // Keep going: restore the job and report progress.
                    let seq = job.seq;
                    let out_pos = job.out_pos;
                    let in_pos = job.in_pos;

                    let mut inner = lock(&worker.inner);
                    inner.progress_in = in_pos as u64;
                    inner.progress_out = out_pos as u64;
                    let partial = inner.partial_update;
                    inner.decoder = Some(decoder);
                    inner.job = Some(job);
                    drop(inner);

                    if partial {
                        publish_progress(worker, seq, out_pos, in_pos);
                    }
                }
            }
        }
    }
}

/// Publish a worker's progress on its output slot under the coder lock.
fn publish_progress(worker: &Worker, seq: u64, out_pos: usize, in_pos: usize) {
    let mut state = lock(&worker.shared.state);
    state.outq.set_progress(seq, out_pos, in_pos);
    worker.shared.cond.notify_all();
}

/// Account a worker back into the free pool under the coder lock.
fn release_to_pool(worker: &Arc<Worker>, in_reserved: u64, mem_filters: u64) {
    let mut state = lock(&worker.shared.state);
    state.mem_in_use -= in_reserved;
    state.mem_in_use -= mem_filters;
    state.mem_cached += mem_filters;
    state.threads_free.push(Arc::clone(worker));
    worker.shared.cond.notify_all();
}

/// A Block ended (successfully or not): settle the slot, the progress
/// totals and the pool accounting.
fn finish_block(
    worker: &Arc<Worker>,
    decoder: Option<BlockDecoder>,
    job: Job,
    error: Option<Error>,
) {
    let (in_reserved, mem_filters);
    {
        let mut inner = lock(&worker.inner);
        if inner.state != WorkerState::Exiting {
            inner.state = WorkerState::Idle;
        }
        inner.in_buf = Vec::new();
        in_reserved = inner.in_reserved;
        inner.in_reserved = 0;
        mem_filters = inner.mem_filters;
        // The chain stays cached for the next Block with similar filters.
        inner.decoder = decoder;
        inner.progress_in = 0;
        inner.progress_out = 0;
    }

    let mut state = lock(&worker.shared.state);
    state.progress_in += job.in_pos as u64;
    state.progress_out += job.out_pos as u64;

    state
        .outq
        .finish(job.seq, job.out_pos, job.in_pos, error.clone());
    if let Some(err) = error {
        if state.thread_error.is_none() {
            state.thread_error = Some(err);
        }
    }

    state.mem_in_use -= in_reserved;
    state.mem_in_use -= mem_filters;
    state.mem_cached += mem_filters;
    state.threads_free.push(Arc::clone(worker));
    worker.shared.cond.notify_all();

    drop(state);
    drop(job);
}
