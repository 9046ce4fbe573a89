//! Tag-scoped, multi-threaded message passing over a [`Transport`].
//!
//! Producers append payloads into per-(tag, destination) buffers; three
//! dedicated workers move data: the *sender* ships sealed buffers as
//! wire frames, the *receiver* pulls frames off the transport, and the
//! *dispatcher* hands payloads to the callback registered for their
//! tag. `flush(tag)` and `finish(tag)` are collective: they drive the
//! end-of-epoch token handshake that proves quiescence for a tag on
//! every rank before returning.

use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bitvec::prelude::*;
use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHasher;
use thiserror::Error;

use crate::buffer::{BufferPool, DestQueue, MessageBuffer};
use crate::transport::{Frame, Tag, Transport};

type FastHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;

/// Tag reserved for the layer's own control traffic; user tags start
/// at 1.
pub const CONTROL_TAG: Tag = 0;

/// Dispatch function for one tag: `(payload, source_rank)`. The payload
/// is valid only for the duration of the call. Callbacks run on the
/// dispatcher worker: they may send messages (request/reply flows) but
/// must never call a collective operation. A panic escaping a callback
/// aborts the process; callbacks own their error handling.
pub type Callback = Box<dyn Fn(&[u8], usize) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("tag {0} is reserved for control traffic")]
    ReservedTag(Tag),
    #[error("no callback registered for tag {0}")]
    UnknownTag(Tag),
    #[error("a callback is already registered for tag {0}")]
    DuplicateCallback(Tag),
    #[error("tag {0} is already finished")]
    TagFinished(Tag),
    #[error("payload of {len} bytes does not fit the {cap}-byte buffers")]
    Oversize { len: usize, cap: usize },
    #[error("empty payloads cannot be sent")]
    EmptyPayload,
    #[error("destination rank {dst} out of range for {size} ranks")]
    BadDestination { dst: usize, size: usize },
    #[error("communication layer is not running")]
    NotRunning,
    #[error("communication layer is already running")]
    AlreadyRunning,
}

#[derive(Clone, Copy, Debug)]
pub struct CommConfig {
    /// Capacity of one accumulation buffer; payloads must be strictly
    /// smaller.
    pub buffer_capacity: usize,
    /// Buffers in the free pool, shared by all tags and destinations.
    /// Every (tag, destination) pair parks one active buffer, so this
    /// must comfortably exceed `tags * ranks` or producers stall.
    pub pool_buffers: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        CommConfig {
            buffer_capacity: 8192,
            pool_buffers: 64,
        }
    }
}

struct EpochTally {
    epoch: u64,
    seen: BitVec,
    complete: bool,
}

struct TagState {
    callback: Callback,
    dests: Vec<DestQueue>,
    tally: Mutex<EpochTally>,
    tally_cv: Condvar,
    finished: AtomicBool,
}

enum SendJob {
    Buffer {
        tag: Tag,
        dst: usize,
        buffer: Arc<MessageBuffer>,
    },
    Token {
        tag: Tag,
        dst: usize,
        epoch: u64,
    },
    Stop,
}

enum Dispatch {
    Frame(Frame),
    Stop,
}

struct Shared {
    transport: Arc<dyn Transport>,
    tags: RwLock<FastHashMap<Tag, Arc<TagState>>>,
    pool: BufferPool,
    jobs: Sender<SendJob>,
    running: AtomicBool,
}

impl Shared {
    fn send_message(&self, payload: &[u8], dst: usize, tag: Tag) -> Result<(), CommError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(CommError::NotRunning);
        }
        if tag == CONTROL_TAG {
            return Err(CommError::ReservedTag(tag));
        }
        let size = self.transport.size();
        if dst >= size {
            return Err(CommError::BadDestination { dst, size });
        }
        if payload.is_empty() {
            return Err(CommError::EmptyPayload);
        }
        if payload.len() >= self.pool.buffer_capacity() {
            return Err(CommError::Oversize {
                len: payload.len(),
                cap: self.pool.buffer_capacity(),
            });
        }
        let state = self
            .tags
            .read()
            .get(&tag)
            .cloned()
            .ok_or(CommError::UnknownTag(tag))?;
        if state.finished.load(Ordering::Acquire) {
            return Err(CommError::TagFinished(tag));
        }
        state.dests[dst].append(&self.pool, payload, |buffer| {
            self.jobs
                .send(SendJob::Buffer { tag, dst, buffer })
                .expect("sender worker disappeared");
        });
        Ok(())
    }
}

/// Cheap clonable sending handle for callbacks and producer threads.
#[derive(Clone)]
pub struct CommHandle {
    shared: Arc<Shared>,
}

impl CommHandle {
    pub fn rank(&self) -> usize {
        self.shared.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.shared.transport.size()
    }

    pub fn send_message(&self, payload: &[u8], dst: usize, tag: Tag) -> Result<(), CommError> {
        self.shared.send_message(payload, dst, tag)
    }
}

pub struct CommLayer {
    shared: Arc<Shared>,
    job_rx: Option<Receiver<SendJob>>,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl CommLayer {
    pub fn new(transport: Arc<dyn Transport>, config: CommConfig) -> Self {
        assert!(config.buffer_capacity >= 2, "buffers too small to batch");
        let (jobs, job_rx) = unbounded();
        let shared = Arc::new(Shared {
            transport,
            tags: RwLock::new(FastHashMap::default()),
            pool: BufferPool::new(config.pool_buffers, config.buffer_capacity),
            jobs,
            running: AtomicBool::new(false),
        });
        CommLayer {
            shared,
            job_rx: Some(job_rx),
            sender: None,
            receiver: None,
            dispatcher: None,
            shut_down: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.shared.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.shared.transport.size()
    }

    pub fn handle(&self) -> CommHandle {
        CommHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register the dispatch function for `tag`. Must happen on every
    /// rank before [`init_communication`](Self::init_communication).
    pub fn add_receive_callback<F>(&self, tag: Tag, callback: F) -> Result<(), CommError>
    where
        F: Fn(&[u8], usize) + Send + Sync + 'static,
    {
        if tag == CONTROL_TAG {
            return Err(CommError::ReservedTag(tag));
        }
        if self.shared.running.load(Ordering::Acquire) {
            return Err(CommError::AlreadyRunning);
        }
        let size = self.shared.transport.size();
        let mut tags = self.shared.tags.write();
        if tags.contains_key(&tag) {
            return Err(CommError::DuplicateCallback(tag));
        }
        tags.insert(
            tag,
            Arc::new(TagState {
                callback: Box::new(callback),
                dests: (0..size).map(|_| DestQueue::default()).collect(),
                tally: Mutex::new(EpochTally {
                    epoch: 0,
                    seen: bitvec![0; size],
                    complete: false,
                }),
                tally_cv: Condvar::new(),
                finished: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Spawn the sender, receiver, and dispatcher workers.
    pub fn init_communication(&mut self) -> Result<(), CommError> {
        let job_rx = self.job_rx.take().ok_or(CommError::AlreadyRunning)?;
        let (dispatch_tx, dispatch_rx) = unbounded();

        let shared = Arc::clone(&self.shared);
        self.sender = Some(
            std::thread::Builder::new()
                .name("kgrid-sender".into())
                .spawn(move || sender_worker(shared, job_rx))
                .expect("spawn sender worker"),
        );

        let transport = Arc::clone(&self.shared.transport);
        self.receiver = Some(
            std::thread::Builder::new()
                .name("kgrid-receiver".into())
                .spawn(move || receive_worker(transport, dispatch_tx))
                .expect("spawn receive worker"),
        );

        let shared = Arc::clone(&self.shared);
        self.dispatcher = Some(
            std::thread::Builder::new()
                .name("kgrid-dispatcher".into())
                .spawn(move || dispatch_worker(shared, dispatch_rx))
                .expect("spawn dispatch worker"),
        );

        self.shared.running.store(true, Ordering::Release);
        log::debug!(
            "rank {}/{}: communication layer running",
            self.rank(),
            self.size()
        );
        Ok(())
    }

    /// Enqueue `payload` for `dst` under `tag`. Thread-safe;
    /// non-blocking except for free-pool back-pressure.
    pub fn send_message(&self, payload: &[u8], dst: usize, tag: Tag) -> Result<(), CommError> {
        self.shared.send_message(payload, dst, tag)
    }

    /// Collective. When it returns, every payload whose `send_message`
    /// completed before flush was entered — on any rank — has been
    /// delivered and dispatched to its callback on its destination, and
    /// the per-tag callback queues are drained everywhere. Sends racing
    /// with the flush land in the following epoch.
    pub fn flush(&self, tag: Tag) -> Result<(), CommError> {
        let state = self.checked_tag(tag)?;
        if state.finished.load(Ordering::Acquire) {
            return Err(CommError::TagFinished(tag));
        }
        self.flush_tag(&state, tag);
        Ok(())
    }

    /// Collective. Flushes `tag` and retires it: subsequent sends and a
    /// repeated finish fail. The repeat failure is local and happens
    /// before any collective step, so peers cannot be left hanging in
    /// the handshake.
    pub fn finish(&self, tag: Tag) -> Result<(), CommError> {
        let state = self.checked_tag(tag)?;
        if state.finished.swap(true, Ordering::AcqRel) {
            return Err(CommError::TagFinished(tag));
        }
        self.flush_tag(&state, tag);
        log::debug!("rank {}: tag {} finished", self.rank(), tag);
        Ok(())
    }

    /// Collective shutdown: finishes any still-open tags, joins the
    /// workers, and guarantees no callback runs after return.
    pub fn finish_communication(&mut self) -> Result<(), CommError> {
        if self.shut_down || !self.shared.running.load(Ordering::Acquire) {
            return Err(CommError::NotRunning);
        }
        // Remaining tags are finished in sorted order so every rank
        // walks the same collective sequence.
        let mut open: Vec<(Tag, Arc<TagState>)> = {
            let tags = self.shared.tags.read();
            tags.iter()
                .filter(|(_, s)| !s.finished.load(Ordering::Acquire))
                .map(|(t, s)| (*t, Arc::clone(s)))
                .collect()
        };
        open.sort_by_key(|(t, _)| *t);
        for (tag, state) in open {
            if !state.finished.swap(true, Ordering::AcqRel) {
                self.flush_tag(&state, tag);
            }
        }
        self.shared.transport.barrier();
        self.shared.running.store(false, Ordering::Release);

        self.shared
            .jobs
            .send(SendJob::Stop)
            .expect("sender worker disappeared");
        if let Some(h) = self.sender.take() {
            h.join().expect("sender worker panicked");
        }
        // All outbound frames are on the wire; poison our own inbox.
        self.shared
            .transport
            .send(self.shared.transport.rank(), Frame::Shutdown);
        if let Some(h) = self.receiver.take() {
            h.join().expect("receive worker panicked");
        }
        if let Some(h) = self.dispatcher.take() {
            h.join().expect("dispatch worker panicked");
        }
        // Drop callbacks; they may hold handles back into this layer.
        self.shared.tags.write().clear();
        self.shut_down = true;
        log::debug!("rank {}: communication layer shut down", self.rank());
        Ok(())
    }

    fn checked_tag(&self, tag: Tag) -> Result<Arc<TagState>, CommError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(CommError::NotRunning);
        }
        if tag == CONTROL_TAG {
            return Err(CommError::ReservedTag(tag));
        }
        self.shared
            .tags
            .read()
            .get(&tag)
            .cloned()
            .ok_or(CommError::UnknownTag(tag))
    }

    /// End-of-epoch handshake: seal and ship the tag's active buffers,
    /// send an end-of-epoch token to every rank behind them, wait until
    /// tokens from all ranks have passed through the local dispatcher
    /// (which proves every earlier payload was dispatched), then close
    /// the epoch with a barrier.
    fn flush_tag(&self, state: &TagState, tag: Tag) {
        let shared = &self.shared;
        let size = shared.transport.size();
        let epoch = state.tally.lock().epoch;
        for (dst, queue) in state.dests.iter().enumerate() {
            queue.flush_active(&shared.pool, |buffer| {
                shared
                    .jobs
                    .send(SendJob::Buffer { tag, dst, buffer })
                    .expect("sender worker disappeared");
            });
            shared
                .jobs
                .send(SendJob::Token { tag, dst, epoch })
                .expect("sender worker disappeared");
        }

        let mut tally = state.tally.lock();
        while !(tally.complete && tally.epoch == epoch) {
            state.tally_cv.wait(&mut tally);
        }
        tally.epoch += 1;
        tally.seen.fill(false);
        tally.complete = false;
        drop(tally);

        shared.transport.barrier();
        log::trace!(
            "rank {}: tag {} epoch {} flushed ({} ranks)",
            shared.transport.rank(),
            tag,
            epoch,
            size
        );
    }
}

fn sender_worker(shared: Arc<Shared>, jobs: Receiver<SendJob>) {
    let rank = shared.transport.rank();
    for job in jobs.iter() {
        match job {
            SendJob::Buffer { tag, dst, buffer } => {
                let payload = buffer.sealed_bytes().to_vec();
                shared.transport.send(
                    dst,
                    Frame::Data {
                        tag,
                        src: rank,
                        payload,
                    },
                );
                shared.pool.release(buffer);
            }
            SendJob::Token { tag, dst, epoch } => {
                shared.transport.send(
                    dst,
                    Frame::Token {
                        tag,
                        src: rank,
                        epoch,
                    },
                );
            }
            SendJob::Stop => break,
        }
    }
}

fn receive_worker(transport: Arc<dyn Transport>, dispatch: Sender<Dispatch>) {
    loop {
        match transport.recv() {
            Frame::Shutdown => {
                let _ = dispatch.send(Dispatch::Stop);
                break;
            }
            frame => {
                if dispatch.send(Dispatch::Frame(frame)).is_err() {
                    break;
                }
            }
        }
    }
}

fn dispatch_worker(shared: Arc<Shared>, queue: Receiver<Dispatch>) {
    for item in queue.iter() {
        match item {
            Dispatch::Stop => break,
            Dispatch::Frame(frame) => {
                // A panic escaping dispatch (a callback included) must
                // take the whole process down: an unwound dispatcher
                // would leave every rank of the next flush waiting for
                // tokens that never come.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    dispatch_frame(&shared, frame)
                }));
                if outcome.is_err() {
                    log::error!(
                        "rank {}: dispatch worker panicked, aborting",
                        shared.transport.rank()
                    );
                    std::process::abort();
                }
            }
        }
    }
}

fn dispatch_frame(shared: &Shared, frame: Frame) {
    let size = shared.transport.size();
    match frame {
        Frame::Data { tag, src, payload } => {
            let state = shared
                .tags
                .read()
                .get(&tag)
                .cloned()
                .unwrap_or_else(|| panic!("no callback registered for tag {}", tag));
            (state.callback)(&payload, src);
        }
        Frame::Token { tag, src, epoch } => {
            let state = shared
                .tags
                .read()
                .get(&tag)
                .cloned()
                .unwrap_or_else(|| panic!("token for unregistered tag {}", tag));
            let mut tally = state.tally.lock();
            assert_eq!(
                epoch, tally.epoch,
                "tag {}: token from rank {} belongs to a different epoch",
                tag, src
            );
            assert!(
                !tally.seen[src],
                "tag {}: duplicate token from rank {}",
                tag, src
            );
            tally.seen.set(src, true);
            if tally.seen.count_ones() == size {
                tally.complete = true;
                state.tally_cv.notify_all();
            }
        }
        Frame::Shutdown => unreachable!("receive worker consumes shutdown frames"),
    }
}
