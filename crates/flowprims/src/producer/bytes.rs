use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use flowprims_queue::SizedQueue;
use flowprims_task::{spawn, Deferred};
use tracing::debug;

use crate::config::ByteProducerConfig;
use crate::error::{Result, StreamError};
use crate::hooks::ByteSource;
use crate::producer::zero_copy::{ByteReader, ByteView, ZeroCopyRead, ZeroCopyReader};
use crate::producer::ProducerState;
use crate::{ByteReadFuture, Completion, ZeroCopyReadFuture};

struct ByteStreamCore {
    state: ProducerState,
    stored_error: Option<StreamError>,
    reader: Option<ByteReaderCore>,
}

/// Reader-kind dispatch: a byte stream serves whole-chunk reads or
/// zero-copy reads depending on which reader holds the lock.
enum ByteReaderCore {
    Chunks {
        read_requests: VecDeque<Deferred<Option<Bytes>, StreamError>>,
        closed: Deferred<(), StreamError>,
    },
    ZeroCopy {
        closed: Deferred<(), StreamError>,
    },
}

impl ByteReaderCore {
    fn closed(&self) -> &Deferred<(), StreamError> {
        match self {
            ByteReaderCore::Chunks { closed, .. } => closed,
            ByteReaderCore::ZeroCopy { closed } => closed,
        }
    }
}

/// A registered destination buffer awaiting bytes.
///
/// The buffer is exclusively owned here until the descriptor fulfils;
/// the caller's handle was moved in and only comes back on settlement.
struct PullInto {
    buffer: BytesMut,
    filled: usize,
    element_size: usize,
    kind: PullIntoKind,
}

enum PullIntoKind {
    ZeroCopy(Deferred<ZeroCopyRead, StreamError>),
    Auto(Deferred<Option<Bytes>, StreamError>),
}

struct ByteCtlCore {
    queue: SizedQueue<Bytes>,
    pending_pull_intos: VecDeque<PullInto>,
    started: bool,
    pulling: bool,
    pull_again: bool,
    close_requested: bool,
    high_water_mark: f64,
    auto_allocate: Option<usize>,
}

/// Copy queued bytes into the head descriptor.
///
/// Returns true once the descriptor holds at least one whole element and
/// can fulfil. When fulfilling, only an element-aligned count is copied and
/// the remainder stays queued; when not, everything available moves into
/// the descriptor as a partial fill.
fn fill_descriptor(desc: &mut PullInto, queue: &mut SizedQueue<Bytes>) -> bool {
    let available = queue.total_size() as usize;
    let remaining = desc.buffer.len() - desc.filled;
    let max_copy = available.min(remaining);
    let max_filled = desc.filled + max_copy;
    let aligned = max_filled - (max_filled % desc.element_size);
    let (to_copy, ready) = if aligned >= desc.element_size {
        (aligned - desc.filled, true)
    } else {
        (max_copy, false)
    };
    let mut copied = 0;
    while copied < to_copy {
        let Some(mut chunk) = queue.dequeue_first() else {
            break;
        };
        let take = chunk.len().min(to_copy - copied);
        desc.buffer[desc.filled + copied..desc.filled + copied + take]
            .copy_from_slice(&chunk[..take]);
        copied += take;
        if take < chunk.len() {
            let rest = chunk.split_off(take);
            let rest_len = rest.len();
            queue.prepend(rest, rest_len as f64);
        }
    }
    desc.filled += copied;
    ready
}

fn commit_descriptor(mut desc: PullInto, done: bool) {
    desc.buffer.truncate(desc.filled);
    match desc.kind {
        PullIntoKind::ZeroCopy(request) => request.resolve(ZeroCopyRead {
            view: ByteView::from_parts(desc.buffer, desc.element_size),
            done,
        }),
        PullIntoKind::Auto(request) => {
            if done && desc.filled == 0 {
                request.resolve(None);
            } else {
                request.resolve(Some(desc.buffer.freeze()));
            }
        }
    }
}

/// Shared state of one byte producer stream; same cell discipline as the
/// default controller.
pub(crate) struct ByteShared {
    stream: Rc<RefCell<ByteStreamCore>>,
    ctl: Rc<RefCell<ByteCtlCore>>,
    source: Rc<RefCell<Option<Box<dyn ByteSource>>>>,
}

impl Clone for ByteShared {
    fn clone(&self) -> Self {
        Self {
            stream: Rc::clone(&self.stream),
            ctl: Rc::clone(&self.ctl),
            source: Rc::clone(&self.source),
        }
    }
}

impl ByteShared {
    pub(crate) fn new(source: Box<dyn ByteSource>, config: ByteProducerConfig) -> Self {
        let shared = Self {
            stream: Rc::new(RefCell::new(ByteStreamCore {
                state: ProducerState::Readable,
                stored_error: None,
                reader: None,
            })),
            ctl: Rc::new(RefCell::new(ByteCtlCore {
                queue: SizedQueue::new(),
                pending_pull_intos: VecDeque::new(),
                started: false,
                pulling: false,
                pull_again: false,
                close_requested: false,
                high_water_mark: config.high_water_mark,
                auto_allocate: config.auto_allocate_chunk_size,
            })),
            source: Rc::new(RefCell::new(Some(source))),
        };
        shared.spawn_start();
        shared
    }

    fn controller(&self) -> ByteController {
        ByteController {
            shared: self.clone(),
        }
    }

    fn spawn_start(&self) {
        let shared = self.clone();
        spawn(async move {
            let hook = {
                let controller = shared.controller();
                let mut source = shared.source.borrow_mut();
                source.as_mut().map(|s| s.start(&controller))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            shared.ctl.borrow_mut().started = true;
            match outcome {
                Ok(()) => shared.call_pull_if_needed(),
                Err(reason) => shared.error(reason),
            }
        });
    }

    // ---- observability ----

    pub(crate) fn state(&self) -> ProducerState {
        self.stream.borrow().state
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.stream.borrow().stored_error.clone()
    }

    pub(crate) fn locked(&self) -> bool {
        self.stream.borrow().reader.is_some()
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.stream.borrow().state {
            ProducerState::Readable => {
                let ctl = self.ctl.borrow();
                Some(ctl.high_water_mark - ctl.queue.total_size())
            }
            ProducerState::Closed => Some(0.0),
            ProducerState::Errored => None,
        }
    }

    // ---- controller operations ----

    pub(crate) fn enqueue(&self, chunk: Bytes) -> Result<()> {
        if self.stream.borrow().state != ProducerState::Readable {
            return Err(StreamError::InvalidState("enqueue on a non-readable stream"));
        }
        if self.ctl.borrow().close_requested {
            return Err(StreamError::InvalidState("enqueue after close requested"));
        }
        {
            let mut ctl = self.ctl.borrow_mut();
            let size = chunk.len() as f64;
            ctl.queue.append(chunk, size);
        }
        self.process_pull_intos();
        self.fulfil_chunk_reads();
        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        if self.stream.borrow().state != ProducerState::Readable {
            return Err(StreamError::InvalidState("close on a non-readable stream"));
        }
        {
            let mut ctl = self.ctl.borrow_mut();
            if ctl.close_requested {
                return Err(StreamError::InvalidState("close already requested"));
            }
            ctl.close_requested = true;
            if !ctl.queue.is_empty() {
                // Queued bytes drain through reads first.
                return Ok(());
            }
        }
        if self.head_partial_misaligned() {
            let reason = StreamError::ClosedWithPendingBytes;
            self.error(reason.clone());
            return Err(reason);
        }
        self.finish_close();
        Ok(())
    }

    pub(crate) fn error(&self, reason: StreamError) {
        {
            let mut stream = self.stream.borrow_mut();
            if stream.state != ProducerState::Readable {
                return;
            }
            stream.state = ProducerState::Errored;
            stream.stored_error = Some(reason.clone());
        }
        debug!(error = %reason, "byte producer errored");
        let descriptors = {
            let mut ctl = self.ctl.borrow_mut();
            ctl.queue.clear();
            ctl.pull_again = false;
            std::mem::take(&mut ctl.pending_pull_intos)
        };
        for desc in descriptors {
            match desc.kind {
                PullIntoKind::ZeroCopy(request) => request.reject(reason.clone()),
                PullIntoKind::Auto(request) => request.reject(reason.clone()),
            }
        }
        let drained = {
            let mut stream = self.stream.borrow_mut();
            stream.reader.as_mut().map(|reader| {
                let closed = reader.closed().clone();
                let requests = match reader {
                    ByteReaderCore::Chunks { read_requests, .. } => {
                        std::mem::take(read_requests)
                    }
                    ByteReaderCore::ZeroCopy { .. } => VecDeque::new(),
                };
                (requests, closed)
            })
        };
        if let Some((requests, closed)) = drained {
            for request in requests {
                request.reject(reason.clone());
            }
            closed.reject(reason);
        }
        self.dispose_source();
    }

    // ---- close bookkeeping ----

    fn head_partial_misaligned(&self) -> bool {
        let ctl = self.ctl.borrow();
        ctl.pending_pull_intos
            .front()
            .map(|desc| desc.filled % desc.element_size != 0)
            .unwrap_or(false)
    }

    /// Close once the queue is empty: a misaligned partial errors the
    /// stream, an aligned non-empty partial is delivered `done=false`, and
    /// every remaining descriptor comes back `done=true`.
    fn finish_close(&self) {
        if self.head_partial_misaligned() {
            self.error(StreamError::ClosedWithPendingBytes);
            return;
        }
        let partial = {
            let mut ctl = self.ctl.borrow_mut();
            if ctl
                .pending_pull_intos
                .front()
                .map(|desc| desc.filled > 0)
                .unwrap_or(false)
            {
                ctl.pending_pull_intos.pop_front()
            } else {
                None
            }
        };
        if let Some(desc) = partial {
            commit_descriptor(desc, false);
        }
        self.close_stream();
    }

    fn close_stream(&self) {
        {
            let mut stream = self.stream.borrow_mut();
            debug_assert_eq!(stream.state, ProducerState::Readable);
            stream.state = ProducerState::Closed;
        }
        debug!("byte producer closed");
        let descriptors = {
            let mut ctl = self.ctl.borrow_mut();
            std::mem::take(&mut ctl.pending_pull_intos)
        };
        // Outstanding buffers go back to their callers, empty and done.
        for desc in descriptors {
            commit_descriptor(desc, true);
        }
        let drained = {
            let mut stream = self.stream.borrow_mut();
            stream.reader.as_mut().map(|reader| {
                let closed = reader.closed().clone();
                let requests = match reader {
                    ByteReaderCore::Chunks { read_requests, .. } => {
                        std::mem::take(read_requests)
                    }
                    ByteReaderCore::ZeroCopy { .. } => VecDeque::new(),
                };
                (requests, closed)
            })
        };
        if let Some((requests, closed)) = drained {
            for request in requests {
                request.resolve(None);
            }
            closed.resolve(());
        }
        self.dispose_source();
    }

    fn maybe_finish_close(&self) -> bool {
        let finish = {
            let ctl = self.ctl.borrow();
            ctl.close_requested && ctl.queue.is_empty()
        };
        if finish && self.stream.borrow().state == ProducerState::Readable {
            self.finish_close();
            return true;
        }
        false
    }

    fn dispose_source(&self) {
        let source = Rc::clone(&self.source);
        spawn(async move {
            source.borrow_mut().take();
        });
    }

    // ---- descriptor servicing ----

    fn process_pull_intos(&self) {
        loop {
            let committed = {
                let mut ctl = self.ctl.borrow_mut();
                let ByteCtlCore {
                    queue,
                    pending_pull_intos,
                    ..
                } = &mut *ctl;
                if queue.is_empty() {
                    None
                } else if let Some(head) = pending_pull_intos.front_mut() {
                    if fill_descriptor(head, queue) {
                        pending_pull_intos.pop_front()
                    } else {
                        None
                    }
                } else {
                    None
                }
            };
            match committed {
                Some(desc) => commit_descriptor(desc, false),
                None => break,
            }
        }
    }

    fn fulfil_chunk_reads(&self) {
        loop {
            let fulfilled = {
                let mut stream = self.stream.borrow_mut();
                let Some(ByteReaderCore::Chunks { read_requests, .. }) = stream.reader.as_mut()
                else {
                    break;
                };
                if read_requests.is_empty() {
                    break;
                }
                let mut ctl = self.ctl.borrow_mut();
                match ctl.queue.dequeue_first() {
                    Some(chunk) => read_requests.pop_front().map(|request| (request, chunk)),
                    None => break,
                }
            };
            match fulfilled {
                Some((request, chunk)) => request.resolve(Some(chunk)),
                None => break,
            }
        }
    }

    // ---- pull scheduling ----

    fn should_pull(&self) -> bool {
        let stream = self.stream.borrow();
        if stream.state != ProducerState::Readable {
            return false;
        }
        let ctl = self.ctl.borrow();
        if ctl.close_requested || !ctl.started {
            return false;
        }
        if let Some(ByteReaderCore::Chunks { read_requests, .. }) = stream.reader.as_ref() {
            if !read_requests.is_empty() {
                return true;
            }
        }
        if !ctl.pending_pull_intos.is_empty() {
            return true;
        }
        ctl.high_water_mark - ctl.queue.total_size() > 0.0
    }

    fn call_pull_if_needed(&self) {
        if !self.should_pull() {
            return;
        }
        {
            let mut ctl = self.ctl.borrow_mut();
            if ctl.pulling {
                ctl.pull_again = true;
                return;
            }
            ctl.pulling = true;
        }
        let shared = self.clone();
        spawn(async move {
            let hook = {
                let controller = shared.controller();
                let mut source = shared.source.borrow_mut();
                source.as_mut().map(|s| s.pull(&controller))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            match outcome {
                Ok(()) => {
                    let again = {
                        let mut ctl = shared.ctl.borrow_mut();
                        ctl.pulling = false;
                        std::mem::take(&mut ctl.pull_again)
                    };
                    if again {
                        shared.call_pull_if_needed();
                    }
                }
                Err(reason) => {
                    shared.ctl.borrow_mut().pulling = false;
                    shared.error(reason);
                }
            }
        });
    }

    // ---- reader operations ----

    fn seed_closed(&self) -> Deferred<(), StreamError> {
        let stream = self.stream.borrow();
        match stream.state {
            ProducerState::Readable => Deferred::new(),
            ProducerState::Closed => Deferred::resolved(()),
            ProducerState::Errored => Deferred::rejected(
                stream
                    .stored_error
                    .clone()
                    .unwrap_or(StreamError::InvalidState("stream errored")),
            ),
        }
    }

    pub(crate) fn acquire_chunk_reader(&self) -> Result<Deferred<(), StreamError>> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        let closed = self.seed_closed();
        self.stream.borrow_mut().reader = Some(ByteReaderCore::Chunks {
            read_requests: VecDeque::new(),
            closed: closed.clone(),
        });
        Ok(closed)
    }

    pub(crate) fn acquire_zero_copy_reader(&self) -> Result<Deferred<(), StreamError>> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        let closed = self.seed_closed();
        self.stream.borrow_mut().reader = Some(ByteReaderCore::ZeroCopy {
            closed: closed.clone(),
        });
        Ok(closed)
    }

    pub(crate) fn release_reader(&self) {
        let taken = self.stream.borrow_mut().reader.take();
        let Some(core) = taken else {
            return;
        };
        // Descriptors belong to the departing reader's reads.
        let descriptors = {
            let mut ctl = self.ctl.borrow_mut();
            std::mem::take(&mut ctl.pending_pull_intos)
        };
        for desc in descriptors {
            match desc.kind {
                PullIntoKind::ZeroCopy(request) => request.reject(StreamError::LockReleased),
                PullIntoKind::Auto(request) => request.reject(StreamError::LockReleased),
            }
        }
        match core {
            ByteReaderCore::Chunks {
                read_requests,
                closed,
            } => {
                for request in read_requests {
                    request.reject(StreamError::LockReleased);
                }
                closed.reject(StreamError::LockReleased);
            }
            ByteReaderCore::ZeroCopy { closed } => {
                closed.reject(StreamError::LockReleased);
            }
        }
    }

    pub(crate) fn read_chunk(&self) -> ByteReadFuture {
        let (state, stored) = {
            let stream = self.stream.borrow();
            (stream.state, stream.stored_error.clone())
        };
        match state {
            ProducerState::Closed => Deferred::resolved(None).claim(),
            ProducerState::Errored => {
                Deferred::rejected(stored.unwrap_or(StreamError::InvalidState("stream errored")))
                    .claim()
            }
            ProducerState::Readable => {
                let dequeued = self.ctl.borrow_mut().queue.dequeue_first();
                if let Some(chunk) = dequeued {
                    if !self.maybe_finish_close() {
                        self.call_pull_if_needed();
                    }
                    return Deferred::resolved(Some(chunk)).claim();
                }
                let request = Deferred::new();
                let auto = self.ctl.borrow().auto_allocate;
                match auto {
                    Some(chunk_size) => {
                        let mut ctl = self.ctl.borrow_mut();
                        ctl.pending_pull_intos.push_back(PullInto {
                            buffer: BytesMut::zeroed(chunk_size),
                            filled: 0,
                            element_size: 1,
                            kind: PullIntoKind::Auto(request.clone()),
                        });
                    }
                    None => {
                        let mut stream = self.stream.borrow_mut();
                        match stream.reader.as_mut() {
                            Some(ByteReaderCore::Chunks { read_requests, .. }) => {
                                read_requests.push_back(request.clone());
                            }
                            _ => {
                                return Deferred::rejected(StreamError::InvalidState(
                                    "reader released",
                                ))
                                .claim()
                            }
                        }
                    }
                }
                self.call_pull_if_needed();
                request.claim()
            }
        }
    }

    pub(crate) fn read_into(&self, view: ByteView) -> ZeroCopyReadFuture {
        let (state, stored) = {
            let stream = self.stream.borrow();
            (stream.state, stream.stored_error.clone())
        };
        match state {
            ProducerState::Errored => {
                Deferred::rejected(stored.unwrap_or(StreamError::InvalidState("stream errored")))
                    .claim()
            }
            ProducerState::Closed => Deferred::resolved(ZeroCopyRead {
                view: view.emptied(),
                done: true,
            })
            .claim(),
            ProducerState::Readable => {
                let request = Deferred::new();
                let (buffer, element_size) = view.into_parts();
                {
                    let mut ctl = self.ctl.borrow_mut();
                    ctl.pending_pull_intos.push_back(PullInto {
                        buffer,
                        filled: 0,
                        element_size,
                        kind: PullIntoKind::ZeroCopy(request.clone()),
                    });
                }
                self.process_pull_intos();
                if !self.maybe_finish_close() {
                    self.call_pull_if_needed();
                }
                request.claim()
            }
        }
    }

    pub(crate) fn cancel(&self, reason: StreamError) -> Completion {
        {
            let stream = self.stream.borrow();
            match stream.state {
                ProducerState::Closed => return Deferred::resolved(()).wait(),
                ProducerState::Errored => {
                    return Deferred::rejected(
                        stream
                            .stored_error
                            .clone()
                            .unwrap_or(StreamError::InvalidState("stream errored")),
                    )
                    .wait()
                }
                ProducerState::Readable => {}
            }
        }
        debug!(reason = %reason, "byte producer cancelled");
        let result = Deferred::new();
        // Spawned before `close_stream` so the hook claims the source box
        // ahead of the disposal task.
        let shared = self.clone();
        let settle = result.clone();
        spawn(async move {
            let hook = {
                let mut source = shared.source.borrow_mut();
                source.take().map(|mut s| s.cancel(reason))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            match outcome {
                Ok(()) => settle.resolve(()),
                Err(reason) => settle.reject(reason),
            }
        });
        self.ctl.borrow_mut().queue.clear();
        self.close_stream();
        result.wait()
    }
}

/// Handle passed to [`ByteSource`] hooks for feeding a byte producer
/// stream.
#[derive(Clone)]
pub struct ByteController {
    shared: ByteShared,
}

impl ByteController {
    /// Queue a chunk of bytes; waiting zero-copy buffers and chunk reads
    /// are serviced in order.
    pub fn enqueue(&self, chunk: Bytes) -> Result<()> {
        self.shared.enqueue(chunk)
    }

    /// No more bytes will be enqueued. Queued bytes still drain through
    /// reads before the stream reports end-of-stream.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Move the stream to the errored state, rejecting all pending and
    /// future reads with `reason`.
    pub fn error(&self, reason: StreamError) {
        self.shared.error(reason)
    }

    /// Remaining queue capacity: high-water mark minus queued bytes.
    /// `Some(0)` once closed, `None` once errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.desired_size()
    }
}

/// A backpressure-aware byte producer stream with zero-copy reads.
///
/// Like [`ProducerStream`](crate::ProducerStream) but specialised to
/// bytes: in addition to whole-chunk reads through a [`ByteReader`], a
/// [`ZeroCopyReader`] fills caller-supplied buffers in place.
pub struct ByteProducerStream {
    pub(crate) shared: ByteShared,
}

impl ByteProducerStream {
    /// Create a byte stream with the default configuration (high-water
    /// mark 0: pulls are driven by reader demand).
    pub fn new(source: impl ByteSource + 'static) -> Self {
        Self {
            shared: ByteShared::new(Box::new(source), ByteProducerConfig::default()),
        }
    }

    /// Create a byte stream with explicit configuration.
    pub fn with_config(
        source: impl ByteSource + 'static,
        config: ByteProducerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: ByteShared::new(Box::new(source), config),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProducerState {
        self.shared.state()
    }

    /// The stored error, once errored.
    pub fn stored_error(&self) -> Option<StreamError> {
        self.shared.stored_error()
    }

    /// True while a reader holds the stream's lock.
    pub fn locked(&self) -> bool {
        self.shared.locked()
    }

    /// Acquire the exclusive whole-chunk reader.
    pub fn get_reader(&self) -> Result<ByteReader> {
        let closed = self.shared.acquire_chunk_reader()?;
        Ok(ByteReader::new(self.shared.clone(), closed))
    }

    /// Acquire the exclusive zero-copy (bring-your-own-buffer) reader.
    pub fn get_zero_copy_reader(&self) -> Result<ZeroCopyReader> {
        let closed = self.shared.acquire_zero_copy_reader()?;
        Ok(ZeroCopyReader::new(self.shared.clone(), closed))
    }

    /// Cancel the stream without a reader attached. Fails immediately
    /// with [`StreamError::Locked`] while locked.
    pub fn cancel(&self, reason: StreamError) -> Completion {
        if self.shared.locked() {
            return Deferred::rejected(StreamError::Locked).wait();
        }
        self.shared.cancel(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use flowprims_task::run_local;

    use super::*;
    use crate::hooks::{self, HookFuture};

    /// Enqueues its payload from the start hook and closes on the first
    /// pull.
    struct EagerByteSource {
        data: Bytes,
    }

    impl ByteSource for EagerByteSource {
        fn start(&mut self, controller: &ByteController) -> HookFuture {
            let _ = controller.enqueue(self.data.clone());
            hooks::done()
        }

        fn pull(&mut self, controller: &ByteController) -> HookFuture {
            let _ = controller.close();
            hooks::done()
        }
    }

    /// Hands its controller out so the test drives the stream directly.
    struct RemoteByteSource {
        controller: Rc<RefCell<Option<ByteController>>>,
        cancels: Rc<Cell<u32>>,
    }

    impl RemoteByteSource {
        fn new() -> (Self, Rc<RefCell<Option<ByteController>>>, Rc<Cell<u32>>) {
            let controller = Rc::new(RefCell::new(None));
            let cancels = Rc::new(Cell::new(0));
            (
                Self {
                    controller: Rc::clone(&controller),
                    cancels: Rc::clone(&cancels),
                },
                controller,
                cancels,
            )
        }
    }

    impl ByteSource for RemoteByteSource {
        fn start(&mut self, controller: &ByteController) -> HookFuture {
            *self.controller.borrow_mut() = Some(controller.clone());
            hooks::done()
        }

        fn cancel(&mut self, _reason: StreamError) -> HookFuture {
            self.cancels.set(self.cancels.get() + 1);
            hooks::done()
        }
    }

    async fn settled_controller(slot: &Rc<RefCell<Option<ByteController>>>) -> ByteController {
        loop {
            if let Some(controller) = slot.borrow().as_ref() {
                return controller.clone();
            }
            tokio::task::yield_now().await;
        }
    }

    fn view(len: usize) -> ByteView {
        ByteView::new(BytesMut::zeroed(len)).expect("non-empty view")
    }

    #[test]
    fn zero_copy_reads_fill_caller_buffers_in_order() {
        run_local(async {
            let stream = ByteProducerStream::new(EagerByteSource {
                data: Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7]),
            });
            let reader = stream.get_zero_copy_reader().expect("unlocked");

            let first = reader.read(view(4)).await.expect("read");
            assert!(!first.done);
            assert_eq!(first.view.as_slice(), &[0, 1, 2, 3]);

            // The same memory goes back in for the next read.
            let buf = first.view.into_inner();
            let second = reader
                .read(ByteView::new(buf).expect("non-empty view"))
                .await
                .expect("read");
            assert!(!second.done);
            assert_eq!(second.view.as_slice(), &[4, 5, 6, 7]);

            let third = reader.read(view(4)).await.expect("read");
            assert!(third.done);
            assert!(third.view.is_empty());
            assert_eq!(stream.state(), ProducerState::Closed);
        });
    }

    #[test]
    fn element_sized_views_carry_whole_elements() {
        run_local(async {
            let stream = ByteProducerStream::new(EagerByteSource {
                data: Bytes::from_static(&[0x34, 0x12, 0x78, 0x56]),
            });
            let reader = stream.get_zero_copy_reader().expect("unlocked");

            let buf = BytesMut::zeroed(2);
            let first = reader
                .read(ByteView::with_element_size(buf, 2).expect("aligned view"))
                .await
                .expect("read");
            assert!(!first.done);
            let value = u16::from_le_bytes([first.view.as_slice()[0], first.view.as_slice()[1]]);
            assert_eq!(value, 0x1234);

            let second = reader
                .read(ByteView::with_element_size(first.view.into_inner(), 2).expect("aligned"))
                .await
                .expect("read");
            let value = u16::from_le_bytes([second.view.as_slice()[0], second.view.as_slice()[1]]);
            assert_eq!(value, 0x5678);

            let third = reader
                .read(ByteView::with_element_size(BytesMut::zeroed(2), 2).expect("aligned"))
                .await
                .expect("read");
            assert!(third.done);
        });
    }

    #[test]
    fn buffer_length_not_dividing_payload_carries_partials_over() {
        run_local(async {
            let stream = ByteProducerStream::new(EagerByteSource {
                data: Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7]),
            });
            let reader = stream.get_zero_copy_reader().expect("unlocked");

            let first = reader.read(view(3)).await.expect("read");
            assert_eq!(first.view.as_slice(), &[0, 1, 2]);
            let second = reader.read(view(3)).await.expect("read");
            assert_eq!(second.view.as_slice(), &[3, 4, 5]);
            // Only two bytes are left; the view comes back short.
            let third = reader.read(view(3)).await.expect("read");
            assert!(!third.done);
            assert_eq!(third.view.as_slice(), &[6, 7]);
            let fourth = reader.read(view(3)).await.expect("read");
            assert!(fourth.done);
        });
    }

    #[test]
    fn close_with_misaligned_partial_fill_errors() {
        run_local(async {
            let (source, slot, _) = RemoteByteSource::new();
            let stream = ByteProducerStream::new(source);
            let reader = stream.get_zero_copy_reader().expect("unlocked");
            let controller = settled_controller(&slot).await;

            let pending = reader.read(
                ByteView::with_element_size(BytesMut::zeroed(4), 2).expect("aligned view"),
            );
            // One byte of a two-byte element arrives, then the source
            // closes on it.
            controller.enqueue(Bytes::from_static(&[9])).expect("readable");
            let outcome = controller.close();
            assert_eq!(outcome, Err(StreamError::ClosedWithPendingBytes));
            assert_eq!(pending.await.unwrap_err(), StreamError::ClosedWithPendingBytes);
            assert_eq!(stream.state(), ProducerState::Errored);
        });
    }

    #[test]
    fn pending_buffers_are_serviced_in_registration_order() {
        run_local(async {
            let (source, slot, _) = RemoteByteSource::new();
            let stream = ByteProducerStream::new(source);
            let reader = stream.get_zero_copy_reader().expect("unlocked");
            let controller = settled_controller(&slot).await;

            let first = reader.read(view(2));
            let second = reader.read(view(2));
            controller
                .enqueue(Bytes::from_static(&[0, 1, 2, 3]))
                .expect("readable");
            let first = first.await.expect("read");
            let second = second.await.expect("read");
            assert_eq!(first.view.as_slice(), &[0, 1]);
            assert_eq!(second.view.as_slice(), &[2, 3]);
        });
    }

    #[test]
    fn auto_allocate_serves_default_reads_without_a_buffer() {
        run_local(async {
            let (source, slot, _) = RemoteByteSource::new();
            let config = ByteProducerConfig {
                high_water_mark: 0.0,
                auto_allocate_chunk_size: Some(16),
            };
            let stream = ByteProducerStream::with_config(source, config).expect("valid config");
            let reader = stream.get_reader().expect("unlocked");
            let controller = settled_controller(&slot).await;

            let pending = reader.read();
            controller
                .enqueue(Bytes::from_static(b"abc"))
                .expect("readable");
            assert_eq!(pending.await, Ok(Some(Bytes::from_static(b"abc"))));
        });
    }

    #[test]
    fn chunk_reads_drain_queued_chunks_whole() {
        run_local(async {
            let (source, slot, _) = RemoteByteSource::new();
            let stream = ByteProducerStream::new(source);
            let reader = stream.get_reader().expect("unlocked");
            let controller = settled_controller(&slot).await;

            controller
                .enqueue(Bytes::from_static(&[1, 2]))
                .expect("readable");
            controller
                .enqueue(Bytes::from_static(&[3]))
                .expect("readable");
            assert_eq!(reader.read().await, Ok(Some(Bytes::from_static(&[1, 2]))));
            assert_eq!(reader.read().await, Ok(Some(Bytes::from_static(&[3]))));
            controller.close().expect("readable");
            assert_eq!(reader.read().await, Ok(None));
        });
    }

    #[test]
    fn cancel_returns_outstanding_buffers_done() {
        run_local(async {
            let (source, slot, cancels) = RemoteByteSource::new();
            let stream = ByteProducerStream::new(source);
            let reader = stream.get_zero_copy_reader().expect("unlocked");
            let _ = settled_controller(&slot).await;

            let pending = reader.read(view(4));
            assert_eq!(reader.cancel(StreamError::other("enough")).await, Ok(()));
            assert_eq!(cancels.get(), 1);
            let outcome = pending.await.expect("buffer returned");
            assert!(outcome.done);
            assert!(outcome.view.is_empty());
            assert_eq!(stream.state(), ProducerState::Closed);
        });
    }
}
