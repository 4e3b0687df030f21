use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use flowprims_queue::SizedQueue;
use flowprims_task::{spawn, Deferred};
use tracing::debug;

use crate::config::{size_fn_or_default, ConsumerConfig, SizeFn};
use crate::consumer::ConsumerState;
use crate::error::{Result, StreamError};
use crate::hooks::Sink;
use crate::Completion;

pub(crate) struct WriterCore {
    /// Pending while backpressure is on; replaced with a fresh pending
    /// deferred each time backpressure re-engages.
    pub(crate) ready: Deferred<(), StreamError>,
    pub(crate) closed: Deferred<(), StreamError>,
}

struct PendingAbort {
    result: Deferred<(), StreamError>,
    reason: StreamError,
    was_already_erroring: bool,
}

struct StreamCore {
    state: ConsumerState,
    stored_error: Option<StreamError>,
    writer: Option<WriterCore>,
    write_requests: VecDeque<Deferred<(), StreamError>>,
    in_flight_write: Option<Deferred<(), StreamError>>,
    in_flight_close: Option<Deferred<(), StreamError>>,
    close_request: Option<Deferred<(), StreamError>>,
    pending_abort: Option<PendingAbort>,
    backpressure: bool,
}

/// Queue entries are writes or the single close marker that trails them.
/// A chunk is taken out of its entry while its write is in flight, so the
/// entry's size still counts toward backpressure until the write settles.
enum QueueEntry<T> {
    Chunk(Option<T>),
    Close,
}

struct CtlCore<T> {
    queue: SizedQueue<QueueEntry<T>>,
    started: bool,
    high_water_mark: f64,
    size: SizeFn<T>,
}

fn ensure_ready_rejected(writer: &mut WriterCore, reason: StreamError) {
    if writer.ready.is_pending() {
        writer.ready.reject(reason);
    } else {
        writer.ready = Deferred::rejected(reason);
    }
}

fn ensure_closed_rejected(writer: &mut WriterCore, reason: StreamError) {
    if writer.closed.is_pending() {
        writer.closed.reject(reason);
    } else {
        writer.closed = Deferred::rejected(reason);
    }
}

/// Shared state of one consumer stream: stream cell, controller cell, sink
/// hook cell. Same borrow discipline as the producer side — hooks are
/// entered only from scheduled tasks, one frame deep.
pub(crate) struct ConsumerShared<T> {
    stream: Rc<RefCell<StreamCore>>,
    ctl: Rc<RefCell<CtlCore<T>>>,
    sink: Rc<RefCell<Option<Box<dyn Sink<Chunk = T>>>>>,
}

impl<T> Clone for ConsumerShared<T> {
    fn clone(&self) -> Self {
        Self {
            stream: Rc::clone(&self.stream),
            ctl: Rc::clone(&self.ctl),
            sink: Rc::clone(&self.sink),
        }
    }
}

impl<T> ConsumerShared<T> {
    pub(crate) fn state(&self) -> ConsumerState {
        self.stream.borrow().state
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.stream.borrow().stored_error.clone()
    }

    pub(crate) fn locked(&self) -> bool {
        self.stream.borrow().writer.is_some()
    }

    fn stored_or_invalid(&self) -> StreamError {
        self.stream
            .borrow()
            .stored_error
            .clone()
            .unwrap_or(StreamError::InvalidState("stream errored"))
    }

    fn close_queued_or_in_flight(&self) -> bool {
        let stream = self.stream.borrow();
        stream.close_request.is_some() || stream.in_flight_close.is_some()
    }

    fn has_in_flight(&self) -> bool {
        let stream = self.stream.borrow();
        stream.in_flight_write.is_some() || stream.in_flight_close.is_some()
    }

    fn get_backpressure(&self) -> bool {
        let ctl = self.ctl.borrow();
        ctl.high_water_mark - ctl.queue.total_size() <= 0.0
    }

    pub(crate) fn writer_desired_size(&self) -> Option<f64> {
        match self.stream.borrow().state {
            ConsumerState::Errored | ConsumerState::Erroring => None,
            ConsumerState::Closed => Some(0.0),
            ConsumerState::Writable => {
                let ctl = self.ctl.borrow();
                Some(ctl.high_water_mark - ctl.queue.total_size())
            }
        }
    }

    pub(crate) fn writer_ready(&self) -> Completion {
        match self.stream.borrow().writer.as_ref() {
            Some(writer) => writer.ready.wait(),
            None => Deferred::rejected(StreamError::LockReleased).wait(),
        }
    }

    pub(crate) fn writer_closed(&self) -> Completion {
        match self.stream.borrow().writer.as_ref() {
            Some(writer) => writer.closed.wait(),
            None => Deferred::rejected(StreamError::LockReleased).wait(),
        }
    }

    // ---- writer lock ----

    pub(crate) fn acquire_writer(&self) -> Result<()> {
        let mut stream = self.stream.borrow_mut();
        if stream.writer.is_some() {
            return Err(StreamError::Locked);
        }
        let stored = stream
            .stored_error
            .clone()
            .unwrap_or(StreamError::InvalidState("stream errored"));
        let close_pending = stream.close_request.is_some() || stream.in_flight_close.is_some();
        let core = match stream.state {
            ConsumerState::Writable => WriterCore {
                ready: if !close_pending && stream.backpressure {
                    Deferred::new()
                } else {
                    Deferred::resolved(())
                },
                closed: Deferred::new(),
            },
            ConsumerState::Erroring => WriterCore {
                ready: Deferred::rejected(stored),
                closed: Deferred::new(),
            },
            ConsumerState::Closed => WriterCore {
                ready: Deferred::resolved(()),
                closed: Deferred::resolved(()),
            },
            ConsumerState::Errored => WriterCore {
                ready: Deferred::rejected(stored.clone()),
                closed: Deferred::rejected(stored),
            },
        };
        stream.writer = Some(core);
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        {
            let mut stream = self.stream.borrow_mut();
            let Some(mut writer) = stream.writer.take() else {
                return;
            };
            ensure_ready_rejected(&mut writer, StreamError::LockReleased);
            ensure_closed_rejected(&mut writer, StreamError::LockReleased);
        }
        // Queued (not in-flight) operations tied to the departing lock
        // settle now instead of blocking their callers forever.
        let requests = std::mem::take(&mut self.stream.borrow_mut().write_requests);
        for request in requests {
            request.reject(StreamError::LockReleased);
        }
        let keep = usize::from(self.stream.borrow().in_flight_write.is_some());
        self.ctl.borrow_mut().queue.truncate(keep);
        let close_request = self.stream.borrow_mut().close_request.take();
        if let Some(request) = close_request {
            request.reject(StreamError::LockReleased);
        }
        let mut stream = self.stream.borrow_mut();
        if stream.state == ConsumerState::Writable {
            let ctl = self.ctl.borrow();
            stream.backpressure = ctl.high_water_mark - ctl.queue.total_size() <= 0.0;
        }
    }
}

impl<T: 'static> ConsumerShared<T> {
    pub(crate) fn new(sink: Box<dyn Sink<Chunk = T>>, config: ConsumerConfig<T>) -> Self {
        let shared = Self {
            stream: Rc::new(RefCell::new(StreamCore {
                state: ConsumerState::Writable,
                stored_error: None,
                writer: None,
                write_requests: VecDeque::new(),
                in_flight_write: None,
                in_flight_close: None,
                close_request: None,
                pending_abort: None,
                // An empty queue already meets a zero high-water mark.
                backpressure: config.high_water_mark <= 0.0,
            })),
            ctl: Rc::new(RefCell::new(CtlCore {
                queue: SizedQueue::new(),
                started: false,
                high_water_mark: config.high_water_mark,
                size: size_fn_or_default(config.size),
            })),
            sink: Rc::new(RefCell::new(Some(sink))),
        };
        shared.spawn_start();
        shared
    }

    fn controller(&self) -> super::ConsumerController<T> {
        super::ConsumerController {
            shared: self.clone(),
        }
    }

    fn spawn_start(&self) {
        let shared = self.clone();
        spawn(async move {
            let hook = {
                let controller = shared.controller();
                let mut sink = shared.sink.borrow_mut();
                sink.as_mut().map(|s| s.start(&controller))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            shared.ctl.borrow_mut().started = true;
            match outcome {
                Ok(()) => shared.advance_queue(),
                Err(reason) => shared.deal_with_rejection(reason),
            }
        });
    }

    // ---- writer-facing operations ----

    pub(crate) fn write(&self, chunk: T) -> Completion {
        // Chunk size comes first; a failing size algorithm errors the
        // stream and the state checks below pick the failure up.
        let size_fn = Rc::clone(&self.ctl.borrow().size);
        let size = size_fn(&chunk);
        let size = if size.is_finite() && size >= 0.0 {
            size
        } else {
            self.error_if_needed(StreamError::SizeAlgorithm(size));
            1.0
        };
        let state = self.state();
        if state == ConsumerState::Errored {
            return Deferred::rejected(self.stored_or_invalid()).wait();
        }
        if self.close_queued_or_in_flight() || state == ConsumerState::Closed {
            return Deferred::rejected(StreamError::InvalidState("write after close")).wait();
        }
        if state == ConsumerState::Erroring {
            return Deferred::rejected(self.stored_or_invalid()).wait();
        }
        debug_assert_eq!(state, ConsumerState::Writable);
        let request = Deferred::new();
        self.stream
            .borrow_mut()
            .write_requests
            .push_back(request.clone());
        self.ctl
            .borrow_mut()
            .queue
            .append(QueueEntry::Chunk(Some(chunk)), size);
        if !self.close_queued_or_in_flight() && self.state() == ConsumerState::Writable {
            let backpressure = self.get_backpressure();
            self.update_backpressure(backpressure);
        }
        self.advance_queue();
        request.wait()
    }

    pub(crate) fn close(&self) -> Completion {
        let state = self.state();
        if state == ConsumerState::Closed || state == ConsumerState::Errored {
            return Deferred::rejected(StreamError::InvalidState(
                "close on a closed or errored stream",
            ))
            .wait();
        }
        if self.close_queued_or_in_flight() {
            return Deferred::rejected(StreamError::InvalidState("close already requested")).wait();
        }
        let request = Deferred::new();
        {
            let mut stream = self.stream.borrow_mut();
            stream.close_request = Some(request.clone());
            // A backpressured writer is unblocked: the queue will drain.
            if stream.backpressure && state == ConsumerState::Writable {
                if let Some(writer) = stream.writer.as_mut() {
                    writer.ready.resolve(());
                }
            }
        }
        self.ctl.borrow_mut().queue.append(QueueEntry::Close, 0.0);
        self.advance_queue();
        request.wait()
    }

    pub(crate) fn abort(&self, reason: StreamError) -> Completion {
        let state = self.state();
        if state == ConsumerState::Closed || state == ConsumerState::Errored {
            return Deferred::resolved(()).wait();
        }
        if let Some(pending) = self.stream.borrow().pending_abort.as_ref() {
            // A second concurrent abort joins the pending one.
            return pending.result.wait();
        }
        let was_already_erroring = state == ConsumerState::Erroring;
        let result = Deferred::new();
        self.stream.borrow_mut().pending_abort = Some(PendingAbort {
            result: result.clone(),
            reason: reason.clone(),
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(reason);
        }
        result.wait()
    }

    /// Close unless one is already queued/in flight or the stream is
    /// closed; propagate the stored error if the stream already failed.
    pub(crate) fn close_or_propagate(&self) -> Completion {
        let state = self.state();
        if self.close_queued_or_in_flight() || state == ConsumerState::Closed {
            return Deferred::resolved(()).wait();
        }
        if state == ConsumerState::Errored {
            return Deferred::rejected(self.stored_or_invalid()).wait();
        }
        self.close()
    }

    // ---- controller-facing operations ----

    pub(crate) fn error_if_needed(&self, reason: StreamError) {
        if self.state() == ConsumerState::Writable {
            self.start_erroring(reason);
        }
    }

    // ---- error path ----

    fn start_erroring(&self, reason: StreamError) {
        {
            let mut stream = self.stream.borrow_mut();
            debug_assert!(stream.stored_error.is_none());
            debug_assert_eq!(stream.state, ConsumerState::Writable);
            stream.state = ConsumerState::Erroring;
            stream.stored_error = Some(reason.clone());
            if let Some(writer) = stream.writer.as_mut() {
                ensure_ready_rejected(writer, reason.clone());
            }
        }
        debug!(error = %reason, "consumer erroring");
        // An in-flight operation settles first; its completion resumes
        // the transition.
        if !self.has_in_flight() && self.ctl.borrow().started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&self) {
        {
            let mut stream = self.stream.borrow_mut();
            debug_assert_eq!(stream.state, ConsumerState::Erroring);
            debug_assert!(
                stream.in_flight_write.is_none() && stream.in_flight_close.is_none()
            );
            stream.state = ConsumerState::Errored;
        }
        self.ctl.borrow_mut().queue.clear();
        let stored = self.stored_or_invalid();
        debug!(error = %stored, "consumer errored");
        let requests = std::mem::take(&mut self.stream.borrow_mut().write_requests);
        for request in requests {
            request.reject(stored.clone());
        }
        let pending = self.stream.borrow_mut().pending_abort.take();
        match pending {
            None => {
                self.reject_close_and_closed();
                self.dispose_sink();
            }
            Some(abort) if abort.was_already_erroring => {
                abort.result.reject(stored.clone());
                self.reject_close_and_closed();
                self.dispose_sink();
            }
            Some(abort) => {
                debug!(reason = %abort.reason, "consumer aborting");
                let shared = self.clone();
                spawn(async move {
                    let hook = {
                        let mut sink = shared.sink.borrow_mut();
                        sink.take().map(|mut s| s.abort(abort.reason.clone()))
                    };
                    let outcome = match hook {
                        Some(hook) => hook.await,
                        None => Ok(()),
                    };
                    match outcome {
                        Ok(()) => abort.result.resolve(()),
                        Err(reason) => abort.result.reject(reason),
                    }
                    shared.reject_close_and_closed();
                });
            }
        }
    }

    /// Once the stream finishes in the errored state, any queued close
    /// request and the writer's closed notification settle with the
    /// stored error.
    fn reject_close_and_closed(&self) {
        let stored = self.stored_or_invalid();
        let close_request = self.stream.borrow_mut().close_request.take();
        if let Some(request) = close_request {
            request.reject(stored.clone());
        }
        let mut stream = self.stream.borrow_mut();
        if let Some(writer) = stream.writer.as_mut() {
            ensure_closed_rejected(writer, stored);
        }
    }

    fn deal_with_rejection(&self, reason: StreamError) {
        if self.state() == ConsumerState::Writable {
            self.start_erroring(reason);
            return;
        }
        debug_assert_eq!(self.state(), ConsumerState::Erroring);
        self.finish_erroring();
    }

    fn dispose_sink(&self) {
        let sink = Rc::clone(&self.sink);
        spawn(async move {
            sink.borrow_mut().take();
        });
    }

    // ---- queue advancement ----

    fn advance_queue(&self) {
        if !self.ctl.borrow().started {
            return;
        }
        if self.stream.borrow().in_flight_write.is_some() {
            return;
        }
        let state = self.state();
        if state == ConsumerState::Closed || state == ConsumerState::Errored {
            return;
        }
        if state == ConsumerState::Erroring {
            self.finish_erroring();
            return;
        }
        let next_write = {
            let mut ctl = self.ctl.borrow_mut();
            match ctl.queue.peek_first_mut() {
                None => return,
                Some(QueueEntry::Close) => None,
                Some(QueueEntry::Chunk(slot)) => match slot.take() {
                    Some(chunk) => Some(chunk),
                    None => return,
                },
            }
        };
        match next_write {
            Some(chunk) => self.process_write(chunk),
            None => self.process_close(),
        }
    }

    fn process_write(&self, chunk: T) {
        {
            let mut stream = self.stream.borrow_mut();
            debug_assert!(stream.in_flight_write.is_none());
            stream.in_flight_write = stream.write_requests.pop_front();
        }
        let shared = self.clone();
        spawn(async move {
            let hook = {
                let controller = shared.controller();
                let mut sink = shared.sink.borrow_mut();
                sink.as_mut().map(|s| s.write(chunk, &controller))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            match outcome {
                Ok(()) => {
                    let finished = shared.stream.borrow_mut().in_flight_write.take();
                    if let Some(request) = finished {
                        request.resolve(());
                    }
                    // Drop the emptied entry; its size stops counting now.
                    shared.ctl.borrow_mut().queue.dequeue_first();
                    let state = shared.state();
                    if !shared.close_queued_or_in_flight() && state == ConsumerState::Writable {
                        let backpressure = shared.get_backpressure();
                        shared.update_backpressure(backpressure);
                    }
                    shared.advance_queue();
                }
                Err(reason) => {
                    let finished = shared.stream.borrow_mut().in_flight_write.take();
                    if let Some(request) = finished {
                        request.reject(reason.clone());
                    }
                    shared.deal_with_rejection(reason);
                }
            }
        });
    }

    fn process_close(&self) {
        {
            let mut stream = self.stream.borrow_mut();
            debug_assert!(stream.in_flight_close.is_none());
            debug_assert!(stream.close_request.is_some());
            stream.in_flight_close = stream.close_request.take();
        }
        {
            let mut ctl = self.ctl.borrow_mut();
            let entry = ctl.queue.dequeue_first();
            debug_assert!(matches!(entry, Some(QueueEntry::Close)));
            debug_assert!(ctl.queue.is_empty());
        }
        let shared = self.clone();
        spawn(async move {
            // The sink box is taken here: after close starts, no other
            // hook may run.
            let hook = {
                let mut sink = shared.sink.borrow_mut();
                sink.take().map(|mut s| s.close())
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            match outcome {
                Ok(()) => shared.finish_in_flight_close(),
                Err(reason) => shared.finish_in_flight_close_with_error(reason),
            }
        });
    }

    fn finish_in_flight_close(&self) {
        let settle_abort = {
            let mut stream = self.stream.borrow_mut();
            let request = stream.in_flight_close.take();
            if let Some(request) = request {
                request.resolve(());
            }
            debug_assert!(matches!(
                stream.state,
                ConsumerState::Writable | ConsumerState::Erroring
            ));
            let mut settle_abort = None;
            if stream.state == ConsumerState::Erroring {
                // The close raced an abort and won; the abort is moot.
                stream.stored_error = None;
                settle_abort = stream.pending_abort.take();
            }
            stream.state = ConsumerState::Closed;
            if let Some(writer) = stream.writer.as_mut() {
                writer.closed.resolve(());
            }
            settle_abort
        };
        if let Some(abort) = settle_abort {
            abort.result.resolve(());
        }
        debug!("consumer closed");
    }

    fn finish_in_flight_close_with_error(&self, reason: StreamError) {
        let aborted = {
            let mut stream = self.stream.borrow_mut();
            let request = stream.in_flight_close.take();
            if let Some(request) = request {
                request.reject(reason.clone());
            }
            debug_assert!(matches!(
                stream.state,
                ConsumerState::Writable | ConsumerState::Erroring
            ));
            stream.pending_abort.take()
        };
        if let Some(abort) = aborted {
            abort.result.reject(reason.clone());
        }
        self.deal_with_rejection(reason);
    }

    // ---- backpressure ----

    fn update_backpressure(&self, backpressure: bool) {
        let mut stream = self.stream.borrow_mut();
        debug_assert_eq!(stream.state, ConsumerState::Writable);
        if backpressure != stream.backpressure {
            if let Some(writer) = stream.writer.as_mut() {
                if backpressure {
                    writer.ready = Deferred::new();
                } else {
                    writer.ready.resolve(());
                }
            }
        }
        stream.backpressure = backpressure;
    }
}
