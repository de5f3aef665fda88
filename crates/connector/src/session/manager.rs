//! Queued, non-blocking packet I/O for one connection.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, RwLock, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use protocol::{command_name, Message, Packet, HEADER_SIZE};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::timer::IdleTimer;
use super::worker;
use super::SessionError;
use crate::config::BufferConfig;
use crate::processor::{Processor, ProcessorContext};
use crate::sync::lock;

/// Sizing read once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Advisory capacity of each queue.
    pub queue_capacity: usize,
    /// Maximum payload bytes consumed per `recv`.
    pub read_chunk: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&BufferConfig::default())
    }
}

impl From<&BufferConfig> for SessionSettings {
    fn from(buffers: &BufferConfig) -> Self {
        Self {
            queue_capacity: buffers.queue_size,
            read_chunk: buffers.unix_sock_buffer,
        }
    }
}

/// Session state for one connection.
///
/// The reactor calls [`process_read_event`](Self::process_read_event) and
/// [`process_write_event`](Self::process_write_event); processors push
/// responses from the processing worker and from async workers.
pub struct SessionManager {
    settings: SessionSettings,
    transport: RwLock<Option<Arc<dyn crate::transport::Transport>>>,

    /// Inbound packets; the newest (tail) may still be incomplete.
    request_queue: Mutex<VecDeque<Packet>>,
    /// Outbound packets; the head may be partially sent.
    response_queue: Mutex<VecDeque<Packet>>,
    /// Held by whoever is currently draining the response queue.
    write_lock: Mutex<()>,

    /// Set when a complete request is waiting for the worker.
    work_pending: Mutex<bool>,
    work_signal: Condvar,

    space_lock: Mutex<()>,
    space_signal: Condvar,

    response_notify: Arc<Notify>,
    idle: Arc<IdleTimer>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create an uninitialised session.
    pub fn new(settings: SessionSettings, idle: Arc<IdleTimer>, cancel: CancellationToken) -> Self {
        Self {
            settings,
            transport: RwLock::new(None),
            request_queue: Mutex::new(VecDeque::new()),
            response_queue: Mutex::new(VecDeque::new()),
            write_lock: Mutex::new(()),
            work_pending: Mutex::new(false),
            work_signal: Condvar::new(),
            space_lock: Mutex::new(()),
            space_signal: Condvar::new(),
            response_notify: Arc::new(Notify::new()),
            idle,
            cancel,
            worker: Mutex::new(None),
        }
    }

    /// Bind the session to a transport.
    pub fn init(&self, transport: Arc<dyn crate::transport::Transport>) {
        debug!(
            "Session initialised (queue capacity {}, read chunk {})",
            self.settings.queue_capacity, self.settings.read_chunk
        );
        let mut slot = self
            .transport
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(transport);
    }

    /// Whether [`init`](Self::init) has been called.
    pub fn is_initialised(&self) -> bool {
        self.transport
            .read()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    fn transport(&self) -> Result<Arc<dyn crate::transport::Transport>, SessionError> {
        self.transport
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::NotInitialised)
    }

    /// Drain everything the transport has to offer into the request queue.
    ///
    /// Returns `Ok` once the transport would block. End of stream, reset and
    /// I/O failures are fatal.
    pub fn process_read_event(&self) -> Result<(), SessionError> {
        let transport = self.transport()?;
        self.reset_timer();

        let mut chunk = vec![0u8; self.settings.read_chunk.max(1)];

        while !self.cancel.is_cancelled() {
            let need_header = lock(&self.request_queue)
                .back()
                .map_or(true, Packet::is_complete);

            if need_header {
                let mut header = [0u8; HEADER_SIZE];
                match transport.peek(&mut header) {
                    Ok(0) => return Err(SessionError::Closed),
                    Ok(n) if n < HEADER_SIZE => {
                        if transport.is_read_closed() {
                            debug!("Peer closed after {} of {} header bytes", n, HEADER_SIZE);
                            return Err(SessionError::Closed);
                        }
                        trace!("Partial header ({} of {} bytes), waiting", n, HEADER_SIZE);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return self.read_error(e),
                }

                // The header is validated before it is consumed
                let packet = Packet::from_header(&header)?;

                match transport.recv(&mut header) {
                    Ok(HEADER_SIZE) => {}
                    Ok(0) => return Err(SessionError::Closed),
                    Ok(n) => {
                        return Err(SessionError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("consumed {} of {} peeked header bytes", n, HEADER_SIZE),
                        )))
                    }
                    Err(e) => return self.read_error(e),
                }

                debug!("Receiving packet of {} bytes", packet.payload_length());
                let complete = packet.is_complete();
                self.push_request(packet);
                if complete {
                    self.signal_worker();
                }
                continue;
            }

            let remaining = lock(&self.request_queue)
                .back()
                .map_or(0, Packet::remaining);
            let want = remaining.min(chunk.len());

            match transport.recv(&mut chunk[..want]) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(n) => {
                    let complete = {
                        let mut queue = lock(&self.request_queue);
                        match queue.back_mut() {
                            Some(packet) => {
                                packet.append(&chunk[..n]);
                                trace!(
                                    "Payload progress {}/{}",
                                    packet.received(),
                                    packet.payload_length()
                                );
                                packet.is_complete()
                            }
                            None => false,
                        }
                    };
                    if complete {
                        self.signal_worker();
                    }
                }
                Err(e) => return self.read_error(e),
            }
        }

        Ok(())
    }

    fn read_error(&self, err: io::Error) -> Result<(), SessionError> {
        match SessionError::from_transport(err) {
            SessionError::TryAgain => Ok(()),
            fatal => {
                debug!("Read failed: {}", fatal);
                Err(fatal)
            }
        }
    }

    /// Send queued responses until the queue is empty or the transport
    /// would block.
    ///
    /// Concurrent callers return immediately while another one is writing.
    pub fn process_write_event(&self) -> Result<(), SessionError> {
        let transport = self.transport()?;

        let _guard = match self.write_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                trace!("Write already in progress");
                return Ok(());
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        self.reset_timer();

        while !self.cancel.is_cancelled() {
            let Some(mut packet) = self.pop_response() else {
                break;
            };
            self.space_signal.notify_all();

            loop {
                let pending = packet.unsent();
                if pending.is_empty() {
                    break;
                }
                let len = pending.len();

                match transport.send(pending) {
                    Ok(n) => {
                        packet.advance(n);
                        if n < len {
                            trace!("Short send ({} of {} bytes)", n, len);
                            self.push_response_again(packet);
                            return Ok(());
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.push_response_again(packet);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("Write failed, closing connection: {}", e);
                        transport.shutdown();
                        return Err(SessionError::from_transport(e));
                    }
                }
            }

            debug!("Sent packet of {} bytes", packet.payload_length());
        }

        Ok(())
    }

    /// Encode a message, queue it and try to flush.
    pub fn send_message(&self, message: &Message) -> Result<(), SessionError> {
        let packet = Packet::from_message(message)?;
        debug!(
            "Queueing {} (request id {}, {} bytes)",
            command_name(message.command.code),
            message.request_id(),
            packet.payload_length()
        );
        self.push_response(packet);
        self.process_write_event()
    }

    /// Queue a response at the tail.
    pub fn push_response(&self, packet: Packet) {
        lock(&self.response_queue).push_back(packet);
        self.response_notify.notify_one();
    }

    /// Return a partially sent response to the head.
    pub fn push_response_again(&self, packet: Packet) {
        lock(&self.response_queue).push_front(packet);
        self.response_notify.notify_one();
    }

    /// Queue a request at the tail.
    pub fn push_request(&self, packet: Packet) {
        lock(&self.request_queue).push_back(packet);
    }

    /// Return a request to the head.
    pub fn push_request_again(&self, packet: Packet) {
        lock(&self.request_queue).push_front(packet);
    }

    fn pop_response(&self) -> Option<Packet> {
        lock(&self.response_queue).pop_front()
    }

    /// Pop the head request if it is complete.
    pub(crate) fn pop_complete_request(&self) -> Option<Packet> {
        let mut queue = lock(&self.request_queue);
        if queue.front().is_some_and(Packet::is_complete) {
            queue.pop_front()
        } else {
            None
        }
    }

    pub fn is_response_space_available(&self) -> bool {
        lock(&self.response_queue).len() < self.settings.queue_capacity
    }

    pub fn is_request_space_available(&self) -> bool {
        lock(&self.request_queue).len() < self.settings.queue_capacity
    }

    /// Number of queued responses.
    pub fn response_len(&self) -> usize {
        lock(&self.response_queue).len()
    }

    /// Number of queued requests, including one in flight.
    pub fn request_len(&self) -> usize {
        lock(&self.request_queue).len()
    }

    /// Whether responses are waiting to be sent.
    pub fn has_pending_responses(&self) -> bool {
        !lock(&self.response_queue).is_empty()
    }

    /// Block until the response queue has room, the timeout passes, or the
    /// session is cancelled. Returns whether there is room.
    pub fn wait_for_response_space(&self, timeout: Duration) -> bool {
        if self.is_response_space_available() {
            return true;
        }
        if self.cancel.is_cancelled() {
            return false;
        }
        let guard = lock(&self.space_lock);
        let _ = self
            .space_signal
            .wait_timeout(guard, timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.is_response_space_available()
    }

    /// Notified whenever a response is queued.
    pub fn response_notifier(&self) -> Arc<Notify> {
        self.response_notify.clone()
    }

    /// Wake the processing worker.
    pub fn signal_worker(&self) {
        *lock(&self.work_pending) = true;
        self.work_signal.notify_all();
    }

    /// Wait until signalled or the timeout passes. Returns whether a signal
    /// arrived.
    pub(crate) fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut pending = lock(&self.work_pending);
        if !*pending && !self.cancel.is_cancelled() {
            pending = self
                .work_signal
                .wait_timeout(pending, timeout)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        std::mem::take(&mut *pending)
    }

    /// Choose a processor for the first message of an exchange.
    pub fn init_processor(&self, first: &Message) -> Result<Processor, SessionError> {
        let command = first
            .command()
            .filter(|c| c.is_init_request())
            .ok_or(SessionError::ProcessorInit(first.command.code))?;

        let mut processor = Processor::for_family(command.family());
        processor.init(first.request_id());
        debug!(
            "Started {} processor for request id {}",
            command.family(),
            first.request_id()
        );
        Ok(processor)
    }

    /// Spawn the processing worker.
    ///
    /// The server passes `None` and lets the first request pick the
    /// processor; the client passes its initiator.
    pub fn start_worker(
        self: &Arc<Self>,
        ctx: ProcessorContext,
        processor: Option<Processor>,
    ) -> io::Result<()> {
        let handle = thread::Builder::new()
            .name("session-worker".to_string())
            .spawn(move || worker::run(ctx, processor))?;
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    /// Record activity on the owning connector's idle timer.
    pub fn reset_timer(&self) {
        self.idle.reset();
    }

    /// Session cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Discard both queues.
    pub fn cleanup(&self) {
        let requests = std::mem::take(&mut *lock(&self.request_queue));
        let responses = std::mem::take(&mut *lock(&self.response_queue));
        if !requests.is_empty() || !responses.is_empty() {
            debug!(
                "Discarding {} requests and {} responses",
                requests.len(),
                responses.len()
            );
        }
        *lock(&self.work_pending) = false;
    }

    /// Stop the session: cancel, join the worker, then clean up.
    pub fn quit(&self) {
        self.cancel.cancel();
        self.signal_worker();
        self.space_signal.notify_all();
        self.response_notify.notify_waiters();

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("quit called from the processing worker, not joining");
            } else if handle.join().is_err() {
                warn!("Processing worker panicked");
            }
        }

        self.cleanup();
    }
}
