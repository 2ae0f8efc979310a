//! Acquisition engine
//!
//! Orchestrates one producer: announces a pool of buffers on start, runs a
//! background delivery loop that moves filled buffers into a bounded hold
//! list, and lends them to consumers through [`AcquisitionEngine::fetch`].
//!
//! All shared session state sits behind a single mutex. Consumers block on
//! a condition variable paired with it; the delivery loop blocks only in
//! the producer's event wait, which stop unblocks by flushing the queue.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::{ContextTag, FilledBuffer, HeldSlot, RawBlock, Recycler};
use crate::config::{AcquisitionConfig, DEFAULT_NUM_BUFFERS};
use crate::error::{FeatureError, HarvestError, Result, TransportError};
use crate::events::{Callback, Event, EventDispatcher, EventKind, EventSender};
use crate::features::{self, names, AcquisitionMode, FeatureValue, NodeMap, NullNodeMap};
use crate::logging::prefix;
use crate::payload::PayloadDecoder;
use crate::pfnc::{FormatLookup, PfncTable};
use crate::pool::{BlockState, BufferPool, PoolCensus};
use crate::statistics::{Statistics, StatisticsSnapshot};
use crate::transport::{Delivery, EventToken, Transport};
use crate::worker::{NativeWorker, Step, StepOutcome, Worker};

/// Lifecycle phase of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// State shared by the delivery loop and consumers
struct Session {
    /// Generation, bumped on every start
    id: u64,
    acquiring: bool,
    pool: Option<BufferPool>,
    held: VecDeque<HeldSlot>,
    statistics: Statistics,
    hold_capacity: usize,
    keep_latest: bool,
    wait_timeout: Duration,
    /// Frames left in a bounded acquisition
    remaining: Option<u64>,
    completion_signalled: bool,
    timestamp_frequency: Option<u64>,
    update_chunks: bool,
    log_buffers: bool,
}

impl Session {
    fn new(config: &AcquisitionConfig) -> Self {
        Self {
            id: 0,
            acquiring: false,
            pool: None,
            held: VecDeque::new(),
            statistics: Statistics::new(),
            hold_capacity: config.num_filled_buffers_to_hold,
            keep_latest: config.keep_latest,
            wait_timeout: config.acquisition_timeout(),
            remaining: None,
            completion_signalled: false,
            timestamp_frequency: None,
            update_chunks: config.update_chunk_automatically,
            log_buffers: config.log_buffers,
        }
    }
}

/// Read-only view of the session, valid while the session mutex is held
pub struct SessionView<'a> {
    session: &'a Session,
}

impl SessionView<'_> {
    pub fn session_id(&self) -> u64 {
        self.session.id
    }

    pub fn is_acquiring(&self) -> bool {
        self.session.acquiring
    }

    /// Frame ids in the hold list, oldest first.
    pub fn held_frame_ids(&self) -> Vec<u64> {
        self.session.held.iter().map(|s| s.info.frame_id).collect()
    }

    pub fn held_tags(&self) -> Vec<ContextTag> {
        self.session.held.iter().map(|s| s.block.tag()).collect()
    }

    /// Tags the producer owns. Empty outside a session.
    pub fn queued_tags(&self) -> Vec<ContextTag> {
        self.session
            .pool
            .as_ref()
            .map(BufferPool::queued_tags)
            .unwrap_or_default()
    }

    pub fn census(&self) -> Option<PoolCensus> {
        self.session.pool.as_ref().map(BufferPool::census)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.session.statistics.snapshot()
    }
}

struct Shared {
    session: Mutex<Session>,
    available: Condvar,
    transport: Arc<dyn Transport>,
    events: EventSender,
    cancel: CancellationToken,
}

impl Shared {
    fn delivery_step(&self, token: EventToken) -> StepOutcome {
        if self.cancel.is_cancelled() {
            self.halt();
            return StepOutcome::Exit;
        }

        let timeout = {
            let session = self.session.lock();
            if !session.acquiring {
                return StepOutcome::Exit;
            }
            session.wait_timeout
        };

        match self.transport.wait_event(token, timeout) {
            Ok(delivery) => self.accept(delivery),
            Err(TransportError::Timeout) => trace!(?timeout, "no buffer delivered"),
            Err(TransportError::Aborted) => trace!("buffer wait aborted"),
            Err(e) => warn!(error = %e, "waiting for a buffer failed"),
        }
        StepOutcome::Continue
    }

    /// Cancellation observed on the delivery thread: stop taking buffers and
    /// let the dispatcher run the regular stop path.
    fn halt(&self) {
        self.session.lock().acquiring = false;
        self.available.notify_all();
        warn!("acquisition cancelled, stopping");
        self.events.halt();
    }

    fn accept(&self, delivery: Delivery) {
        let Delivery {
            handle,
            block,
            info,
        } = delivery;
        let tag = block.tag();
        let frame_id = info.frame_id;

        let mut guard = self.session.lock();
        let session = &mut *guard;

        let Some(pool) = session.pool.as_mut() else {
            warn!(tag, frame_id, "delivery outside a session, handing it back");
            if let Err(rejected) = self.transport.queue(handle, block) {
                warn!(error = %rejected.error, "producer refused the stray buffer");
            }
            return;
        };
        if let Err(e) = pool.mark_delivered(tag, handle) {
            warn!(tag, error = %e, "delivery does not match the pool, ignoring it");
            if let Err(rejected) = self.transport.queue(handle, block) {
                warn!(error = %rejected.error, "producer refused the stray buffer");
            }
            return;
        }

        if !session.acquiring {
            // Stop is in progress; the revoke pass will collect it
            requeue(pool, &*self.transport, block);
            return;
        }

        if info.incomplete {
            session.statistics.record_incomplete();
            warn!(frame_id, tag, "incomplete buffer requeued");
            requeue(pool, &*self.transport, block);
            drop(guard);
            self.events.emit(Event::IncompleteBuffer { frame_id });
            return;
        }

        session.statistics.increment();
        let freq = info.timestamp_frequency.or(session.timestamp_frequency);
        session.statistics.update_timestamp(info.timestamp, freq);

        let slot = HeldSlot {
            session: session.id,
            handle,
            block,
            info,
        };

        let accepted = if session.held.len() < session.hold_capacity {
            session.held.push_back(slot);
            true
        } else if session.keep_latest {
            while session.held.len() >= session.hold_capacity {
                let Some(oldest) = session.held.pop_front() else {
                    break;
                };
                session.statistics.record_dropped();
                if session.log_buffers {
                    debug!(
                        "{} dropped frame {} for frame {}",
                        prefix::BUFFER,
                        oldest.info.frame_id,
                        frame_id
                    );
                }
                requeue(pool, &*self.transport, oldest.block);
            }
            session.held.push_back(slot);
            true
        } else {
            session.statistics.record_dropped();
            if session.log_buffers {
                debug!("{} hold list full, dropped frame {}", prefix::BUFFER, frame_id);
            }
            requeue(pool, &*self.transport, slot.block);
            false
        };

        let mut completed = false;
        if let Some(remaining) = session.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 && !session.completion_signalled {
                session.completion_signalled = true;
                completed = true;
            }
        }

        if accepted {
            if session.log_buffers {
                debug!(
                    frame_id,
                    tag,
                    held = session.held.len(),
                    "{} buffer held",
                    prefix::BUFFER
                );
            }
            self.available.notify_all();
        }
        drop(guard);

        if completed {
            info!("frame budget reached");
            self.events.emit(Event::ReadyToStop);
        }
        if accepted {
            self.events.emit(Event::NewBufferAvailable { frame_id });
        }
    }
}

fn requeue(pool: &mut BufferPool, transport: &dyn Transport, block: RawBlock) {
    let tag = block.tag();
    if let Err(e) = pool.requeue(transport, block) {
        warn!(tag, error = %e, "requeueing buffer failed");
    }
}

impl Recycler for Shared {
    fn recycle(&self, slot: HeldSlot) -> Result<()> {
        let tag = slot.block.tag();
        let mut guard = self.session.lock();
        let session = &mut *guard;

        // Only the lending session's own record may take the block back
        let acquiring = session.acquiring;
        let current = session.id == slot.session;
        let owner = session.pool.as_mut().filter(|pool| {
            current
                && pool.state_of(tag) == Some(BlockState::Borrowed)
                && pool.handle_of(tag) == Some(slot.handle)
        });
        if let Some(pool) = owner {
            if acquiring {
                pool.requeue(&*self.transport, slot.block)?;
                if session.log_buffers {
                    debug!(frame_id = slot.info.frame_id, tag, "{} buffer requeued", prefix::BUFFER);
                }
                return Ok(());
            }
            // Stopping: leave it for the revoke pass
            pool.reclaim(slot.block)?;
            return Err(HarvestError::NotAcquiring);
        }
        drop(guard);

        // Its session is gone and skipped this block when revoking
        match self.transport.revoke(slot.handle) {
            Ok(_) => debug!(frame_id = slot.info.frame_id, tag, "late buffer revoked"),
            Err(e) => warn!(frame_id = slot.info.frame_id, error = %e, "revoking late buffer failed"),
        }
        Err(HarvestError::NotAcquiring)
    }
}

struct Lifecycle {
    worker: Box<dyn Worker>,
    token: Option<EventToken>,
    stream_open: bool,
    streaming: bool,
    paused: bool,
}

struct EngineInner {
    name: String,
    shared: Arc<Shared>,
    node_map: Arc<dyn NodeMap>,
    decoder: Arc<PayloadDecoder>,
    /// Serialises start and stop
    lifecycle: Mutex<Lifecycle>,
    phase: Mutex<EnginePhase>,
    settings: Mutex<AcquisitionConfig>,
    min_num_buffers: usize,
    dispatcher: EventDispatcher,
}

impl EngineInner {
    fn set_phase(&self, phase: EnginePhase) {
        *self.phase.lock() = phase;
    }

    fn start(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock();
        if *self.phase.lock() == EnginePhase::Running {
            if lc.paused {
                lc.paused = false;
                info!(engine = %self.name, "acquisition resumed");
                self.shared.events.emit(Event::Resumed);
            } else {
                debug!(engine = %self.name, "already acquiring");
            }
            return Ok(());
        }
        if self.shared.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        self.set_phase(EnginePhase::Starting);
        match self.begin(&mut lc) {
            Ok(num_buffers) => {
                self.set_phase(EnginePhase::Running);
                info!(
                    engine = %self.name,
                    num_buffers,
                    "{} acquisition started",
                    prefix::SESSION_OPEN
                );
                Ok(())
            }
            Err(e) => {
                warn!(engine = %self.name, error = %e, "start failed, rolling back");
                self.teardown(&mut lc);
                self.set_phase(EnginePhase::Idle);
                Err(e)
            }
        }
    }

    /// Bring up a session. Anything done before a failure is undone by teardown.
    fn begin(&self, lc: &mut Lifecycle) -> Result<usize> {
        let transport = &*self.shared.transport;
        let node_map = &*self.node_map;
        let config = self.settings.lock().clone();

        if !lc.stream_open {
            transport.create_data_stream()?;
            lc.stream_open = true;
        }

        let mode = AcquisitionMode::query(node_map);
        let buffer_size = transport
            .payload_size()
            .or_else(|| features::read_size(node_map, names::PAYLOAD_SIZE))
            .ok_or_else(|| HarvestError::AllocationFailed("payload size unknown".to_string()))?;

        // The frame budget only counts down; it never sizes the pool
        let num_buffers = config.num_buffers.max(self.min_num_buffers);

        let pool = BufferPool::create(transport, num_buffers, buffer_size, self.min_num_buffers)?;
        {
            // New generation before the pool is visible, so older leases never match it
            let mut guard = self.shared.session.lock();
            let session = &mut *guard;
            session.id += 1;
            session.pool.insert(pool).queue_all(transport)?;
        }

        let token = transport.register_new_buffer_event()?;
        lc.token = Some(token);

        if let Err(e) = node_map.set(names::TL_PARAMS_LOCKED, FeatureValue::Integer(1)) {
            debug!(error = %e, "could not lock transport parameters");
        }

        let timestamp_frequency = transport.timestamp_frequency().or_else(|| {
            features::read_integer(node_map, names::TIMESTAMP_TICK_FREQUENCY)
                .and_then(|f| u64::try_from(f).ok())
                .filter(|f| *f > 0)
        });

        transport.start_acquisition(mode)?;
        lc.streaming = true;

        {
            let mut session = self.shared.session.lock();
            session.acquiring = true;
            session.held.clear();
            session.statistics.reset();
            session.hold_capacity = config.num_filled_buffers_to_hold;
            session.keep_latest = config.keep_latest;
            session.wait_timeout = config.acquisition_timeout();
            session.remaining = mode.frame_budget();
            session.completion_signalled = false;
            session.timestamp_frequency = timestamp_frequency;
            session.update_chunks = config.update_chunk_automatically;
            session.log_buffers = config.log_buffers;
        }

        let shared = Arc::clone(&self.shared);
        let step: Step = Box::new(move || shared.delivery_step(token));
        lc.worker.start(step)?;

        match node_map.invoke(names::ACQUISITION_START) {
            Ok(()) => {}
            Err(FeatureError::NotFound(_)) => debug!("device has no AcquisitionStart command"),
            Err(e) => return Err(e.into()),
        }

        Ok(num_buffers)
    }

    fn stop(&self) {
        let mut lc = self.lifecycle.lock();
        if *self.phase.lock() == EnginePhase::Idle {
            debug!(engine = %self.name, "not acquiring, nothing to stop");
            return;
        }
        self.set_phase(EnginePhase::Stopping);
        self.teardown(&mut lc);
        self.set_phase(EnginePhase::Idle);

        let stats = self.shared.session.lock().statistics.snapshot();
        info!(
            engine = %self.name,
            num_images = stats.num_images,
            num_dropped = stats.num_dropped,
            "{} acquisition stopped",
            prefix::SESSION_CLOSE
        );
    }

    /// Release everything a session may hold. Never fails; producer errors are logged.
    fn teardown(&self, lc: &mut Lifecycle) {
        let transport = &*self.shared.transport;

        self.shared.session.lock().acquiring = false;
        self.shared.available.notify_all();

        // Unblock the delivery wait before joining the worker
        if let Some(token) = lc.token {
            if let Err(e) = transport.flush_event_queue(token) {
                warn!(error = %e, "flushing event queue failed");
            }
        }
        lc.worker.stop();

        if lc.streaming {
            match self.node_map.invoke(names::ACQUISITION_STOP) {
                Ok(()) | Err(FeatureError::NotFound(_)) => {}
                Err(e) => warn!(error = %e, "AcquisitionStop failed"),
            }
            if let Err(e) = self
                .node_map
                .set(names::TL_PARAMS_LOCKED, FeatureValue::Integer(0))
            {
                debug!(error = %e, "could not unlock transport parameters");
            }
            if let Err(e) = transport.stop_acquisition() {
                match e.escalate() {
                    Some(e) => warn!(error = %e, "stopping acquisition failed, continuing teardown"),
                    None => debug!("stop acquisition interrupted"),
                }
            }
            lc.streaming = false;
        }

        {
            let mut guard = self.shared.session.lock();
            let session = &mut *guard;
            if let Some(mut pool) = session.pool.take() {
                let borrowed = pool.census().borrowed;
                if borrowed > 0 {
                    warn!(borrowed, "consumers still hold buffers, they will be revoked on return");
                    self.shared
                        .events
                        .emit(Event::ReturnAllBorrowedBuffers { count: borrowed });
                }
                if let Err(e) = transport.flush_buffer_queue() {
                    warn!(error = %e, "flushing buffer queue failed");
                }
                if let Some(token) = lc.token {
                    if let Err(e) = transport.flush_event_queue(token) {
                        warn!(error = %e, "flushing event queue failed");
                    }
                }
                for slot in session.held.drain(..) {
                    if let Err(e) = pool.reclaim(slot.block) {
                        warn!(error = %e, "reclaiming held buffer failed");
                    }
                }
                let revoked = pool.revoke_all(transport);
                debug!(revoked, "buffers revoked");
            }
            session.remaining = None;
        }

        if let Some(token) = lc.token.take() {
            if let Err(e) = transport.unregister_event(token) {
                warn!(error = %e, "unregistering new-buffer event failed");
            }
        }

        let keep_open = self.settings.lock().keep_data_stream_open;
        if lc.stream_open && !keep_open {
            close_stream(transport, lc);
        }
    }

    fn shutdown(&self) {
        self.stop();
        {
            let mut lc = self.lifecycle.lock();
            if lc.stream_open {
                close_stream(&*self.shared.transport, &mut lc);
            }
        }
        self.shared.events.emit(Event::TurnedObsolete);
        self.dispatcher.close();
        debug!(engine = %self.name, "engine shut down");
    }
}

fn close_stream(transport: &dyn Transport, lc: &mut Lifecycle) {
    match transport.close_data_stream() {
        Ok(()) => lc.stream_open = false,
        Err(e) => warn!(error = %e, "closing data stream failed"),
    }
}

/// Buffer-lifecycle and acquisition engine for one producer.
///
/// Share it across consumer threads with `Arc`. Dropping it stops any
/// session and releases the producer's data stream.
pub struct AcquisitionEngine {
    inner: Arc<EngineInner>,
}

impl AcquisitionEngine {
    pub fn builder(transport: Arc<dyn Transport>) -> AcquisitionEngineBuilder {
        AcquisitionEngineBuilder::new(transport)
    }

    /// Allocate and queue buffers, then begin streaming.
    ///
    /// A no-op while running, except that it resumes a paused engine.
    /// On failure everything is rolled back and the engine stays idle.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// End streaming and revoke buffers. Idempotent; never fails.
    pub fn stop(&self) {
        self.inner.stop()
    }

    /// Take the oldest held buffer, waiting up to `timeout`.
    ///
    /// A zero timeout polls exactly once.
    pub fn fetch(&self, timeout: Duration) -> Result<FilledBuffer> {
        self.try_fetch(timeout)?
            .ok_or(HarvestError::Timeout(timeout))
    }

    /// Like [`fetch`](Self::fetch) but a timeout yields `Ok(None)`.
    pub fn try_fetch(&self, timeout: Duration) -> Result<Option<FilledBuffer>> {
        let shared = &self.inner.shared;
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = shared.session.lock();

        loop {
            if !guard.acquiring || shared.cancel.is_cancelled() {
                return Err(HarvestError::NotAcquiring);
            }

            if let Some(slot) = guard.held.pop_front() {
                let session = &mut *guard;
                if let Some(pool) = session.pool.as_mut() {
                    if let Err(e) = pool.mark_borrowed(slot.block.tag()) {
                        warn!(error = %e, "pool out of step with hold list");
                    }
                }
                let update_chunks = session.update_chunks;
                drop(guard);

                let recycler: Arc<dyn Recycler> = Arc::clone(shared) as Arc<dyn Recycler>;
                let buffer = FilledBuffer::new(slot, recycler, Arc::clone(&self.inner.decoder));
                if update_chunks && !buffer.info().chunks.is_empty() {
                    match buffer.chunks() {
                        Ok(chunks) => trace!(count = chunks.len(), "chunk data parsed"),
                        Err(e) => warn!(frame_id = buffer.frame_id(), error = %e, "chunk data ignored"),
                    }
                }
                return Ok(Some(buffer));
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    // Spurious wakeups loop back to the checks above
                    shared.available.wait_until(&mut guard, deadline);
                }
                None => shared.available.wait(&mut guard),
            }
        }
    }

    /// Return a fetched buffer to the producer.
    pub fn queue(&self, buffer: FilledBuffer) -> Result<()> {
        buffer.queue()
    }

    /// Ask consumers to pause rendering. The next `start()` resumes.
    pub fn pause(&self) {
        self.inner.lifecycle.lock().paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lifecycle.lock().paused
    }

    pub fn phase(&self) -> EnginePhase {
        *self.inner.phase.lock()
    }

    pub fn is_acquiring(&self) -> bool {
        self.inner.shared.session.lock().acquiring
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.shared.session.lock().statistics.snapshot()
    }

    pub fn num_holding_filled_buffers(&self) -> usize {
        self.inner.shared.session.lock().held.len()
    }

    /// Run `f` while holding the session mutex.
    pub fn with_lock<R>(&self, f: impl FnOnce(&SessionView<'_>) -> R) -> R {
        let guard = self.inner.shared.session.lock();
        f(&SessionView { session: &guard })
    }

    pub fn config(&self) -> AcquisitionConfig {
        self.inner.settings.lock().clone()
    }

    pub fn num_buffers(&self) -> usize {
        self.inner.settings.lock().num_buffers
    }

    /// Fewest buffers the producer accepts.
    pub fn min_num_buffers(&self) -> usize {
        self.inner.min_num_buffers
    }

    /// Takes effect on the next start.
    pub fn set_num_buffers(&self, num_buffers: usize) -> Result<()> {
        if num_buffers < self.inner.min_num_buffers {
            return Err(HarvestError::InvalidConfig(format!(
                "num_buffers {} is below the producer minimum {}",
                num_buffers, self.inner.min_num_buffers
            )));
        }
        self.inner.settings.lock().num_buffers = num_buffers;
        Ok(())
    }

    pub fn num_filled_buffers_to_hold(&self) -> usize {
        self.inner.settings.lock().num_filled_buffers_to_hold
    }

    /// Resize the hold list. Shrinking drops the surplus per the current policy.
    pub fn set_num_filled_buffers_to_hold(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(HarvestError::InvalidConfig(
                "num_filled_buffers_to_hold must be greater than 0".to_string(),
            ));
        }
        self.inner.settings.lock().num_filled_buffers_to_hold = capacity;

        let shared = &self.inner.shared;
        let mut guard = shared.session.lock();
        let session = &mut *guard;
        session.hold_capacity = capacity;
        while session.held.len() > capacity {
            let surplus = if session.keep_latest {
                session.held.pop_front()
            } else {
                session.held.pop_back()
            };
            let Some(surplus) = surplus else {
                break;
            };
            session.statistics.record_dropped();
            match session.pool.as_mut() {
                Some(pool) => requeue(pool, &*shared.transport, surplus.block),
                None => warn!(frame_id = surplus.info.frame_id, "held buffer without a pool"),
            }
        }
        Ok(())
    }

    pub fn keep_latest(&self) -> bool {
        self.inner.settings.lock().keep_latest
    }

    pub fn set_keep_latest(&self, keep_latest: bool) {
        self.inner.settings.lock().keep_latest = keep_latest;
        self.inner.shared.session.lock().keep_latest = keep_latest;
    }

    pub fn timeout_for_image_acquisition(&self) -> Duration {
        self.inner.settings.lock().acquisition_timeout()
    }

    /// Picked up by the delivery loop on its next iteration.
    pub fn set_timeout_for_image_acquisition(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.inner.settings.lock().timeout_for_image_acquisition_ms = millis;
        self.inner.shared.session.lock().wait_timeout = Duration::from_millis(millis);
    }

    pub fn add_callback<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.inner.dispatcher.add(kind, callback);
    }

    pub fn remove_callbacks(&self, kind: EventKind) {
        self.inner.dispatcher.remove_all(kind);
    }

    /// Token observed by the delivery loop; cancelling it stops the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shared.cancel.clone()
    }

    pub fn decoder(&self) -> Arc<PayloadDecoder> {
        Arc::clone(&self.inner.decoder)
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

pub struct AcquisitionEngineBuilder {
    transport: Arc<dyn Transport>,
    node_map: Arc<dyn NodeMap>,
    formats: Arc<dyn FormatLookup>,
    config: AcquisitionConfig,
    worker: Option<Box<dyn Worker>>,
    cancel: Option<CancellationToken>,
    name: String,
}

impl AcquisitionEngineBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            node_map: Arc::new(NullNodeMap),
            formats: Arc::new(PfncTable),
            config: AcquisitionConfig::default(),
            worker: None,
            cancel: None,
            name: "harvest".to_string(),
        }
    }

    pub fn node_map(mut self, node_map: Arc<dyn NodeMap>) -> Self {
        self.node_map = node_map;
        self
    }

    pub fn formats(mut self, formats: Arc<dyn FormatLookup>) -> Self {
        self.formats = formats;
        self
    }

    pub fn config(mut self, config: AcquisitionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default native-thread worker.
    pub fn worker(mut self, worker: Box<dyn Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Stop when the host cancels `token`. The engine holds a child token.
    pub fn cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancel = Some(token.child_token());
        self
    }

    /// Names the worker threads and tags log lines.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(self) -> Result<AcquisitionEngine> {
        let mut config = self.config;
        config.validate()?;

        let min_num_buffers = match self.transport.min_announce_count() {
            Ok(min) => min.max(1),
            Err(e) => {
                warn!(error = %e, "producer minimum unavailable, using {}", DEFAULT_NUM_BUFFERS);
                DEFAULT_NUM_BUFFERS
            }
        };
        config.num_buffers = config.num_buffers.max(min_num_buffers);

        let halt_target: Arc<OnceLock<Weak<EngineInner>>> = Arc::new(OnceLock::new());
        let target = Arc::clone(&halt_target);
        let dispatcher = EventDispatcher::spawn(format!("{}-events", self.name), move || {
            if let Some(inner) = target.get().and_then(Weak::upgrade) {
                inner.stop();
            }
        })?;

        let cancel = self.cancel.unwrap_or_else(CancellationToken::new);
        let shared = Arc::new(Shared {
            session: Mutex::new(Session::new(&config)),
            available: Condvar::new(),
            transport: Arc::clone(&self.transport),
            events: dispatcher.sender(),
            cancel,
        });

        let worker = self.worker.unwrap_or_else(|| {
            Box::new(NativeWorker::new(
                format!("{}-delivery", self.name),
                config.worker_idle(),
            ))
        });
        let mut lifecycle = Lifecycle {
            worker,
            token: None,
            stream_open: false,
            streaming: false,
            paused: false,
        };
        if config.keep_data_stream_open {
            self.transport.create_data_stream()?;
            lifecycle.stream_open = true;
        }

        let decoder = Arc::new(PayloadDecoder::new(
            self.formats,
            Some(Arc::clone(&self.node_map)),
        ));

        debug!(
            engine = %self.name,
            num_buffers = config.num_buffers,
            min_num_buffers,
            "engine created"
        );

        let inner = Arc::new(EngineInner {
            name: self.name,
            shared,
            node_map: self.node_map,
            decoder,
            lifecycle: Mutex::new(lifecycle),
            phase: Mutex::new(EnginePhase::Idle),
            settings: Mutex::new(config),
            min_num_buffers,
            dispatcher,
        });
        let _ = halt_target.set(Arc::downgrade(&inner));

        Ok(AcquisitionEngine { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimFrame, SimNodeMap, SimTransport};
    use crate::worker::{ManualPump, ManualWorker};
    use pretty_assertions::assert_eq;

    fn setup(config: AcquisitionConfig) -> (AcquisitionEngine, Arc<SimTransport>, ManualPump) {
        let sim = Arc::new(SimTransport::new(SimConfig {
            payload_size: Some(16),
            ..Default::default()
        }));
        let (worker, pump) = ManualWorker::new();
        let engine = AcquisitionEngine::builder(sim.clone())
            .config(config)
            .worker(Box::new(worker))
            .build()
            .unwrap();
        (engine, sim, pump)
    }

    fn config(num_buffers: usize, hold: usize, keep_latest: bool) -> AcquisitionConfig {
        AcquisitionConfig {
            num_buffers,
            num_filled_buffers_to_hold: hold,
            keep_latest,
            timeout_for_image_acquisition_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_keep_latest_replaces_oldest() {
        let (engine, sim, pump) = setup(config(3, 1, true));
        engine.start().unwrap();

        assert!(sim.deliver(SimFrame::new(1, vec![1; 16])));
        assert!(sim.deliver(SimFrame::new(2, vec![2; 16])));
        pump.pump_n(2);

        assert_eq!(engine.with_lock(|s| s.held_frame_ids()), vec![2]);
        assert_eq!(engine.statistics().num_dropped, 1);

        let buffer = engine.fetch(Duration::ZERO).unwrap();
        assert_eq!(buffer.frame_id(), 2);
        assert_eq!(buffer.bytes()[0], 2);
        buffer.queue().unwrap();
        engine.stop();
    }

    #[test]
    fn test_drop_newest_when_not_keep_latest() {
        let (engine, sim, pump) = setup(config(3, 1, false));
        engine.start().unwrap();

        sim.deliver(SimFrame::new(1, vec![1; 16]));
        sim.deliver(SimFrame::new(2, vec![2; 16]));
        pump.pump_n(2);

        assert_eq!(engine.with_lock(|s| s.held_frame_ids()), vec![1]);
        assert_eq!(sim.queued_count(), 2);
        engine.stop();
    }

    #[test]
    fn test_incomplete_buffer_requeued() {
        let (engine, sim, pump) = setup(config(2, 2, true));
        engine.start().unwrap();

        sim.deliver(SimFrame::new(1, vec![0; 16]).incomplete());
        pump.pump();

        assert_eq!(engine.num_holding_filled_buffers(), 0);
        assert_eq!(sim.queued_count(), 2);
        let stats = engine.statistics();
        assert_eq!(stats.num_incomplete, 1);
        assert_eq!(stats.num_images, 0);
        engine.stop();
    }

    #[test]
    fn test_second_start_is_noop() {
        let (engine, sim, _pump) = setup(config(3, 1, true));
        engine.start().unwrap();
        engine.start().unwrap();
        assert_eq!(sim.start_calls(), 1);
        assert_eq!(sim.announced_count(), 3);
        engine.stop();
    }

    #[test]
    fn test_start_resumes_when_paused() {
        let (engine, _sim, _pump) = setup(config(3, 1, true));
        let (tx, rx) = crossbeam_channel::unbounded();
        engine.add_callback(EventKind::Resumed, move |e| {
            let _ = tx.send(e.clone());
        });
        engine.start().unwrap();
        engine.pause();
        assert!(engine.is_paused());
        engine.start().unwrap();
        assert!(!engine.is_paused());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Event::Resumed);
        engine.stop();
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let sim = Arc::new(SimTransport::new(SimConfig {
            payload_size: Some(16),
            fail_start: true,
            ..Default::default()
        }));
        let (worker, _pump) = ManualWorker::new();
        let engine = AcquisitionEngine::builder(sim.clone())
            .worker(Box::new(worker))
            .build()
            .unwrap();

        assert!(engine.start().is_err());
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(sim.announced_count(), 0);
        assert_eq!(sim.double_revoke_attempts(), 0);
        assert!(matches!(
            engine.fetch(Duration::from_millis(1)),
            Err(HarvestError::NotAcquiring)
        ));
    }

    #[test]
    fn test_missing_payload_size_fails_start() {
        let sim = Arc::new(SimTransport::new(SimConfig::default()));
        let engine = AcquisitionEngine::builder(sim.clone()).build().unwrap();
        assert!(matches!(
            engine.start(),
            Err(HarvestError::AllocationFailed(_))
        ));
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[test]
    fn test_payload_size_from_node_map() {
        let sim = Arc::new(SimTransport::new(SimConfig::default()));
        let node_map = Arc::new(
            SimNodeMap::new()
                .with(names::PAYLOAD_SIZE, FeatureValue::Integer(32))
                .with(names::TL_PARAMS_LOCKED, FeatureValue::Integer(0))
                .with_command(names::ACQUISITION_START)
                .with_command(names::ACQUISITION_STOP),
        );
        let (worker, _pump) = ManualWorker::new();
        let engine = AcquisitionEngine::builder(sim.clone())
            .node_map(node_map.clone())
            .worker(Box::new(worker))
            .build()
            .unwrap();

        engine.start().unwrap();
        assert_eq!(
            node_map.value(names::TL_PARAMS_LOCKED),
            Some(FeatureValue::Integer(1))
        );
        engine.stop();
        assert_eq!(
            node_map.invocations(),
            vec![names::ACQUISITION_START.to_string(), names::ACQUISITION_STOP.to_string()]
        );
        assert_eq!(
            node_map.value(names::TL_PARAMS_LOCKED),
            Some(FeatureValue::Integer(0))
        );
    }

    #[test]
    fn test_frame_budget_signals_once() {
        let sim = Arc::new(SimTransport::new(SimConfig {
            payload_size: Some(8),
            ..Default::default()
        }));
        let node_map = Arc::new(
            SimNodeMap::new()
                .with(names::ACQUISITION_MODE, FeatureValue::Enumeration("MultiFrame".into()))
                .with(names::ACQUISITION_FRAME_COUNT, FeatureValue::Integer(5)),
        );
        let (worker, pump) = ManualWorker::new();
        let engine = AcquisitionEngine::builder(sim.clone())
            .node_map(node_map)
            .config(config(3, 8, true))
            .worker(Box::new(worker))
            .build()
            .unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        engine.add_callback(EventKind::ReadyToStop, move |e| {
            let _ = tx.send(e.clone());
        });

        engine.start().unwrap();
        assert_eq!(sim.announced_count(), 3);
        assert_eq!(sim.mode(), AcquisitionMode::MultiFrame(5));

        for id in 1..=5 {
            assert!(sim.deliver(SimFrame::new(id, vec![0; 8])));
            assert!(pump.pump());
            engine.fetch(Duration::ZERO).unwrap().queue().unwrap();
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Event::ReadyToStop);
        engine.stop();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_large_frame_budget_keeps_pool_size() {
        let sim = Arc::new(SimTransport::new(SimConfig {
            payload_size: Some(8),
            ..Default::default()
        }));
        let node_map = Arc::new(
            SimNodeMap::new()
                .with(names::ACQUISITION_MODE, FeatureValue::Enumeration("MultiFrame".into()))
                .with(names::ACQUISITION_FRAME_COUNT, FeatureValue::Integer(500)),
        );
        let (worker, _pump) = ManualWorker::new();
        let engine = AcquisitionEngine::builder(sim.clone())
            .node_map(node_map)
            .config(config(3, 1, true))
            .worker(Box::new(worker))
            .build()
            .unwrap();

        engine.start().unwrap();
        assert_eq!(sim.announced_count(), 3);
        assert_eq!(sim.mode(), AcquisitionMode::MultiFrame(500));
        assert_eq!(engine.with_lock(|view| view.census()).unwrap().live(), 3);
        engine.stop();
        assert_eq!(sim.announced_count(), 0);
    }

    #[test]
    fn test_shrinking_hold_drops_oldest() {
        let (engine, sim, pump) = setup(config(4, 3, true));
        engine.start().unwrap();
        for id in 1..=3 {
            sim.deliver(SimFrame::new(id, vec![0; 16]));
        }
        pump.pump_n(3);
        engine.set_num_filled_buffers_to_hold(1).unwrap();
        assert_eq!(engine.with_lock(|s| s.held_frame_ids()), vec![3]);
        assert!(engine.set_num_filled_buffers_to_hold(0).is_err());
        engine.stop();
    }

    #[test]
    fn test_num_buffers_below_minimum_rejected() {
        let sim = Arc::new(SimTransport::new(SimConfig {
            min_announce: 4,
            payload_size: Some(8),
            ..Default::default()
        }));
        let engine = AcquisitionEngine::builder(sim).build().unwrap();
        assert_eq!(engine.num_buffers(), 4);
        assert!(matches!(
            engine.set_num_buffers(2),
            Err(HarvestError::InvalidConfig(_))
        ));
        engine.set_num_buffers(6).unwrap();
        assert_eq!(engine.num_buffers(), 6);
    }

    #[test]
    fn test_buffer_returned_after_stop_is_revoked() {
        let (engine, sim, pump) = setup(config(2, 1, true));
        engine.start().unwrap();
        sim.deliver(SimFrame::new(1, vec![0; 16]));
        pump.pump();
        let buffer = engine.fetch(Duration::ZERO).unwrap();
        let handle = buffer.handle();

        engine.stop();
        assert_eq!(sim.announced_count(), 1);
        assert!(matches!(buffer.queue(), Err(HarvestError::NotAcquiring)));
        assert_eq!(sim.announced_count(), 0);
        assert_eq!(sim.revoke_count(handle), 1);
    }

    #[test]
    fn test_cancellation_stops_session() {
        let host = CancellationToken::new();
        let sim = Arc::new(SimTransport::new(SimConfig {
            payload_size: Some(16),
            ..Default::default()
        }));
        let (worker, pump) = ManualWorker::new();
        let engine = AcquisitionEngine::builder(sim.clone())
            .worker(Box::new(worker))
            .cancellation(&host)
            .build()
            .unwrap();
        engine.start().unwrap();

        host.cancel();
        pump.pump();
        assert!(matches!(
            engine.fetch(Duration::from_millis(10)),
            Err(HarvestError::NotAcquiring)
        ));

        // The dispatcher runs stop; wait for the revoke to land
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.phase() != EnginePhase::Idle && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(sim.announced_count(), 0);
        assert!(matches!(engine.start(), Err(HarvestError::Cancelled)));
    }
}
