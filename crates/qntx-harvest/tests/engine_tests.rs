//! Acquisition engine behaviour against the in-memory producer

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use qntx_harvest::buffer::ContextTag;
use qntx_harvest::pfnc::ElementType;
use qntx_harvest::sim::{SimConfig, SimFrame, SimTransport};
use qntx_harvest::transport::QueueRejected;
use qntx_harvest::{
    AcquisitionConfig, AcquisitionEngine, AcquisitionMode, BufferHandle, Delivery, EventToken,
    FilledBuffer, HarvestError, ManualPump, ManualWorker, PoolCensus, RawBlock, Transport,
    TransportError,
};

const FRAME_BYTES: usize = 64;

fn config(num_buffers: usize, hold: usize, keep_latest: bool) -> AcquisitionConfig {
    AcquisitionConfig {
        num_buffers,
        num_filled_buffers_to_hold: hold,
        keep_latest,
        timeout_for_image_acquisition_ms: 5,
        ..Default::default()
    }
}

fn producer() -> Arc<SimTransport> {
    Arc::new(SimTransport::new(SimConfig {
        payload_size: Some(FRAME_BYTES),
        timestamp_frequency: Some(1_000_000_000),
        ..Default::default()
    }))
}

/// Engine whose delivery loop is pumped by the test
fn manual_engine(config: AcquisitionConfig) -> (AcquisitionEngine, Arc<SimTransport>, ManualPump) {
    let sim = producer();
    let (worker, pump) = ManualWorker::new();
    let engine = AcquisitionEngine::builder(sim.clone())
        .config(config)
        .worker(Box::new(worker))
        .build()
        .unwrap();
    (engine, sim, pump)
}

/// Engine with the default native delivery thread
fn threaded_engine(config: AcquisitionConfig) -> (Arc<AcquisitionEngine>, Arc<SimTransport>) {
    let sim = producer();
    let engine = AcquisitionEngine::builder(sim.clone())
        .config(config)
        .name("test")
        .build()
        .unwrap();
    (Arc::new(engine), sim)
}

fn deliver(sim: &SimTransport, pump: &ManualPump, frame_id: u64) {
    assert!(sim.deliver(SimFrame::new(frame_id, vec![frame_id as u8; FRAME_BYTES])));
    assert!(pump.pump());
}

/// Every block is accounted for and no tag is owned twice.
fn assert_conserved(engine: &AcquisitionEngine, sim: &SimTransport, num_buffers: usize) {
    engine.with_lock(|view| {
        let census = view.census().unwrap();
        assert_eq!(census.live(), num_buffers);
        assert_eq!(census.revoked, 0);
        assert_eq!(census.queued, sim.queued_count());

        let held: HashSet<_> = view.held_tags().into_iter().collect();
        let queued: HashSet<_> = sim.queued_tags().into_iter().collect();
        assert!(held.is_disjoint(&queued));
        assert_eq!(held.len(), census.held);
    });
}

#[test]
fn test_fifo_fetch_order() {
    let (engine, sim, pump) = manual_engine(config(4, 3, true));
    engine.start().unwrap();

    for id in 1..=3 {
        deliver(&sim, &pump, id);
    }

    let ids: Vec<u64> = (0..3)
        .map(|_| {
            let buffer = engine.fetch(Duration::ZERO).unwrap();
            let id = buffer.frame_id();
            buffer.queue().unwrap();
            id
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    engine.stop();
}

#[test]
fn test_keep_latest_single_hold() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();

    deliver(&sim, &pump, 1);
    deliver(&sim, &pump, 2);
    assert_eq!(engine.num_holding_filled_buffers(), 1);

    let buffer = engine.fetch(Duration::ZERO).unwrap();
    assert_eq!(buffer.frame_id(), 2);
    drop(buffer);

    // Frame 1 went back to the producer and is never handed out
    assert!(matches!(
        engine.fetch(Duration::ZERO),
        Err(HarvestError::Timeout(_))
    ));
    assert_eq!(engine.statistics().num_dropped, 1);
    assert_conserved(&engine, &sim, 3);
    engine.stop();
}

#[test]
fn test_fetch_timeout_window() {
    let (engine, _sim, _pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();

    let started = Instant::now();
    let result = engine.fetch(Duration::from_millis(100));
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(HarvestError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(350), "{:?}", elapsed);
    engine.stop();
}

#[test]
fn test_try_fetch_returns_none_on_timeout() {
    let (engine, _sim, _pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();
    assert!(engine.try_fetch(Duration::ZERO).unwrap().is_none());
    engine.stop();
}

#[test]
fn test_fetch_before_start_fails_immediately() {
    let (engine, _sim, _pump) = manual_engine(config(3, 1, true));

    let started = Instant::now();
    let result = engine.fetch(Duration::from_secs(10));
    assert!(matches!(result, Err(HarvestError::NotAcquiring)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_stop_is_idempotent() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.stop();

    engine.start().unwrap();
    deliver(&sim, &pump, 1);
    engine.stop();
    engine.stop();

    assert_eq!(sim.announced_count(), 0);
    assert_eq!(sim.double_revoke_attempts(), 0);
    assert!(!engine.is_acquiring());
}

#[test]
fn test_four_buffer_scenario() {
    let (engine, sim, pump) = manual_engine(config(4, 4, true));
    engine.start().unwrap();
    let initial = engine.with_lock(|view| view.census()).unwrap();
    assert_eq!(
        initial,
        PoolCensus {
            queued: 4,
            ..Default::default()
        }
    );

    for id in 1..=4 {
        deliver(&sim, &pump, id);
        assert_conserved(&engine, &sim, 4);
    }

    let buffers: Vec<_> = (0..4)
        .map(|_| engine.fetch(Duration::ZERO).unwrap())
        .collect();
    let ids: HashSet<u64> = buffers.iter().map(|b| b.frame_id()).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(engine.with_lock(|view| view.census()).unwrap().borrowed, 4);

    for buffer in buffers {
        engine.queue(buffer).unwrap();
    }

    assert_eq!(engine.with_lock(|view| view.census()).unwrap(), initial);
    assert_eq!(engine.num_holding_filled_buffers(), 0);
    assert_eq!(sim.queued_count(), 4);
    assert_eq!(sim.double_queue_attempts(), 0);
    engine.stop();
}

#[test]
fn test_conservation_through_mixed_traffic() {
    let (engine, sim, pump) = manual_engine(config(5, 2, true));
    engine.start().unwrap();

    let mut lent = Vec::new();
    for id in 1..=30u64 {
        if sim.deliver(SimFrame::new(id, vec![0; FRAME_BYTES])) {
            pump.pump();
        }
        assert_conserved(&engine, &sim, 5);

        if id % 3 == 0 {
            if let Ok(buffer) = engine.fetch(Duration::ZERO) {
                lent.push(buffer);
            }
        }
        if id % 5 == 0 {
            for buffer in lent.drain(..) {
                buffer.queue().unwrap();
            }
        }
        assert_conserved(&engine, &sim, 5);
    }

    drop(lent);
    assert_conserved(&engine, &sim, 5);
    engine.stop();
    assert_eq!(sim.announced_count(), 0);
    assert_eq!(sim.double_queue_attempts(), 0);
    assert_eq!(sim.double_revoke_attempts(), 0);
}

#[test]
fn test_dropped_buffer_is_requeued() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();
    deliver(&sim, &pump, 1);

    {
        let buffer = engine.fetch(Duration::ZERO).unwrap();
        assert_eq!(sim.queued_count(), 2);
        assert_eq!(buffer.frame_id(), 1);
    }

    assert_eq!(sim.queued_count(), 3);
    assert_conserved(&engine, &sim, 3);
    engine.stop();
}

#[test]
fn test_statistics_reset_on_start() {
    let (engine, sim, pump) = manual_engine(config(3, 3, true));
    engine.start().unwrap();
    for id in 1..=3 {
        deliver(&sim, &pump, id);
    }
    assert_eq!(engine.statistics().num_images, 3);
    engine.stop();
    assert_eq!(engine.statistics().num_images, 3);

    engine.start().unwrap();
    assert_eq!(engine.statistics().num_images, 0);
    deliver(&sim, &pump, 4);
    assert_eq!(engine.statistics().num_images, 1);
    engine.stop();
}

#[test]
fn test_fps_from_producer_timestamps() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();

    for (id, ts) in [(1u64, 0u64), (2, 100_000_000), (3, 150_000_000)] {
        assert!(sim.deliver(SimFrame::new(id, vec![0; 8]).with_timestamp(ts)));
        pump.pump();
    }
    let stats = engine.statistics();
    assert!((stats.fps - 20.0).abs() < 1e-6);
    assert!((stats.fps_max - 20.0).abs() < 1e-6);
    engine.stop();
}

#[test]
fn test_fetched_mono8_decodes() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();

    assert!(sim.deliver(SimFrame::mono8(7, 8, 8)));
    pump.pump();

    let buffer = engine.fetch(Duration::ZERO).unwrap();
    let payload = buffer.payload();
    let component = &payload.components()[0];
    assert_eq!(component.element_count(), 64);
    let data = component.data().unwrap();
    assert_eq!(data.bytes()[0], 7);
    assert_eq!(data.bytes()[63], 7 + 63);
    drop(payload);
    buffer.queue().unwrap();
    engine.stop();
}

#[test]
fn test_fetched_rgb8_decodes() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();

    let mut frame = SimFrame::mono8(3, 4, 5);
    frame.info.image.pixel_format = Some(0x0218_0014);
    frame.data = vec![0x11; 4 * 5 * 3];
    assert!(sim.deliver(frame));
    pump.pump();

    let buffer = engine.fetch(Duration::ZERO).unwrap();
    let payload = buffer.payload();
    let component = &payload.components()[0];
    assert_eq!(component.element_count(), 4 * 5 * 3);
    assert_eq!(component.data().unwrap().element(), ElementType::U8);
    assert_eq!(component.num_components_per_pixel(), 3.0);
    drop(payload);
    buffer.queue().unwrap();
    engine.stop();
}

#[test]
fn test_bad_chunk_data_does_not_block_fetch() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();

    let mut frame = SimFrame::mono8(1, 4, 4);
    frame.info.chunks.push(qntx_harvest::chunk::ChunkDescriptor {
        id: 0xA5,
        offset: 12,
        size: 100,
    });
    assert!(sim.deliver(frame));
    pump.pump();

    let buffer = engine.fetch(Duration::ZERO).unwrap();
    assert!(matches!(buffer.chunks(), Err(HarvestError::ChunkParse(_))));
    assert_eq!(buffer.payload().components()[0].element_count(), 16);
    engine.stop();
}

#[test]
fn test_stream_closed_when_not_kept_open() {
    let cfg = AcquisitionConfig {
        keep_data_stream_open: false,
        ..config(3, 1, true)
    };
    let (engine, sim, _pump) = manual_engine(cfg);
    assert!(!sim.is_stream_open());

    engine.start().unwrap();
    assert!(sim.is_stream_open());
    engine.stop();
    assert!(!sim.is_stream_open());
}

#[test]
fn test_drop_releases_stream() {
    let (engine, sim, _pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();
    drop(engine);
    assert!(!sim.is_streaming());
    assert!(!sim.is_stream_open());
    assert_eq!(sim.announced_count(), 0);
}

#[test]
fn test_stop_unblocks_waiting_consumer() {
    let (engine, _sim) = threaded_engine(config(3, 1, true));
    engine.start().unwrap();

    let consumer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let started = Instant::now();
            let result = engine.fetch(Duration::from_secs(10));
            (result.map(|b| b.frame_id()), started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(50));
    engine.stop();
    let (result, elapsed) = consumer.join().unwrap();
    assert!(matches!(result, Err(HarvestError::NotAcquiring)));
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_stop_does_not_wait_for_acquisition_timeout() {
    let cfg = AcquisitionConfig {
        timeout_for_image_acquisition_ms: 10_000,
        ..config(3, 1, true)
    };
    let (engine, _sim) = threaded_engine(cfg);
    engine.start().unwrap();
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    engine.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_threaded_delivery_end_to_end() {
    let (engine, sim) = threaded_engine(config(4, 1, true));
    engine.start().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let producer = {
        let sim = Arc::clone(&sim);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut id = 0u64;
            while running.load(Ordering::Acquire) {
                id += 1;
                sim.deliver(SimFrame::new(id, vec![0; FRAME_BYTES]));
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let mut ids = Vec::new();
    while ids.len() < 20 {
        let buffer = engine.fetch(Duration::from_secs(2)).unwrap();
        ids.push(buffer.frame_id());
        buffer.queue().unwrap();
    }

    running.store(false, Ordering::Release);
    producer.join().unwrap();
    engine.stop();

    assert!(ids.windows(2).all(|w| w[0] < w[1]), "{:?}", ids);
    assert_eq!(sim.double_queue_attempts(), 0);
    assert_eq!(sim.double_revoke_attempts(), 0);
    assert_eq!(sim.announced_count(), 0);
}

#[test]
fn test_concurrent_consumers_never_share_a_buffer() {
    let (engine, sim) = threaded_engine(config(6, 4, false));
    engine.start().unwrap();

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(buffer) = engine.fetch(Duration::from_millis(200)) {
                    seen.push(buffer.frame_id());
                    buffer.queue().unwrap();
                }
                seen
            })
        })
        .collect();

    let mut delivered = 0;
    let mut id = 0u64;
    while delivered < 60 {
        id += 1;
        if sim.deliver(SimFrame::new(id, vec![0; FRAME_BYTES])) {
            delivered += 1;
        }
        thread::sleep(Duration::from_micros(200));
    }
    // Let consumers drain, then their fetches time out
    let seen: Vec<u64> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len());
    assert!(!seen.is_empty());

    engine.stop();
    assert_eq!(sim.double_queue_attempts(), 0);
}

/// Forwards to the in-memory producer and returns a parked buffer while
/// the next session registers its new-buffer event.
struct ReturnDuringStart {
    sim: Arc<SimTransport>,
    parked: Mutex<Option<FilledBuffer>>,
    returned: Mutex<Option<qntx_harvest::Result<()>>>,
}

impl Transport for ReturnDuringStart {
    fn min_announce_count(&self) -> Result<usize, TransportError> {
        self.sim.min_announce_count()
    }

    fn payload_size(&self) -> Option<usize> {
        self.sim.payload_size()
    }

    fn create_data_stream(&self) -> Result<(), TransportError> {
        self.sim.create_data_stream()
    }

    fn close_data_stream(&self) -> Result<(), TransportError> {
        self.sim.close_data_stream()
    }

    fn announce(&self, tag: ContextTag, size: usize) -> Result<BufferHandle, TransportError> {
        self.sim.announce(tag, size)
    }

    fn queue(&self, handle: BufferHandle, block: RawBlock) -> Result<(), QueueRejected> {
        self.sim.queue(handle, block)
    }

    fn revoke(&self, handle: BufferHandle) -> Result<Option<RawBlock>, TransportError> {
        self.sim.revoke(handle)
    }

    fn start_acquisition(&self, mode: AcquisitionMode) -> Result<(), TransportError> {
        self.sim.start_acquisition(mode)
    }

    fn stop_acquisition(&self) -> Result<(), TransportError> {
        self.sim.stop_acquisition()
    }

    fn flush_buffer_queue(&self) -> Result<(), TransportError> {
        self.sim.flush_buffer_queue()
    }

    fn register_new_buffer_event(&self) -> Result<EventToken, TransportError> {
        let parked = self.parked.lock().take();
        if let Some(buffer) = parked {
            *self.returned.lock() = Some(buffer.queue());
        }
        self.sim.register_new_buffer_event()
    }

    fn unregister_event(&self, token: EventToken) -> Result<(), TransportError> {
        self.sim.unregister_event(token)
    }

    fn wait_event(&self, token: EventToken, timeout: Duration) -> Result<Delivery, TransportError> {
        self.sim.wait_event(token, timeout)
    }

    fn flush_event_queue(&self, token: EventToken) -> Result<(), TransportError> {
        self.sim.flush_event_queue(token)
    }

    fn timestamp_frequency(&self) -> Option<u64> {
        self.sim.timestamp_frequency()
    }
}

#[test]
fn test_previous_session_buffer_returned_during_start() {
    let sim = producer();
    let transport = Arc::new(ReturnDuringStart {
        sim: Arc::clone(&sim),
        parked: Mutex::new(None),
        returned: Mutex::new(None),
    });
    let (worker, pump) = ManualWorker::new();
    let engine = AcquisitionEngine::builder(transport.clone())
        .config(config(3, 1, true))
        .worker(Box::new(worker))
        .build()
        .unwrap();

    engine.start().unwrap();
    deliver(&sim, &pump, 1);
    let buffer = engine.fetch(Duration::ZERO).unwrap();
    engine.stop();
    // The lent block outlives its session
    assert_eq!(sim.announced_count(), 1);

    *transport.parked.lock() = Some(buffer);
    engine.start().unwrap();

    let returned = transport.returned.lock().take().unwrap();
    assert!(matches!(returned, Err(HarvestError::NotAcquiring)));
    assert_eq!(sim.announced_count(), 3);
    assert_eq!(
        engine.with_lock(|view| view.census()).unwrap(),
        PoolCensus {
            queued: 3,
            ..Default::default()
        }
    );
    assert_conserved(&engine, &sim, 3);

    deliver(&sim, &pump, 2);
    assert_eq!(engine.fetch(Duration::ZERO).unwrap().frame_id(), 2);

    engine.stop();
    assert_eq!(sim.announced_count(), 0);
    assert_eq!(sim.double_revoke_attempts(), 0);
    assert_eq!(sim.double_queue_attempts(), 0);
}

#[test]
fn test_mono16_padding_counts_elements() {
    let (engine, sim, pump) = manual_engine(config(3, 1, true));
    engine.start().unwrap();

    let mut frame = SimFrame::mono8(5, 4, 4);
    frame.info.image.pixel_format = Some(0x0110_0007);
    frame.info.image.y_padding = 4;
    frame.data = vec![0; 40];
    assert!(sim.deliver(frame));
    pump.pump();

    let buffer = engine.fetch(Duration::ZERO).unwrap();
    let payload = buffer.payload();
    let component = &payload.components()[0];
    let data = component.data().unwrap();
    assert_eq!(data.element(), ElementType::U16);
    assert_eq!(data.element_count(), 4 * 4 + 4);
    assert_eq!(component.shape(), Some((4, 4)));
    drop(payload);
    buffer.queue().unwrap();
    engine.stop();
}
