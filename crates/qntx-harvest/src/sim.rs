//! In-memory producer and node map
//!
//! A channel-backed implementation of [`Transport`] for testing and
//! development. Frames are pushed with [`SimTransport::deliver`]; the
//! producer keeps per-handle counters so tests can check that no buffer is
//! queued or revoked twice.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::buffer::{BufferInfo, ContextTag, ImageInfo, RawBlock};
use crate::error::{FeatureError, TransportError};
use crate::features::{AcquisitionMode, FeatureValue, NodeMap};
use crate::payload::PayloadType;
use crate::transport::{BufferHandle, Delivery, EventToken, QueueRejected, Transport};

/// Behaviour knobs for [`SimTransport`]
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub min_announce: usize,
    pub payload_size: Option<usize>,
    pub timestamp_frequency: Option<u64>,
    /// Fail the n-th announce call (0-based)
    pub fail_announce_at: Option<usize>,
    pub fail_start: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            min_announce: 1,
            payload_size: None,
            timestamp_frequency: None,
            fail_announce_at: None,
            fail_start: false,
        }
    }
}

/// A frame to push through the producer
#[derive(Debug, Clone, Default)]
pub struct SimFrame {
    pub info: BufferInfo,
    pub data: Vec<u8>,
}

impl SimFrame {
    /// Raw frame with no geometry.
    pub fn new(frame_id: u64, data: Vec<u8>) -> Self {
        Self {
            info: BufferInfo {
                frame_id,
                payload_type: PayloadType::RawData,
                ..Default::default()
            },
            data,
        }
    }

    /// Mono8 image whose pixels count up from the frame id.
    pub fn mono8(frame_id: u64, width: usize, height: usize) -> Self {
        let data = (0..width * height)
            .map(|i| (frame_id as usize).wrapping_add(i) as u8)
            .collect();
        Self {
            info: BufferInfo {
                frame_id,
                payload_type: PayloadType::Image,
                image: ImageInfo {
                    width: Some(width),
                    height: Some(height),
                    pixel_format: Some(0x0108_0001),
                    ..Default::default()
                },
                ..Default::default()
            },
            data,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.info.timestamp = Some(timestamp);
        self
    }

    pub fn incomplete(mut self) -> Self {
        self.info.incomplete = true;
        self
    }
}

enum Signal {
    Buffer(Delivery),
    Wake,
}

struct SimBuffer {
    tag: ContextTag,
    memory: Option<RawBlock>,
    queued: bool,
}

#[derive(Default)]
struct SimState {
    stream_open: bool,
    streaming: bool,
    mode: AcquisitionMode,
    next_handle: u64,
    next_token: u64,
    token: Option<EventToken>,
    announce_calls: usize,
    buffers: BTreeMap<u64, SimBuffer>,
    input: VecDeque<BufferHandle>,
    queue_counts: HashMap<u64, usize>,
    revoke_counts: HashMap<u64, usize>,
    double_queue_attempts: usize,
    double_revoke_attempts: usize,
    frames_lost: u64,
    start_calls: usize,
}

/// Channel-backed producer
pub struct SimTransport {
    config: SimConfig,
    state: Mutex<SimState>,
    tx: Sender<Signal>,
    rx: Receiver<Signal>,
}

impl SimTransport {
    pub fn new(config: SimConfig) -> Self {
        let (tx, rx) = unbounded();
        Self {
            config,
            state: Mutex::new(SimState::default()),
            tx,
            rx,
        }
    }

    /// Fill the oldest queued buffer with `frame` and post it.
    ///
    /// Returns false when not streaming or when no buffer is queued (the
    /// frame is lost, as a real device would drop it).
    pub fn deliver(&self, frame: SimFrame) -> bool {
        let mut state = self.state.lock();
        if !state.streaming {
            return false;
        }
        let Some(handle) = state.input.pop_front() else {
            state.frames_lost += 1;
            return false;
        };
        let Some(buffer) = state.buffers.get_mut(&handle.0) else {
            return false;
        };
        let Some(mut block) = buffer.memory.take() else {
            return false;
        };
        buffer.queued = false;

        let bytes = block.bytes_mut();
        let n = frame.data.len().min(bytes.len());
        bytes[..n].copy_from_slice(&frame.data[..n]);

        let mut info = frame.info;
        if info.size_filled.is_none() {
            info.size_filled = Some(n);
        }
        if info.timestamp_frequency.is_none() {
            info.timestamp_frequency = self.config.timestamp_frequency;
        }
        // Unbounded channel, the receiver lives as long as self
        let _ = self.tx.send(Signal::Buffer(Delivery { handle, block, info }));
        true
    }

    pub fn announced_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().input.len()
    }

    /// Context tags currently waiting in the producer's input queue.
    pub fn queued_tags(&self) -> Vec<ContextTag> {
        let state = self.state.lock();
        state
            .input
            .iter()
            .filter_map(|h| state.buffers.get(&h.0).map(|b| b.tag))
            .collect()
    }

    pub fn queue_count(&self, handle: BufferHandle) -> usize {
        self.state.lock().queue_counts.get(&handle.0).copied().unwrap_or(0)
    }

    pub fn revoke_count(&self, handle: BufferHandle) -> usize {
        self.state.lock().revoke_counts.get(&handle.0).copied().unwrap_or(0)
    }

    pub fn double_queue_attempts(&self) -> usize {
        self.state.lock().double_queue_attempts
    }

    pub fn double_revoke_attempts(&self) -> usize {
        self.state.lock().double_revoke_attempts
    }

    pub fn frames_lost(&self) -> u64 {
        self.state.lock().frames_lost
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn is_stream_open(&self) -> bool {
        self.state.lock().stream_open
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.state.lock().mode
    }

    /// Pull pending deliveries out of the channel and give their memory back to the records.
    fn drain_signals(&self, state: &mut SimState) {
        for signal in self.rx.try_iter() {
            if let Signal::Buffer(delivery) = signal {
                if let Some(buffer) = state.buffers.get_mut(&delivery.handle.0) {
                    buffer.memory = Some(delivery.block);
                }
            }
        }
    }
}

impl Transport for SimTransport {
    fn min_announce_count(&self) -> Result<usize, TransportError> {
        Ok(self.config.min_announce)
    }

    fn payload_size(&self) -> Option<usize> {
        self.config.payload_size
    }

    fn create_data_stream(&self) -> Result<(), TransportError> {
        self.state.lock().stream_open = true;
        Ok(())
    }

    fn close_data_stream(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.streaming {
            return Err(TransportError::Busy("stream is acquiring".to_string()));
        }
        state.stream_open = false;
        Ok(())
    }

    fn announce(&self, tag: ContextTag, _size: usize) -> Result<BufferHandle, TransportError> {
        let mut state = self.state.lock();
        let call = state.announce_calls;
        state.announce_calls += 1;
        if self.config.fail_announce_at == Some(call) {
            return Err(TransportError::Other("announce refused".to_string()));
        }
        if !state.stream_open {
            return Err(TransportError::NotAvailable("data stream closed".to_string()));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.buffers.insert(
            handle,
            SimBuffer {
                tag,
                memory: None,
                queued: false,
            },
        );
        Ok(BufferHandle(handle))
    }

    fn queue(&self, handle: BufferHandle, block: RawBlock) -> Result<(), QueueRejected> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(buffer) = state.buffers.get_mut(&handle.0) else {
            return Err(QueueRejected {
                error: TransportError::InvalidHandle(handle.0),
                block,
            });
        };
        if buffer.queued {
            state.double_queue_attempts += 1;
            return Err(QueueRejected {
                error: TransportError::Busy(format!("buffer {} already queued", handle.0)),
                block,
            });
        }
        buffer.memory = Some(block);
        buffer.queued = true;
        state.input.push_back(handle);
        *state.queue_counts.entry(handle.0).or_default() += 1;
        Ok(())
    }

    fn revoke(&self, handle: BufferHandle) -> Result<Option<RawBlock>, TransportError> {
        let mut state = self.state.lock();
        let Some(buffer) = state.buffers.remove(&handle.0) else {
            if state.revoke_counts.contains_key(&handle.0) {
                state.double_revoke_attempts += 1;
            }
            return Err(TransportError::InvalidHandle(handle.0));
        };
        state.input.retain(|h| *h != handle);
        *state.revoke_counts.entry(handle.0).or_default() += 1;
        Ok(buffer.memory)
    }

    fn start_acquisition(&self, mode: AcquisitionMode) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        if self.config.fail_start {
            return Err(TransportError::Other("start refused".to_string()));
        }
        if !state.stream_open {
            return Err(TransportError::NotAvailable("data stream closed".to_string()));
        }
        state.streaming = true;
        state.mode = mode;
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.streaming {
            return Err(TransportError::Busy("acquisition already stopped".to_string()));
        }
        state.streaming = false;
        Ok(())
    }

    fn flush_buffer_queue(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        for handle in state.input.drain(..) {
            if let Some(buffer) = state.buffers.get_mut(&handle.0) {
                buffer.queued = false;
            }
        }
        Ok(())
    }

    fn register_new_buffer_event(&self) -> Result<EventToken, TransportError> {
        let mut state = self.state.lock();
        // Leftovers from a previous registration
        self.drain_signals(&mut state);
        state.next_token += 1;
        let token = EventToken(state.next_token);
        state.token = Some(token);
        Ok(token)
    }

    fn unregister_event(&self, token: EventToken) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.token != Some(token) {
            return Err(TransportError::InvalidHandle(token.0));
        }
        state.token = None;
        Ok(())
    }

    fn wait_event(&self, token: EventToken, timeout: Duration) -> Result<Delivery, TransportError> {
        if self.state.lock().token != Some(token) {
            return Err(TransportError::InvalidHandle(token.0));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(Signal::Buffer(delivery)) => Ok(delivery),
            Ok(Signal::Wake) => Err(TransportError::Aborted),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Aborted),
        }
    }

    fn flush_event_queue(&self, token: EventToken) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.token != Some(token) {
            return Err(TransportError::InvalidHandle(token.0));
        }
        self.drain_signals(&mut state);
        let _ = self.tx.send(Signal::Wake);
        Ok(())
    }

    fn timestamp_frequency(&self) -> Option<u64> {
        self.config.timestamp_frequency
    }
}

/// Feature table with recorded command invocations
#[derive(Debug, Default)]
pub struct SimNodeMap {
    values: Mutex<HashMap<String, FeatureValue>>,
    commands: Vec<String>,
    invoked: Mutex<Vec<String>>,
}

impl SimNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, value: FeatureValue) -> Self {
        self.values.lock().insert(name.to_string(), value);
        self
    }

    pub fn with_command(mut self, name: &str) -> Self {
        self.commands.push(name.to_string());
        self
    }

    /// Commands executed so far, in order.
    pub fn invocations(&self) -> Vec<String> {
        self.invoked.lock().clone()
    }

    pub fn value(&self, name: &str) -> Option<FeatureValue> {
        self.values.lock().get(name).cloned()
    }
}

impl NodeMap for SimNodeMap {
    fn get(&self, name: &str) -> Result<FeatureValue, FeatureError> {
        self.values
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureError::NotFound(name.to_string()))
    }

    fn set(&self, name: &str, value: FeatureValue) -> Result<(), FeatureError> {
        let mut values = self.values.lock();
        match values.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(FeatureError::NotFound(name.to_string())),
        }
    }

    fn invoke(&self, name: &str) -> Result<(), FeatureError> {
        if !self.commands.iter().any(|c| c == name) {
            return Err(FeatureError::NotFound(name.to_string()));
        }
        self.invoked.lock().push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_requires_queued_buffer() {
        let sim = SimTransport::new(SimConfig::default());
        sim.create_data_stream().unwrap();
        sim.start_acquisition(AcquisitionMode::Continuous).unwrap();
        assert!(!sim.deliver(SimFrame::new(1, vec![0; 4])));
        assert_eq!(sim.frames_lost(), 1);
    }

    #[test]
    fn test_double_queue_refused() {
        let sim = SimTransport::new(SimConfig::default());
        sim.create_data_stream().unwrap();
        let handle = sim.announce(0, 8).unwrap();
        sim.queue(handle, RawBlock::allocate(0, 8).unwrap()).unwrap();
        let rejected = sim.queue(handle, RawBlock::allocate(0, 8).unwrap());
        assert!(rejected.is_err());
        assert_eq!(sim.double_queue_attempts(), 1);
        assert_eq!(sim.queue_count(handle), 1);
    }

    #[test]
    fn test_flush_wakes_waiter() {
        let sim = SimTransport::new(SimConfig::default());
        let token = sim.register_new_buffer_event().unwrap();
        sim.flush_event_queue(token).unwrap();
        let result = sim.wait_event(token, Duration::from_secs(5));
        assert!(matches!(result, Err(TransportError::Aborted)));
    }

    #[test]
    fn test_flushed_delivery_returns_memory() {
        let sim = SimTransport::new(SimConfig::default());
        sim.create_data_stream().unwrap();
        let token = sim.register_new_buffer_event().unwrap();
        let handle = sim.announce(0, 8).unwrap();
        sim.queue(handle, RawBlock::allocate(0, 8).unwrap()).unwrap();
        sim.start_acquisition(AcquisitionMode::Continuous).unwrap();
        assert!(sim.deliver(SimFrame::new(3, vec![9; 8])));

        sim.flush_event_queue(token).unwrap();
        let memory = sim.revoke(handle).unwrap();
        assert_eq!(memory.map(|b| b.bytes()[0]), Some(9));
        assert!(sim.revoke(handle).is_err());
        assert_eq!(sim.double_revoke_attempts(), 1);
    }

    #[test]
    fn test_node_map_commands() {
        let map = SimNodeMap::new()
            .with("Width", FeatureValue::Integer(4))
            .with_command("AcquisitionStart");
        map.invoke("AcquisitionStart").unwrap();
        assert!(map.invoke("AcquisitionStop").is_err());
        assert!(map.set("Height", FeatureValue::Integer(2)).is_err());
        assert_eq!(map.invocations(), vec!["AcquisitionStart".to_string()]);
    }
}
