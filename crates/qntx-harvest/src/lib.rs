//! QNTX Harvest: buffer lifecycle and acquisition engine
//!
//! Drives a GenTL-style image producer: announces a pool of memory blocks,
//! keeps them circulating between the producer and consumers, and decodes
//! filled buffers into typed image components without copying.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐ deliveries ┌──────────────────┐  fetch  ┌──────────┐
//! │ Transport │───────────▶│ AcquisitionEngine│────────▶│ Consumer │
//! │ (producer)│◀───────────│ pool + hold list │◀────────│          │
//! └───────────┘   queue    └──────────────────┘  queue  └──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use qntx_harvest::sim::{SimConfig, SimFrame, SimTransport};
//! use qntx_harvest::AcquisitionEngine;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let producer = Arc::new(SimTransport::new(SimConfig {
//!     payload_size: Some(640 * 480),
//!     ..Default::default()
//! }));
//! let engine = AcquisitionEngine::builder(producer.clone()).build()?;
//! engine.start()?;
//!
//! producer.deliver(SimFrame::mono8(1, 640, 480));
//! let buffer = engine.fetch(Duration::from_millis(500))?;
//! for component in buffer.payload().components() {
//!     println!("{}x{}", component.width, component.height);
//! }
//! // Dropping the buffer also requeues it
//! buffer.queue()?;
//! engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod logging;
pub mod payload;
pub mod pfnc;
pub mod pool;
pub mod sim;
pub mod statistics;
pub mod transport;
pub mod worker;

pub use buffer::{BufferInfo, FilledBuffer, ImageInfo, PartInfo, RawBlock};
pub use config::AcquisitionConfig;
pub use engine::{AcquisitionEngine, AcquisitionEngineBuilder, EnginePhase, SessionView};
pub use error::{FeatureError, HarvestError, Result, TransportError};
pub use events::{Event, EventKind};
pub use features::{AcquisitionMode, FeatureValue, NodeMap, NullNodeMap};
pub use payload::{Component2DImage, Payload, PayloadDecoder, PayloadType};
pub use pfnc::{FormatLookup, PfncTable, PixelFormat};
pub use pool::{BlockState, BufferPool, PoolCensus};
pub use statistics::{Statistics, StatisticsSnapshot};
pub use transport::{BufferHandle, Delivery, EventToken, Transport};
pub use worker::{ManualPump, ManualWorker, NativeWorker, StepOutcome, Worker};

/// Re-exported so hosts can build the token they pass to the engine.
pub use tokio_util::sync::CancellationToken;
