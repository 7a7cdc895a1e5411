//! Humanise Training - adversarial step engine, epoch driver and checkpoints
//!
//! A [`Session`] owns the generator/discriminator pair, their optimisers, the
//! shared criterion, label storage and the monotonic epoch/step counters.

pub mod checkpoint;
pub mod config;
pub mod criterion;
pub mod dataset;
pub mod label;
pub mod session;
pub mod step;
pub mod summary;

pub use checkpoint::{checkpoint_file_name, latest_checkpoint, Checkpoint};
pub use config::TrainerConfig;
pub use criterion::BceLoss;
pub use dataset::{Batch, BatchSource, PerformanceDataset, PerformanceSample};
pub use label::{LabelBuffer, FAKE_LABEL, REAL_LABEL};
pub use session::{EpochSummary, HumaniseSession, OperationMode, Session};
pub use step::{AdversarialPair, TrainStepMetrics, ValidationStepMetrics};
pub use summary::{MemorySink, MetricsSink, ScalarRecord, SummaryWriter};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
