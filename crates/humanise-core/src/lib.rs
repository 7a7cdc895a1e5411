//! Humanise Core - note encoding, decoder masks and reference networks
//!
//! Quantised ("robotic") performances go in, humanised performances come out.
//! This crate holds everything the adversarial training loop needs to know
//! about the data and the two networks, built on Hugging Face Candle.

pub mod attention;
pub mod config;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod layers;
pub mod mask;
pub mod network;
pub mod note;

pub use config::HumaniseConfig;
pub use discriminator::NoteDiscriminator;
pub use error::{HumaniseError, HumaniseResult};
pub use generator::NoteTransformer;
pub use mask::{shift_target, CoderMask, ShiftedTarget};
pub use network::{BuildNetwork, Discriminator, Generator, Network};
pub use note::{denormalise_note, normalise_note};

/// Humanise version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
