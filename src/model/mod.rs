//! # Model Module
//!
//! Owns the expensive speech-recognition resource and every rule about its
//! lifetime.
//!
//! ## Key Components:
//! - **Recognizer port**: the narrow trait the rest of the application sees
//! - **Whisper**: the production recognizer built on Candle-rs
//! - **Lifecycle manager**: lazy single-flight loading, guarded unloading,
//!   last-used tracking, status broadcasts
//! - **Idle monitor**: background task that evicts the model after disuse
//!
//! ## Memory Management:
//! The model is loaded on demand and unloaded when nobody has used it for a
//! configurable window, so an idle server holds almost no memory.

pub mod idle;
pub mod lifecycle;
pub mod recognizer;
pub mod whisper;

pub use idle::IdleMonitor;
pub use lifecycle::{LifecycleError, LoadOutcome, ModelLifecycle, ModelState, StatusSnapshot, UnloadOutcome};
pub use recognizer::{ModelSize, Recognizer, RecognizerLoader};
