#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Monitor-analyze-plan-execute controller for one agent of a swarm,
//! with pluggable platforms, algorithms and accents over a shared
//! knowledge store.

/// Platform and algorithm contracts, registries and built-ins.
#[path = "../behaviors/main.rs"]
pub mod behaviors;

/// TOML configuration documents.
#[path = "../config.rs"]
pub mod config;

/// The MAPE engine, its builder and scheduler.
#[path = "../controller/main.rs"]
pub mod controller;

/// Controller error type.
#[path = "../error.rs"]
pub mod error;

/// Shared knowledge store.
#[path = "../knowledge/main.rs"]
pub mod knowledge;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Structured views over the knowledge store.
#[path = "../variables/main.rs"]
pub mod variables;

/// Runtime entrypoints and orchestration helpers.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use behaviors::factory::{
    AlgorithmFactory, AlgorithmRegistry, BehaviorRegistry, PlatformFactory, PlatformRegistry,
};
pub use behaviors::{
    Algorithm, AlgorithmBindings, Platform, PlatformBindings, PlatformHandle, Status,
};
pub use config::{AgentSection, BehaviorSpec, ControllerConfig, LoggingSection};
pub use controller::maker::ControllerBuilder;
pub use controller::scheduler::RunTiming;
pub use controller::{Controller, ControllerMetrics};
pub use error::ControllerError;
pub use knowledge::{KnowledgeBase, KnowledgeValue};
pub use orchestration_entry::{demo_swarm, ControllerRuntime};
pub use telemetry::{ControllerTelemetry, ControllerTelemetryBuilder};
pub use variables::{
    DeviceRecord, Devices, PlatformFlag, PlatformStatus, Position, SelfRecord, SensorRegistry,
    SensorSpec, SwarmRecord,
};
