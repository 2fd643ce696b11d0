//! kernel-resume - keep track of long-running cell executions across
//! front-end restarts.
//!
//! When a notebook runs code on a kernel hosted by a server, the kernel keeps
//! running after the front-end goes away. This crate records, per notebook,
//! which cell sent the latest execution to which kernel ([`tracker`]), and
//! when the notebook is attached to that same live kernel again, asks the
//! kernel to resume tracking that cell ([`coordinator`]).
//!
//! It also answers whether local kernels may be driven over the direct
//! in-process transport ([`probe`]).

pub mod controller;
pub mod coordinator;
pub mod memento;
pub mod probe;
pub mod service;
pub mod settings;
pub mod telemetry;
pub mod tracker;

pub use controller::{ControllerManager, ControllerRegistry, ControllerSelected, NotebookController};
pub use coordinator::{ResumeOutcome, ResumptionCoordinator};
pub use memento::{FileMemento, InMemoryMemento, Memento, MementoError};
pub use probe::{LoopbackTransport, RawTransportSupport, TransportLoader};
pub use service::{ActivationHandle, ExecutionResumeService};
pub use settings::{load_settings, Settings};
pub use telemetry::{LogTelemetry, TelemetryEvent, TelemetrySink};
pub use tracker::{load_record, record_key, ExecutionRecord, ExecutionTracker, TrackedExecution};
