//! Print Sentinel - failure detection and job lifecycle engine for 3D printers.
//!
//! Camera frames from a running print are scored by four classical image
//! heuristics (edge density, line tracing, blob shapes and contour drift).
//! Confident, non-repeated detections become failure events that pause the
//! job. The engine also tracks the job state machine, printer availability
//! and filament spools with their low-inventory alerts.
//!
//! # Core Components
//!
//! * [`engine`] - The facade every collaborator talks to
//! * [`analyzer`] - Per-frame image heuristics and their fusion
//! * [`aggregator`] - Threshold, deduplication and cooldown of detections
//! * [`job`] - Print job state machine
//! * [`ledger`] - Spool accounting and inventory alerts
//! * [`repository`] - Storage trait and the in-memory implementation
//! * [`locks`] - Per-entity exclusive sections
//! * [`config`] - Engine and monitor configuration from the environment
//! * [`alerts`] - Discord webhook notifications
//! * [`image_fetcher`] - Camera frame download with retry logic
//! * [`error`] - Error types
//!
//! # Quick Start
//!
//! ```rust
//! use print_sentinel::*;
//!
//! let engine = Engine::new(EngineConfig::default(), InMemoryRepository::new());
//!
//! let printer = engine.register_printer(NewPrinter {
//!     name: "voron".into(),
//!     ..NewPrinter::default()
//! })?;
//! let spool = engine.create_spool(NewSpool::new(SpoolId::from("PLA_BLACK"), "PLA", 1000.0))?;
//! let job = engine.create_job(NewJob::new(printer.id.clone(), "bracket").with_spool(spool))?;
//!
//! assert_eq!(engine.start_job(&job.id)?, JobStatus::Printing);
//! let progress = engine.advance_progress(&job.id, 100.0, 12.5)?;
//! assert_eq!(progress.job_status, JobStatus::Completed);
//! # Ok::<(), EngineError>(())
//! ```

pub mod aggregator;
pub mod alerts;
pub mod analyzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod image_fetcher;
pub mod job;
pub mod ledger;
pub mod locks;
pub mod model;
pub mod repository;

pub use aggregator::DetectionAggregator;
pub use alerts::AlertService;
pub use analyzer::{Frame, FrameAnalyzer, ImageAnalyzer};
pub use config::{AnalyzerConfig, CooldownPolicy, EngineConfig, MonitorConfig};
pub use engine::{Engine, FrameOutcome, ProgressOutcome};
pub use error::{ConfigError, EngineError, EngineResult, Entity};
pub use image_fetcher::ImageFetcher;
pub use ledger::{InventoryLedger, UsageOutcome};
pub use model::{
    AlertId, AlertKind, BoundingBox, DetectionResult, Diagnostic, Evidence, FailureEvent,
    FailureType, Heuristic, InventoryAlert, JobId, JobStatus, NewJob, NewPrinter, NewSpool,
    PrintJob, Printer, PrinterId, PrinterStatus, Region, Spool, SpoolId, Transition,
};
pub use repository::{InMemoryRepository, Repository};
