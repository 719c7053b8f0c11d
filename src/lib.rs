//! # SeaFlow OPP Library
//!
//! This crate turns raw SeaFlow flow-cytometer particle files (EVT) into the
//! optimally positioned particle (OPP) subset and its summary statistics, and
//! records both for a cruise. The `seaflow-opp` binary (`main.rs`) is a thin
//! command-line front end over the same modules.
//!
//! ## Crate Structure
//!
//! - **`evt`**: The particle file model, the binary codec (plain or gzip),
//!   the logarithmic transform, and SeaFlow file naming.
//! - **`gating`**: The `GatingEngine`, which aligns D1/D2, infers notch slopes
//!   and produces an OPP membership mask over every row of a file.
//! - **`stats`**: Min/max/mean of the summary channels on the physical scale.
//! - **`db`**: The SQLite `Repository` holding filter parameters and per-file
//!   OPP summaries.
//! - **`retry`**: Bounded retry of database work under lock contention.
//! - **`sample`**: Seeded random row subsets drawn from a fraction of a
//!   cruise's files.
//! - **`batch`**: The `BatchOrchestrator`, which gates many files on a worker
//!   pool and tallies the outcome.
//! - **`config`**: Layered TOML + environment configuration.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `OppError` enum and its per-layer error families.

pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod evt;
pub mod gating;
pub mod logging;
pub mod retry;
pub mod sample;
pub mod stats;

pub use error::{AppResult, OppError};
