//! Crash-safe folder job queue for an external OCR tool.
//!
//! Documents dropped into the Input folder are claimed into Processing, run
//! through the OCR tool on a bounded worker pool, and end in exactly one of
//! Output, Error or Duplicate. Two front-ends (an interactive command line and
//! a background daemon) share the same folders and coordinate through
//! file-backed leases.

pub mod config;
pub mod models;
pub mod services;
pub mod telemetry;
