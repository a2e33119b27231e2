//! gpusched-api: REST API server for gpusched
//!
//! This crate provides the REST API for interacting with the scheduler:
//! - Job submission, inspection and lifecycle reports
//! - Device and telemetry listing
//! - System status

pub mod rest;

pub use rest::create_router;
