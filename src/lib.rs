// ==============================================================================
// lib.rs - PGx Report Processor Library
// ==============================================================================
// Description: Streaming flattening and paged retrieval of PGx reports
// Created: 2025-11-20
// Modified: 2025-12-02
// Version: 1.1.0
// ==============================================================================

pub mod config;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod join_store;
pub mod keys;
pub mod markup;
pub mod models;
pub mod pagination;
pub mod pipeline;
pub mod reader;
pub mod scanner;
pub mod scratch;
pub mod storage;
pub mod zygosity;

pub use error::PipelineError;
pub use pipeline::{JobRequest, PostProcessor, RunSummary};
