//! Shared test utilities for scanbind integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a real orchestrator to an in-memory database and
//!   temp directories of generated page images
//! - `ScriptedEngine`, an `OcrEngine` whose answers are set up per test

pub mod engine;
pub mod harness;

pub use engine::ScriptedEngine;
pub use harness::TestHarness;
