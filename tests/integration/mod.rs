//! Integration test suite for polyphon.
//!
//! These tests drive the session hub, watchdog and coordinator together
//! through a scripted transport. No agent process is involved.
//!
//! # Test Categories
//!
//! - `turns`: turn lifecycle, generation tickets, queueing
//! - `watchdog`: stuck-turn detection and recovery
//! - `orchestration`: broadcast, sequential and orchestrator modes
//! - `reflection`: reflection cycles and the reflective orchestrator loop

mod fixtures;

mod orchestration;
mod turns;
mod watchdog;
