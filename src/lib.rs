//! Latency model of a two-level memory hierarchy.
//!
//! Split first-level instruction and data caches sit in front of a
//! shared second level, which is backed by main memory. Every access
//! returns the latency that reference pays, and each level keeps
//! reference, miss, and penalty counters for rate analysis.

/// Set-associative levels, the hierarchy wiring, and per-level statistics.
pub mod cache;

/// Geometry input, validated before any structure is allocated.
pub mod config;

/// Streaming reader for classified reference traces.
pub mod trace;
