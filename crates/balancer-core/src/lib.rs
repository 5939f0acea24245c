//! Hardware-independent core library for the 8-cell balancer
//!
//! This crate contains all platform-agnostic logic of the balancer/monitor:
//! the multiplexer sequence, the acquisition state machine, deinterlacing and
//! aggregation of raw ADC bursts, the per-second accumulator, the balancing
//! controller, the multi-resolution history store and the wire encoding for
//! the wireless transport.
//!
//! It is `#![no_std]` so it compiles on both the ESP32-S3 firmware and
//! desktop hosts (for the simulator and tests).

#![no_std]

pub mod accumulator;
pub mod acquisition;
pub mod aggregate;
pub mod balancer;
pub mod config;
pub mod deinterlace;
pub mod error;
pub mod frame;
pub mod history;
pub mod mux;
pub mod pipeline;
pub mod telemetry;

pub use error::BalancerError;
