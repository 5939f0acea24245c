//! ESP32-S3 firmware-specific modules for the balancer
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: the software-sequenced analog front end, the LEDC bleed PWM and
//! the RTT host link. Everything else lives in `balancer-core`.

#![no_std]

pub mod bleed;
pub mod front_end;
pub mod host_link;
