//! Adaptive quality governor for real-time rendering workloads.
//!
//! Trades target display rate, render scale and shader detail against the
//! device's thermal state, learning a persisted operating point per workload.
//! The daemon binary exposes the governor over a Unix socket; the library
//! can also be embedded directly through [`governor::Governor`].

pub mod analytics;
pub mod config;
pub mod controller;
pub mod error;
pub mod governor;
pub mod interpolator;
pub mod ipc_server;
pub mod logging;
pub mod metrics;
pub mod momentum;
pub mod optimizer;
pub mod platform;
pub mod profile;
pub mod store;
pub mod thermal;
