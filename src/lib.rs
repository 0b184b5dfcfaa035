//! mbgw — Modbus TCP to RTU gateway
//!
//! Bridges any number of concurrent Modbus TCP clients onto a single RS-485
//! bus while keeping the bus strictly single-master: one dedicated worker
//! thread owns the serial port and plays every transaction to completion
//! before starting the next, and per-client session threads translate
//! between the MBAP and RTU framings at the edges.
//!
//! The `protocol` module holds the pure codec (CRC-16, MBAP, response
//! shapes), `gateway` holds the moving parts (transactions, the worker, the
//! sessions, the server), and `config` the TOML-backed settings snapshot.

#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
pub mod config;
pub mod gateway;
pub mod protocol;
#[doc(hidden)]
pub mod utils;
