//! Windowkeeper - Concurrent Sliding-Window Rate Limiting
//!
//! This crate implements an in-process admission controller. Every caller
//! supplied key gets its own ledger of admission timestamps, and a request is
//! admitted only while fewer than the configured number of requests fall
//! inside the trailing window.

pub mod config;
pub mod error;
pub mod ratelimit;
