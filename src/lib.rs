//! Turnstile - Distributed Rate Limiting Service
//!
//! This crate decides whether a caller may proceed under a per-caller quota.
//! All counters live in a shared store (Redis in production), so any number
//! of stateless instances enforce one limit together.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
