//! HTTP surface of the eventide runtime.

pub mod app;
pub mod config;
