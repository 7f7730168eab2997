//! The simulator's assembly layer: CLI, scenario config, boot.
//!
//! Everything algorithmic lives in the library crates under `libs/`;
//! this crate wires them together into the `umbra` binary.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cli;
pub mod config;
pub mod controller;
pub mod graphml;
pub mod plugin_app;
