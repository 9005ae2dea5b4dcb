#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

//! Client library for the workbench worker process.
//!
//! The gateway talks to a single backing worker over newline-delimited JSON
//! on the worker's stdio. This crate owns that exchange end to end: process
//! lifecycle ([`client::WorkerSupervisor`]), the correlated session handshake
//! ([`client::WorkerHandle::initialize`]), and raw socket handoff for
//! upgraded connections ([`client::WorkerHandle::handoff_socket`]).

pub mod client;
pub mod protocol;

pub use client::{
    CommandLauncher, LaunchedWorker, WorkerError, WorkerHandle, WorkerLauncher, WorkerSupervisor,
};
pub use protocol::{
    GatewayMessage, Query, QueryValue, SessionOptions, StartPath, WorkbenchOptions, WorkerMessage,
};
