// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Skein Core - domain model and ports of the skein workflow orchestrator
//!
//! This crate holds everything the control node (`skein-master`) shares with
//! storage and the worker fleet:
//!
//! - the domain model: workflow/task definitions, workflow/task instances,
//!   commands, schedules and master leases
//! - the workflow and task state machines as pure transition tables
//! - DAG validation and runnable-task computation
//! - variable pool resolution
//! - the [`Repository`](persistence::Repository) port with in-memory and
//!   SQLite backends
//! - the [`Dispatcher`](dispatcher::Dispatcher) port with a mock worker fleet
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         skein-master                         │
//! │   commands ─► engine per workflow instance ─► failover       │
//! └──────────────────────────────────────────────────────────────┘
//!          │ Repository                         │ Dispatcher
//!          ▼                                    ▼
//! ┌──────────────────────┐           ┌──────────────────────────┐
//! │  SQLite / in-memory  │           │  worker fleet (callbacks │
//! │  (this crate)        │           │  via TaskStateChange)    │
//! └──────────────────────┘           └──────────────────────────┘
//! ```
//!
//! # Task attempts
//!
//! Every attempt of a task is its own [`TaskInstance`](model::TaskInstance).
//! A retry, a failover re-execution or a recover creates a new attempt and
//! marks the previous one HISTORICAL, so per workflow instance and task code
//! exactly one attempt carries flag ACTIVE.

#![warn(missing_docs)]

pub mod dag;
pub mod dispatcher;
pub mod error;
pub mod migrations;
#[allow(missing_docs)]
pub mod model;
pub mod params;
pub mod persistence;

pub use error::{CoreError, Result};
