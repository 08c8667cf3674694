// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Skein Master - workflow control node
//!
//! Drives workflow instances through their DAG: creates task attempts,
//! dispatches them to workers, reacts to worker callbacks, and takes over the
//! instances of masters that died.
//!
//! # Architecture
//!
//! ```text
//!   triggers / control            cron scheduler          lease keeper
//!   (CommandService)              (CronScheduler)         (LeaseKeeper)
//!         │                             │                       │
//!         │ submit / control            │ schedule_trigger      │ GlobalMasterFailover
//!         ▼                             ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         EventBus + RuntimeRegistry                       │
//! │     instance id ─► engine queue        task instance id ─► instance id   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!         │                    ▲                                │
//!         ▼                    │ callbacks                      ▼
//! ┌──────────────────┐   ┌─────┴──────────┐           ┌──────────────────────┐
//! │  WorkflowEngine  │──►│   Dispatcher   │           │ FailoverCoordinator  │
//! │  (one per inst.) │   │ (worker fleet) │           │ claim + reconcile    │
//! └──────────────────┘   └────────────────┘           └──────────────────────┘
//!         │                                                     │
//!         ▼                                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Repository (SQLite / memory)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Workflow Instance State Machine
//!
//! ```text
//!   SUBMITTED ──start──► RUNNING_EXECUTION ──► SUCCESS | FAILURE
//!                          │        ▲    │
//!                     pause│ recover│    │stop
//!                          ▼        │    ▼
//!                     READY_PAUSE ─► PAUSE   READY_STOP ──► STOP
//! ```
//!
//! SUCCESS, FAILURE and STOP are terminal; a repeat run takes a terminal
//! instance back to RUNNING_EXECUTION.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SKEIN_DATABASE_URL` | Yes | - | SQLite path or `sqlite:` URL |
//! | `SKEIN_NODE_ID` | No | `master-<uuid>` | Identity in ownership and leases |
//! | `SKEIN_EXEC_THREADS` | No | `100` | Instances processing events at once |
//! | `SKEIN_HEARTBEAT_INTERVAL_SECS` | No | `10` | Lease renewal interval |
//! | `SKEIN_LEASE_TIMEOUT_SECS` | No | `60` | Lease expiry |
//! | `SKEIN_DISPATCH_TIMEOUT_SECS` | No | `30` | Dispatch call timeout |
//! | `SKEIN_KILL_TIMEOUT_SECS` | No | `30` | Kill acknowledgement timeout |
//! | `SKEIN_PERSIST_RETRY_ATTEMPTS` | No | `5` | State write attempts |
//! | `SKEIN_SCHEDULER_POLL_SECS` | No | `5` | Cron poll interval |

/// Trigger and control commands.
pub mod commands;

/// Configuration loaded from environment variables.
pub mod config;

/// DAG execution engine.
pub mod engine;

/// Error types for master operations.
pub mod error;

/// System event bus.
pub mod event;

/// Failover of dead masters' instances.
pub mod failover;

/// Master lease heartbeat and dead-node detection.
pub mod lease;

/// Instance id to engine map.
pub mod registry;

/// Embeddable runtime.
pub mod runtime;

/// Cron schedule polling.
pub mod scheduler;

pub use commands::{AckOutcome, CommandAck, CommandService};
pub use error::{Error, Result};
pub use event::{EventBus, SystemEvent};
pub use runtime::MasterRuntime;
