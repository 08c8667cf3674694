// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command records consumed by the trigger layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::VarPool;
use super::schedule::{fire_times_limited, parse_cron};
use crate::error::CoreError;

/// Provenance of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Start,
    Schedule,
    Backfill,
    Recover,
    RepeatRun,
    Failover,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Schedule => "SCHEDULE",
            Self::Backfill => "BACKFILL",
            Self::Recover => "RECOVER",
            Self::RepeatRun => "REPEAT_RUN",
            Self::Failover => "FAILOVER",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Start,
            Self::Schedule,
            Self::Backfill,
            Self::Recover,
            Self::RepeatRun,
            Self::Failover,
        ]
        .into_iter()
        .find(|c| c.as_str() == s)
        .ok_or_else(|| CoreError::ValidationError {
            field: "command_type".to_string(),
            message: format!("unknown command type '{}'", s),
        })
    }
}

/// Parameters of a manual run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Override global parameters of the same name for this run.
    #[serde(default)]
    pub params: VarPool,
    /// Restrict execution to these task codes and their descendants.
    #[serde(default)]
    pub start_nodes: Vec<i64>,
}

/// Which schedule times a backfill covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackfillTimes {
    /// Explicit list of schedule times.
    List { times: Vec<DateTime<Utc>> },
    /// Every fire time of `crontab` within `[start, end]`.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        crontab: String,
    },
}

/// Most instances one backfill may create.
pub const MAX_BACKFILL_RUNS: usize = 1000;

/// Parameters of a backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillParams {
    pub times: BackfillTimes,
    #[serde(default)]
    pub run: RunParams,
}

impl BackfillParams {
    /// Schedule times to run, ascending and without duplicates.
    ///
    /// Fails with a validation error above [`MAX_BACKFILL_RUNS`] times.
    pub fn schedule_times(&self) -> Result<Vec<DateTime<Utc>>, CoreError> {
        let mut times = match &self.times {
            BackfillTimes::List { times } => times.clone(),
            BackfillTimes::Range {
                start,
                end,
                crontab,
            } => fire_times_limited(&parse_cron(crontab)?, *start, *end, MAX_BACKFILL_RUNS + 1)?,
        };
        times.sort();
        times.dedup();
        if times.len() > MAX_BACKFILL_RUNS {
            return Err(CoreError::ValidationError {
                field: "times".to_string(),
                message: format!("backfill covers more than {} schedule times", MAX_BACKFILL_RUNS),
            });
        }
        Ok(times)
    }
}

/// A transient request for the trigger layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Start {
        definition_code: i64,
        definition_version: i32,
        #[serde(default)]
        run: RunParams,
    },
    Schedule {
        schedule_id: i64,
        fire_time: DateTime<Utc>,
    },
    Backfill {
        definition_code: i64,
        definition_version: i32,
        params: BackfillParams,
    },
    RepeatRun {
        instance_id: i64,
    },
    Pause {
        instance_id: i64,
    },
    Stop {
        instance_id: i64,
    },
    RecoverSuspended {
        instance_id: i64,
    },
}
