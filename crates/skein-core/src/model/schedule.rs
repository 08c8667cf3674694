// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron schedules and master node leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::VarPool;
use crate::error::CoreError;

/// Accepts 5-field (minute precision) or 6-field (seconds) crontab
/// expressions and returns the 6-field form.
pub fn normalize_cron(expr: &str) -> Result<String, CoreError> {
    let trimmed = expr.trim();
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {}", trimmed)),
        6 => Ok(trimmed.to_string()),
        n => Err(CoreError::ValidationError {
            field: "crontab".to_string(),
            message: format!("expected 5 or 6 fields, got {} in '{}'", n, trimmed),
        }),
    }
}

/// Parse a crontab expression.
pub fn parse_cron(expr: &str) -> Result<croner::Cron, CoreError> {
    let normalized = normalize_cron(expr)?;
    normalized
        .parse::<croner::Cron>()
        .map_err(|e| CoreError::ValidationError {
            field: "crontab".to_string(),
            message: format!("invalid cron expression '{}': {}", expr, e),
        })
}

/// Most fire times a schedule catches up on in one tick. A schedule further
/// behind, or firing for the first time, only fires its latest due time.
pub const MAX_CATCH_UP: usize = 10;

/// Fire times of `expr` within `[start, end]`, ascending.
pub fn fire_times_between(
    expr: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, CoreError> {
    fire_times_limited(&parse_cron(expr)?, start, end, usize::MAX)
}

/// At most `limit` fire times of `cron` within `[start, end]`, ascending.
pub(crate) fn fire_times_limited(
    cron: &croner::Cron,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<DateTime<Utc>>, CoreError> {
    if end < start {
        return Ok(Vec::new());
    }
    // iter_after is exclusive, step back one second so `start` itself can match.
    let from = start - chrono::Duration::seconds(1);
    Ok(cron
        .iter_after(from)
        .skip_while(|t| *t < start)
        .take_while(|t| *t <= end)
        .take(limit)
        .collect())
}

/// A released (or offline) cron trigger for a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub definition_code: i64,
    pub definition_version: i32,
    pub crontab: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Only released schedules fire.
    pub released: bool,
    /// Command parameters passed to every fired instance.
    pub params: VarPool,
    /// Last fire time handled; the scheduler never fires at or before it.
    pub last_fire_time: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Fire times due in `(last_fire_time, now]`, clipped to the validity window.
    ///
    /// Misfires collapse: on the first tick of a schedule, or when more than
    /// [`MAX_CATCH_UP`] times are due, only the latest due time is returned.
    pub fn due_fire_times(&self, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, CoreError> {
        if !self.released {
            return Ok(Vec::new());
        }
        let cron = parse_cron(&self.crontab)?;
        let window_end = now.min(self.end_time);
        let window_start = match self.last_fire_time {
            Some(last) => (last + chrono::Duration::seconds(1)).max(self.start_time),
            None => self.start_time,
        };

        let due = fire_times_limited(&cron, window_start, window_end, MAX_CATCH_UP + 1)?;
        if due.is_empty() || (self.last_fire_time.is_some() && due.len() <= MAX_CATCH_UP) {
            return Ok(due);
        }

        let latest = cron
            .find_previous_occurrence(&window_end, true)
            .map_err(|e| CoreError::ValidationError {
                field: "crontab".to_string(),
                message: format!("no fire time before {} for '{}': {}", window_end, self.crontab, e),
            })?;
        Ok(vec![latest])
    }
}

/// Ownership lease of a master node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLease {
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeLease {
    /// Whether the node missed its lease at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}
