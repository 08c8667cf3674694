// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron scheduler.
//!
//! Periodically polls released schedules and fires a schedule trigger for
//! every fire time that came due since the schedule last fired. The last
//! fire time is persisted after each trigger, so a restart neither skips nor
//! repeats a fire time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use skein_core::persistence::Repository;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::CommandService;
use crate::error::Result;

/// Background worker that turns cron schedules into workflow instances.
pub struct CronScheduler {
    repository: Arc<dyn Repository>,
    commands: CommandService,
    poll_interval: Duration,
}

impl CronScheduler {
    pub fn new(
        repository: Arc<dyn Repository>,
        commands: CommandService,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repository,
            commands,
            poll_interval,
        }
    }

    /// Poll until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Cron scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Cron scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.tick(Utc::now()).await {
                        Ok(0) => {}
                        Ok(fired) => debug!(fired, "Schedules fired"),
                        Err(e) => error!(error = %e, "Failed to poll schedules"),
                    }
                }
            }
        }

        info!("Cron scheduler stopped");
    }

    /// Fire everything due at `now`. Returns the number of instances created.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;

        for mut schedule in self.repository.list_schedules().await? {
            let due = match schedule.due_fire_times(now) {
                Ok(due) => due,
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "Skipping schedule with invalid crontab");
                    continue;
                }
            };

            for fire_time in due {
                match self.commands.schedule_trigger(schedule.id, fire_time).await {
                    Ok(instance_id) => {
                        fired += 1;
                        debug!(schedule_id = schedule.id, instance_id, %fire_time, "Schedule fired");
                    }
                    Err(e) => {
                        error!(schedule_id = schedule.id, %fire_time, error = %e, "Schedule trigger failed");
                        break;
                    }
                }
                schedule.last_fire_time = Some(fire_time);
                self.repository.save_schedule(&schedule).await?;
            }
        }

        Ok(fired)
    }
}
