// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed repository.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};

use super::Repository;
use crate::error::CoreError;
use crate::migrations;
use crate::model::{
    CommandType, NodeLease, ParentLink, Schedule, TaskExecutionStatus, TaskFlag, TaskInstance,
    WorkflowDefinition, WorkflowExecutionStatus, WorkflowInstance,
};

/// SQLite-backed repository.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Wrap an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path` and run migrations.
    ///
    /// ```ignore
    /// let repo = SqliteRepository::from_path(".data/skein.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Open a `sqlite:` URL, or treat anything else as a file path.
    pub async fn from_url(url: &str) -> Result<Self, CoreError> {
        if url.starts_with("sqlite:") {
            Self::connect(url).await
        } else {
            Self::from_path(url).await
        }
    }

    async fn connect(url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL {}: {}", url, e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Error for a fenced write of `instance_id` that matched no row.
    async fn not_owned(&self, instance_id: i64) -> CoreError {
        let host: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT host FROM workflow_instances WHERE id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await;
        match host {
            Ok(Some(owner)) => CoreError::NotLocallyOwned { instance_id, owner },
            Ok(None) => CoreError::InstanceNotFound { instance_id },
            Err(e) => e.into(),
        }
    }

    /// Error for a fenced write of task `task_instance_id` that matched no row.
    async fn task_not_owned(&self, task_instance_id: i64) -> CoreError {
        let parent: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT workflow_instance_id FROM task_instances WHERE id = ?")
                .bind(task_instance_id)
                .fetch_optional(&self.pool)
                .await;
        match parent {
            Ok(Some(instance_id)) => self.not_owned(instance_id).await,
            Ok(None) => CoreError::TaskInstanceNotFound { task_instance_id },
            Err(e) => e.into(),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, CoreError> {
    Ok(serde_json::from_str(raw)?)
}

/// Serde name of a unit enum variant, e.g. `Priority::High` -> `HIGH`.
fn enum_name<T: Serialize>(value: &T) -> Result<String, CoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(CoreError::ValidationError {
            field: "enum".to_string(),
            message: format!("expected a unit variant, got {}", other),
        }),
    }
}

fn enum_from_name<T: DeserializeOwned>(name: String) -> Result<T, CoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(name))?)
}

fn row_to_instance(row: &SqliteRow) -> Result<WorkflowInstance, CoreError> {
    let parent_instance: Option<i64> = row.try_get("parent_instance_id")?;
    let parent_task: Option<i64> = row.try_get("parent_task_instance_id")?;
    let parent = match (parent_instance, parent_task) {
        (Some(workflow_instance_id), Some(task_instance_id)) => Some(ParentLink {
            workflow_instance_id,
            task_instance_id,
        }),
        _ => None,
    };
    let state: String = row.try_get("state")?;
    let command_type: String = row.try_get("command_type")?;
    let command_params: String = row.try_get("command_params")?;
    let var_pool: String = row.try_get("var_pool")?;
    let start_nodes: String = row.try_get("start_nodes")?;
    let run_times: i64 = row.try_get("run_times")?;

    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        definition_code: row.try_get("definition_code")?,
        definition_version: row.try_get("definition_version")?,
        name: row.try_get("name")?,
        state: WorkflowExecutionStatus::from_str(&state)?,
        command_type: CommandType::from_str(&command_type)?,
        command_params: from_json(&command_params)?,
        schedule_time: row.try_get("schedule_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        run_times: run_times as u32,
        host: row.try_get("host")?,
        parent,
        var_pool: from_json(&var_pool)?,
        start_nodes: from_json(&start_nodes)?,
        failure_strategy: enum_from_name(row.try_get("failure_strategy")?)?,
    })
}

fn row_to_task(row: &SqliteRow) -> Result<TaskInstance, CoreError> {
    let state: String = row.try_get("state")?;
    let flag: String = row.try_get("flag")?;
    let var_pool: String = row.try_get("var_pool")?;
    let retry_times: i64 = row.try_get("retry_times")?;

    Ok(TaskInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        task_code: row.try_get("task_code")?,
        task_version: row.try_get("task_version")?,
        workflow_instance_id: row.try_get("workflow_instance_id")?,
        task_type: row.try_get("task_type")?,
        state: TaskExecutionStatus::from_str(&state)?,
        flag: TaskFlag::from_str(&flag)?,
        retry_times: retry_times as u32,
        first_submit_time: row.try_get("first_submit_time")?,
        submit_time: row.try_get("submit_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        host: row.try_get("host")?,
        log_path: row.try_get("log_path")?,
        var_pool: from_json(&var_pool)?,
        priority: enum_from_name(row.try_get("priority")?)?,
        worker_group: row.try_get("worker_group")?,
        sub_workflow_instance_id: row.try_get("sub_workflow_instance_id")?,
    })
}

fn row_to_schedule(row: &SqliteRow) -> Result<Schedule, CoreError> {
    let params: String = row.try_get("params")?;
    Ok(Schedule {
        id: row.try_get("id")?,
        definition_code: row.try_get("definition_code")?,
        definition_version: row.try_get("definition_version")?,
        crontab: row.try_get("crontab")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        released: row.try_get("released")?,
        params: from_json(&params)?,
        last_fire_time: row.try_get("last_fire_time")?,
    })
}

const INSTANCE_COLUMNS: &str = r#"
    id, definition_code, definition_version, name, state, command_type, command_params,
    schedule_time, start_time, end_time, run_times, host, parent_instance_id,
    parent_task_instance_id, var_pool, start_nodes, failure_strategy
"#;

const TASK_COLUMNS: &str = r#"
    id, name, task_code, task_version, workflow_instance_id, task_type, state, flag,
    retry_times, first_submit_time, submit_time, start_time, end_time, host, log_path,
    var_pool, priority, worker_group, sub_workflow_instance_id
"#;

async fn insert_instance_on<'e, E>(executor: E, instance: &WorkflowInstance) -> Result<i64, CoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO workflow_instances (
            definition_code, definition_version, name, state, command_type, command_params,
            schedule_time, start_time, end_time, run_times, host, parent_instance_id,
            parent_task_instance_id, var_pool, start_nodes, failure_strategy
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(instance.definition_code)
    .bind(instance.definition_version)
    .bind(&instance.name)
    .bind(instance.state.as_str())
    .bind(instance.command_type.as_str())
    .bind(to_json(&instance.command_params)?)
    .bind(instance.schedule_time)
    .bind(instance.start_time)
    .bind(instance.end_time)
    .bind(instance.run_times as i64)
    .bind(&instance.host)
    .bind(instance.parent.map(|p| p.workflow_instance_id))
    .bind(instance.parent.map(|p| p.task_instance_id))
    .bind(to_json(&instance.var_pool)?)
    .bind(to_json(&instance.start_nodes)?)
    .bind(instance.failure_strategy.as_str())
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Fenced task update; returns the number of rows written.
async fn update_task_on<'e, E>(executor: E, task: &TaskInstance, owner: &str) -> Result<u64, CoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE task_instances
        SET state = ?, flag = ?, retry_times = ?, submit_time = ?, start_time = ?,
            end_time = ?, host = ?, log_path = ?, var_pool = ?, sub_workflow_instance_id = ?
        WHERE id = ? AND EXISTS (
            SELECT 1 FROM workflow_instances w
            WHERE w.id = task_instances.workflow_instance_id AND w.host = ?
        )
        "#,
    )
    .bind(task.state.as_str())
    .bind(task.flag.as_str())
    .bind(task.retry_times as i64)
    .bind(task.submit_time)
    .bind(task.start_time)
    .bind(task.end_time)
    .bind(&task.host)
    .bind(&task.log_path)
    .bind(to_json(&task.var_pool)?)
    .bind(task.sub_workflow_instance_id)
    .bind(task.id)
    .bind(owner)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn load_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, CoreError> {
        let row = sqlx::query("SELECT body FROM workflow_definitions WHERE code = ? AND version = ?")
            .bind(code)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(from_json(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (code, version, name, body)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (code, version) DO UPDATE SET name = excluded.name, body = excluded.body
            "#,
        )
        .bind(definition.code)
        .bind(definition.version)
        .bind(&definition.name)
        .bind(to_json(definition)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<i64, CoreError> {
        insert_instance_on(&self.pool, instance).await
    }

    async fn save_instance(&self, instance: &WorkflowInstance, owner: &str) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = ?, command_type = ?, command_params = ?, schedule_time = ?,
                start_time = ?, end_time = ?, run_times = ?, host = ?,
                parent_instance_id = ?, parent_task_instance_id = ?, var_pool = ?,
                start_nodes = ?, failure_strategy = ?
            WHERE id = ? AND host = ?
            "#,
        )
        .bind(instance.state.as_str())
        .bind(instance.command_type.as_str())
        .bind(to_json(&instance.command_params)?)
        .bind(instance.schedule_time)
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(instance.run_times as i64)
        .bind(&instance.host)
        .bind(instance.parent.map(|p| p.workflow_instance_id))
        .bind(instance.parent.map(|p| p.task_instance_id))
        .bind(to_json(&instance.var_pool)?)
        .bind(to_json(&instance.start_nodes)?)
        .bind(instance.failure_strategy.as_str())
        .bind(instance.id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_owned(instance.id).await);
        }
        Ok(())
    }

    async fn load_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, CoreError> {
        let query = format!("SELECT {} FROM workflow_instances WHERE id = ?", INSTANCE_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_instance).transpose()
    }

    async fn list_instances_by_host(&self, host: &str) -> Result<Vec<WorkflowInstance>, CoreError> {
        let query = format!(
            "SELECT {} FROM workflow_instances WHERE host = ? ORDER BY id",
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(host)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn claim_instance(
        &self,
        id: i64,
        expected_host: &str,
        new_host: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE workflow_instances SET host = ? WHERE id = ? AND host = ?")
            .bind(new_host)
            .bind(id)
            .bind(expected_host)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM workflow_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(CoreError::InstanceNotFound { instance_id: id }),
        }
    }

    async fn insert_task_instance(&self, task: &TaskInstance, owner: &str) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_instances (
                name, task_code, task_version, workflow_instance_id, task_type, state, flag,
                retry_times, first_submit_time, submit_time, start_time, end_time, host,
                log_path, var_pool, priority, worker_group, sub_workflow_instance_id
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM workflow_instances WHERE id = ? AND host = ?)
            "#,
        )
        .bind(&task.name)
        .bind(task.task_code)
        .bind(task.task_version)
        .bind(task.workflow_instance_id)
        .bind(&task.task_type)
        .bind(task.state.as_str())
        .bind(task.flag.as_str())
        .bind(task.retry_times as i64)
        .bind(task.first_submit_time)
        .bind(task.submit_time)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(&task.host)
        .bind(&task.log_path)
        .bind(to_json(&task.var_pool)?)
        .bind(enum_name(&task.priority)?)
        .bind(&task.worker_group)
        .bind(task.sub_workflow_instance_id)
        .bind(task.workflow_instance_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_owned(task.workflow_instance_id).await);
        }
        Ok(result.last_insert_rowid())
    }

    async fn save_task_instance(&self, task: &TaskInstance, owner: &str) -> Result<(), CoreError> {
        if update_task_on(&self.pool, task, owner).await? == 0 {
            return Err(self.task_not_owned(task.id).await);
        }
        Ok(())
    }

    async fn insert_sub_workflow(
        &self,
        child: &WorkflowInstance,
        parent_task: &TaskInstance,
        owner: &str,
    ) -> Result<i64, CoreError> {
        let mut tx = self.pool.begin().await?;

        // The fenced update comes first so the transaction holds the write lock
        // before the child exists.
        if update_task_on(&mut *tx, parent_task, owner).await? == 0 {
            tx.rollback().await?;
            return Err(self.task_not_owned(parent_task.id).await);
        }
        let child_id = insert_instance_on(&mut *tx, child).await?;
        sqlx::query("UPDATE task_instances SET sub_workflow_instance_id = ? WHERE id = ?")
            .bind(child_id)
            .bind(parent_task.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(child_id)
    }

    async fn load_task_instance(&self, id: i64) -> Result<Option<TaskInstance>, CoreError> {
        let query = format!("SELECT {} FROM task_instances WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, CoreError> {
        let query = format!(
            "SELECT {} FROM task_instances WHERE workflow_instance_id = ? ORDER BY id",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(workflow_instance_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn save_schedule(&self, schedule: &Schedule) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, definition_code, definition_version, crontab, start_time, end_time,
                released, params, last_fire_time
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                definition_code = excluded.definition_code,
                definition_version = excluded.definition_version,
                crontab = excluded.crontab,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                released = excluded.released,
                params = excluded.params,
                last_fire_time = excluded.last_fire_time
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.definition_code)
        .bind(schedule.definition_version)
        .bind(&schedule.crontab)
        .bind(schedule.start_time)
        .bind(schedule.end_time)
        .bind(schedule.released)
        .bind(to_json(&schedule.params)?)
        .bind(schedule.last_fire_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_schedule(&self, id: i64) -> Result<Option<Schedule>, CoreError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, CoreError> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO master_leases (node_id, started_at, last_heartbeat)
            VALUES (?, ?, ?)
            ON CONFLICT (node_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(node_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_node_leases(&self) -> Result<Vec<NodeLease>, CoreError> {
        let rows = sqlx::query("SELECT node_id, started_at, last_heartbeat FROM master_leases")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<NodeLease, CoreError> {
                Ok(NodeLease {
                    node_id: row.try_get("node_id")?,
                    started_at: row.try_get("started_at")?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                })
            })
            .collect()
    }

    async fn remove_node_lease(&self, node_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM master_leases WHERE node_id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
