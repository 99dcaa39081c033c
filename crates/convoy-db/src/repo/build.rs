//! Build and release repository.

use async_trait::async_trait;
use convoy_core::trigger::{GitEvent, PubSubEvent, TriggerEvent};
use convoy_core::{
    Build, BuildLog, JobResources, Pipeline, PipelineIdentity, Release, ResourceUtilization, Status,
};
use serde_json::{Value, json};
use sqlx::PgPool;
use sqlx::types::Json;

use super::rows::{BuildLogRow, BuildRow, PipelineRow, ReleaseRow};
use crate::{DbError, DbResult};

/// Persistence consumed by the build/release service and trigger engine.
#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Atomically increment and return the pipeline's counter.
    async fn get_auto_increment(&self, identity: &PipelineIdentity) -> DbResult<i64>;

    /// Insert a build and make it the pipeline's latest build.
    async fn insert_build(&self, build: &Build, resources: &JobResources) -> DbResult<Build>;
    async fn insert_release(&self, release: &Release, resources: &JobResources) -> DbResult<Release>;

    async fn update_build_status(&self, identity: &PipelineIdentity, id: i64, status: Status) -> DbResult<()>;
    async fn update_release_status(&self, identity: &PipelineIdentity, id: i64, status: Status) -> DbResult<()>;

    async fn update_build_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: &ResourceUtilization,
    ) -> DbResult<()>;
    async fn update_release_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: &ResourceUtilization,
    ) -> DbResult<()>;

    async fn get_pipeline(&self, identity: &PipelineIdentity) -> DbResult<Pipeline>;

    /// Pipelines declaring a `pipeline` trigger on `build`'s pipeline for `event`.
    async fn get_pipeline_triggers(&self, build: &Build, event: TriggerEvent) -> DbResult<Vec<Pipeline>>;
    /// Pipelines declaring a `release` trigger on `release`'s pipeline for `event`.
    async fn get_release_triggers(&self, release: &Release, event: TriggerEvent) -> DbResult<Vec<Pipeline>>;
    async fn get_cron_triggers(&self) -> DbResult<Vec<Pipeline>>;
    async fn get_git_triggers(&self, event: &GitEvent) -> DbResult<Vec<Pipeline>>;
    async fn get_pubsub_triggers(&self, event: &PubSubEvent) -> DbResult<Vec<Pipeline>>;

    async fn get_last_pipeline_build_for_branch(
        &self,
        identity: &PipelineIdentity,
        branch: &str,
    ) -> DbResult<Option<Build>>;
    async fn get_build_by_id(&self, identity: &PipelineIdentity, id: i64) -> DbResult<Build>;
    async fn get_build_by_version(&self, identity: &PipelineIdentity, version: &str) -> DbResult<Option<Build>>;
    async fn get_release_by_id(&self, identity: &PipelineIdentity, id: i64) -> DbResult<Release>;

    /// Peak utilisation over the pipeline's most recent `lookback` builds,
    /// `None` without any recorded history.
    async fn get_pipeline_max_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        lookback: i64,
    ) -> DbResult<Option<ResourceUtilization>>;

    async fn insert_build_log(&self, log: &BuildLog) -> DbResult<BuildLog>;
}

/// Containment filters matching a trigger declared either on the pipeline
/// itself or on one of its release targets.
fn trigger_filters(kind: &str, filter: Value) -> (Value, Value) {
    let trigger = json!([{ kind: filter }]);
    let on_target = json!([{ "triggers": trigger.clone() }]);
    (trigger, on_target)
}

const TRIGGER_QUERY: &str = r#"
    SELECT source, owner, name, build_id, build_version, build_status, branch, revision,
           manifest, triggers, release_targets
    FROM pipelines
    WHERE build_id > 0 AND (triggers @> $1 OR release_targets @> $2)
    ORDER BY source, owner, name
"#;

const BUILD_COLUMNS: &str = "id, source, owner, name, branch, revision, version, status, labels, \
     release_targets, manifest, triggers, commits, triggered_by, inserted_at";

const RELEASE_COLUMNS: &str =
    "id, source, owner, name, release, release_action, version, status, triggered_by, inserted_at";

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn pipelines_with_trigger(&self, kind: &str, filter: Value) -> DbResult<Vec<Pipeline>> {
        let (on_pipeline, on_target) = trigger_filters(kind, filter);
        let rows = sqlx::query_as::<_, PipelineRow>(TRIGGER_QUERY)
            .bind(Json(on_pipeline))
            .bind(Json(on_target))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Pipeline::try_from).collect()
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn get_auto_increment(&self, identity: &PipelineIdentity) -> DbResult<i64> {
        let (value,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO pipelines (source, owner, name, auto_increment)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (source, owner, name)
            DO UPDATE SET auto_increment = pipelines.auto_increment + 1, updated_at = NOW()
            RETURNING auto_increment
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn insert_build(&self, build: &Build, resources: &JobResources) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            INSERT INTO builds (source, owner, name, branch, revision, version, status, labels,
                                release_targets, manifest, triggers, commits, triggered_by,
                                cpu_request, cpu_limit, memory_request, memory_limit)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {BUILD_COLUMNS}
            "#
        ))
        .bind(&build.identity.source)
        .bind(&build.identity.owner)
        .bind(&build.identity.name)
        .bind(&build.branch)
        .bind(&build.revision)
        .bind(&build.version)
        .bind(build.status.as_str())
        .bind(Json(&build.labels))
        .bind(Json(&build.release_targets))
        .bind(&build.manifest)
        .bind(Json(&build.triggers))
        .bind(Json(&build.commits))
        .bind(&build.triggered_by)
        .bind(resources.cpu_request)
        .bind(resources.cpu_limit)
        .bind(resources.memory_request)
        .bind(resources.memory_limit)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO pipelines (source, owner, name, build_id, build_version, build_status,
                                   branch, revision, manifest, triggers, release_targets)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (source, owner, name)
            DO UPDATE SET build_id = EXCLUDED.build_id,
                          build_version = EXCLUDED.build_version,
                          build_status = EXCLUDED.build_status,
                          branch = EXCLUDED.branch,
                          revision = EXCLUDED.revision,
                          manifest = EXCLUDED.manifest,
                          triggers = EXCLUDED.triggers,
                          release_targets = EXCLUDED.release_targets,
                          updated_at = NOW()
            "#,
        )
        .bind(&row.source)
        .bind(&row.owner)
        .bind(&row.name)
        .bind(row.id)
        .bind(row.version.clone().unwrap_or_default())
        .bind(&row.status)
        .bind(&row.branch)
        .bind(&row.revision)
        .bind(&row.manifest)
        .bind(Json(&row.triggers.0))
        .bind(Json(&row.release_targets.0))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Build::try_from(row)
    }

    async fn insert_release(&self, release: &Release, resources: &JobResources) -> DbResult<Release> {
        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            r#"
            INSERT INTO releases (source, owner, name, release, release_action, version, status,
                                  triggered_by, cpu_request, cpu_limit, memory_request, memory_limit)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {RELEASE_COLUMNS}
            "#
        ))
        .bind(&release.identity.source)
        .bind(&release.identity.owner)
        .bind(&release.identity.name)
        .bind(&release.name)
        .bind(&release.action)
        .bind(&release.version)
        .bind(release.status.as_str())
        .bind(&release.triggered_by)
        .bind(resources.cpu_request)
        .bind(resources.cpu_limit)
        .bind(resources.memory_request)
        .bind(resources.memory_limit)
        .fetch_one(&self.pool)
        .await?;
        Release::try_from(row)
    }

    async fn update_build_status(&self, identity: &PipelineIdentity, id: i64, status: Status) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE builds SET status = $5, updated_at = NOW()
            WHERE source = $1 AND owner = $2 AND name = $3 AND id = $4
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {id} of {identity}")));
        }

        sqlx::query(
            r#"
            UPDATE pipelines SET build_status = $5, updated_at = NOW()
            WHERE source = $1 AND owner = $2 AND name = $3 AND build_id = $4
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_release_status(&self, identity: &PipelineIdentity, id: i64, status: Status) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE releases SET status = $5, updated_at = NOW()
            WHERE source = $1 AND owner = $2 AND name = $3 AND id = $4
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("release {id} of {identity}")));
        }
        Ok(())
    }

    async fn update_build_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: &ResourceUtilization,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE builds SET cpu_max_usage = $5, memory_max_usage = $6, updated_at = NOW()
            WHERE source = $1 AND owner = $2 AND name = $3 AND id = $4
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(id)
        .bind(utilization.cpu_max_usage)
        .bind(utilization.memory_max_usage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_release_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        id: i64,
        utilization: &ResourceUtilization,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE releases SET cpu_max_usage = $5, memory_max_usage = $6, updated_at = NOW()
            WHERE source = $1 AND owner = $2 AND name = $3 AND id = $4
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(id)
        .bind(utilization.cpu_max_usage)
        .bind(utilization.memory_max_usage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pipeline(&self, identity: &PipelineIdentity) -> DbResult<Pipeline> {
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT source, owner, name, build_id, build_version, build_status, branch, revision,
                   manifest, triggers, release_targets
            FROM pipelines
            WHERE source = $1 AND owner = $2 AND name = $3
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("pipeline {identity}")))?;
        Pipeline::try_from(row)
    }

    async fn get_pipeline_triggers(&self, build: &Build, event: TriggerEvent) -> DbResult<Vec<Pipeline>> {
        self.pipelines_with_trigger(
            "pipeline",
            json!({ "event": event.as_str(), "name": build.identity.full_name() }),
        )
        .await
    }

    async fn get_release_triggers(&self, release: &Release, event: TriggerEvent) -> DbResult<Vec<Pipeline>> {
        self.pipelines_with_trigger(
            "release",
            json!({ "event": event.as_str(), "name": release.identity.full_name() }),
        )
        .await
    }

    async fn get_cron_triggers(&self) -> DbResult<Vec<Pipeline>> {
        self.pipelines_with_trigger("cron", json!({})).await
    }

    async fn get_git_triggers(&self, event: &GitEvent) -> DbResult<Vec<Pipeline>> {
        self.pipelines_with_trigger(
            "git",
            json!({ "event": event.event, "repository": event.repository }),
        )
        .await
    }

    async fn get_pubsub_triggers(&self, event: &PubSubEvent) -> DbResult<Vec<Pipeline>> {
        self.pipelines_with_trigger(
            "pubsub",
            json!({ "project": event.project, "topic": event.topic }),
        )
        .await
    }

    async fn get_last_pipeline_build_for_branch(
        &self,
        identity: &PipelineIdentity,
        branch: &str,
    ) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            SELECT {BUILD_COLUMNS} FROM builds
            WHERE source = $1 AND owner = $2 AND name = $3 AND branch = $4
            ORDER BY inserted_at DESC
            LIMIT 1
            "#
        ))
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Build::try_from).transpose()
    }

    async fn get_build_by_id(&self, identity: &PipelineIdentity, id: i64) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE source = $1 AND owner = $2 AND name = $3 AND id = $4"
        ))
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {id} of {identity}")))?;
        Build::try_from(row)
    }

    async fn get_build_by_version(&self, identity: &PipelineIdentity, version: &str) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            SELECT {BUILD_COLUMNS} FROM builds
            WHERE source = $1 AND owner = $2 AND name = $3 AND version = $4
            ORDER BY inserted_at DESC
            LIMIT 1
            "#
        ))
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Build::try_from).transpose()
    }

    async fn get_release_by_id(&self, identity: &PipelineIdentity, id: i64) -> DbResult<Release> {
        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE source = $1 AND owner = $2 AND name = $3 AND id = $4"
        ))
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("release {id} of {identity}")))?;
        Release::try_from(row)
    }

    async fn get_pipeline_max_resource_utilization(
        &self,
        identity: &PipelineIdentity,
        lookback: i64,
    ) -> DbResult<Option<ResourceUtilization>> {
        let (cpu, memory): (Option<f64>, Option<f64>) = sqlx::query_as(
            r#"
            SELECT MAX(cpu_max_usage), MAX(memory_max_usage)
            FROM (
                SELECT cpu_max_usage, memory_max_usage FROM builds
                WHERE source = $1 AND owner = $2 AND name = $3
                  AND cpu_max_usage IS NOT NULL AND memory_max_usage IS NOT NULL
                ORDER BY inserted_at DESC
                LIMIT $4
            ) recent
            "#,
        )
        .bind(&identity.source)
        .bind(&identity.owner)
        .bind(&identity.name)
        .bind(lookback)
        .fetch_one(&self.pool)
        .await?;

        Ok(match (cpu, memory) {
            (Some(cpu_max_usage), Some(memory_max_usage)) => Some(ResourceUtilization {
                cpu_max_usage,
                memory_max_usage,
            }),
            _ => None,
        })
    }

    async fn insert_build_log(&self, log: &BuildLog) -> DbResult<BuildLog> {
        let row = sqlx::query_as::<_, BuildLogRow>(
            r#"
            INSERT INTO build_logs (build_id, source, owner, name, branch, revision, steps)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, build_id, source, owner, name, branch, revision, steps, inserted_at
            "#,
        )
        .bind(log.build_id)
        .bind(&log.identity.source)
        .bind(&log.identity.owner)
        .bind(&log.identity.name)
        .bind(&log.branch)
        .bind(&log.revision)
        .bind(Json(&log.steps))
        .fetch_one(&self.pool)
        .await?;
        Ok(BuildLog::from(row))
    }
}
