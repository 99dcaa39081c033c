//! Row types and their conversion into domain types.

use chrono::{DateTime, Utc};
use convoy_core::build::LogStep;
use convoy_core::manifest::ReleaseTarget;
use convoy_core::trigger::ManifestTrigger;
use convoy_core::{Build, BuildLog, Commit, Pipeline, PipelineIdentity, Release, Status};
use sqlx::types::Json;
use std::collections::BTreeMap;

use crate::{DbError, DbResult};

fn parse_status(raw: &str) -> DbResult<Status> {
    raw.parse()
        .map_err(|_| DbError::InvalidData(format!("unknown status {raw:?}")))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PipelineRow {
    pub source: String,
    pub owner: String,
    pub name: String,
    pub build_id: i64,
    pub build_version: String,
    pub build_status: String,
    pub branch: String,
    pub revision: String,
    pub manifest: String,
    pub triggers: Json<Vec<ManifestTrigger>>,
    pub release_targets: Json<Vec<ReleaseTarget>>,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = DbError;

    fn try_from(row: PipelineRow) -> DbResult<Self> {
        Ok(Pipeline {
            identity: PipelineIdentity::new(row.source, row.owner, row.name),
            build_id: row.build_id,
            build_version: row.build_version,
            build_status: parse_status(&row.build_status)?,
            branch: row.branch,
            revision: row.revision,
            manifest: row.manifest,
            triggers: row.triggers.0,
            release_targets: row.release_targets.0,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BuildRow {
    pub id: i64,
    pub source: String,
    pub owner: String,
    pub name: String,
    pub branch: String,
    pub revision: String,
    pub version: Option<String>,
    pub status: String,
    pub labels: Json<BTreeMap<String, String>>,
    pub release_targets: Json<Vec<ReleaseTarget>>,
    pub manifest: String,
    pub triggers: Json<Vec<ManifestTrigger>>,
    pub commits: Json<Vec<Commit>>,
    pub triggered_by: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        Ok(Build {
            id: row.id,
            identity: PipelineIdentity::new(row.source, row.owner, row.name),
            branch: row.branch,
            revision: row.revision,
            version: row.version,
            status: parse_status(&row.status)?,
            labels: row.labels.0,
            release_targets: row.release_targets.0,
            manifest: row.manifest,
            triggers: row.triggers.0,
            commits: row.commits.0,
            triggered_by: row.triggered_by,
            inserted_at: Some(row.inserted_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ReleaseRow {
    pub id: i64,
    pub source: String,
    pub owner: String,
    pub name: String,
    pub release: String,
    pub release_action: Option<String>,
    pub version: String,
    pub status: String,
    pub triggered_by: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

impl TryFrom<ReleaseRow> for Release {
    type Error = DbError;

    fn try_from(row: ReleaseRow) -> DbResult<Self> {
        Ok(Release {
            id: row.id,
            identity: PipelineIdentity::new(row.source, row.owner, row.name),
            name: row.release,
            action: row.release_action,
            version: row.version,
            status: parse_status(&row.status)?,
            triggered_by: row.triggered_by,
            inserted_at: Some(row.inserted_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BuildLogRow {
    pub id: i64,
    pub build_id: i64,
    pub source: String,
    pub owner: String,
    pub name: String,
    pub branch: String,
    pub revision: String,
    pub steps: Json<Vec<LogStep>>,
    pub inserted_at: DateTime<Utc>,
}

impl From<BuildLogRow> for BuildLog {
    fn from(row: BuildLogRow) -> Self {
        BuildLog {
            id: row.id,
            build_id: row.build_id,
            identity: PipelineIdentity::new(row.source, row.owner, row.name),
            branch: row.branch,
            revision: row.revision,
            steps: row.steps.0,
            inserted_at: Some(row.inserted_at),
        }
    }
}
