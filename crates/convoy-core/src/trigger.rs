//! Trigger definitions declared in manifests and their filter predicates.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use cron::Schedule;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::build::{Build, Release};
use crate::{Error, Result};

/// Event a pipeline or release trigger listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    Started,
    Finished,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Started => "started",
            TriggerEvent::Finished => "finished",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Pipeline,
    Release,
    Cron,
    Git,
    PubSub,
}

/// A trigger declared in a manifest: what to listen for and what to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestTrigger {
    #[serde(flatten)]
    pub filter: TriggerFilter,
    #[serde(default)]
    pub then: TriggerAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerFilter {
    Pipeline(PipelineTrigger),
    Release(ReleaseTrigger),
    Cron(CronTrigger),
    Git(GitTrigger),
    Pubsub(PubSubTrigger),
}

impl TriggerFilter {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerFilter::Pipeline(_) => TriggerKind::Pipeline,
            TriggerFilter::Release(_) => TriggerKind::Release,
            TriggerFilter::Cron(_) => TriggerKind::Cron,
            TriggerFilter::Git(_) => TriggerKind::Git,
            TriggerFilter::Pubsub(_) => TriggerKind::PubSub,
        }
    }
}

/// What a firing trigger starts.
///
/// Pipeline-level triggers start a build on `branch`; triggers declared on a
/// release target start a release of that target with `action`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTrigger {
    pub event: TriggerEvent,
    /// Full pipeline name, `source/owner/name`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl PipelineTrigger {
    pub fn fires(&self, build: &Build, event: TriggerEvent) -> bool {
        self.event == event
            && self.name == build.identity.full_name()
            && status_matches(self.status.as_deref(), build.status.as_str(), event)
            && branch_matches(self.branch.as_deref(), &build.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseTrigger {
    pub event: TriggerEvent,
    pub name: String,
    /// Release target name; any target when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ReleaseTrigger {
    pub fn fires(&self, release: &Release, event: TriggerEvent) -> bool {
        self.event == event
            && self.name == release.identity.full_name()
            && self.target.as_deref().is_none_or(|t| t == release.name)
            && status_matches(self.status.as_deref(), release.status.as_str(), event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronTrigger {
    pub schedule: String,
}

impl CronTrigger {
    /// Parse a five-field schedule (`minute hour day-of-month month day-of-week`).
    ///
    /// Weekdays are numbered 1-7 from Sunday; names (`Mon-Fri`) are accepted too.
    pub fn parse_schedule(expr: &str) -> Result<Schedule> {
        let expr = expr.trim();
        if expr.split_whitespace().count() != 5 {
            return Err(Error::InvalidInput(format!(
                "cron schedule must have 5 fields: {expr}"
            )));
        }
        Schedule::from_str(&format!("0 {expr}"))
            .map_err(|e| Error::InvalidInput(format!("invalid cron schedule '{expr}': {e}")))
    }

    /// Whether the schedule fires within the minute containing `at`.
    /// Unparseable schedules never fire.
    pub fn fires(&self, at: DateTime<Utc>) -> bool {
        let (Ok(schedule), Ok(minute)) = (
            Self::parse_schedule(&self.schedule),
            at.duration_trunc(TimeDelta::minutes(1)),
        ) else {
            return false;
        };
        schedule
            .after(&(minute - TimeDelta::seconds(1)))
            .next()
            .is_some_and(|next| next < minute + TimeDelta::minutes(1))
    }
}

/// A push (or other git event) observed on some repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitEvent {
    pub event: String,
    /// Full repository name, `source/owner/name`.
    pub repository: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitTrigger {
    pub event: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl GitTrigger {
    pub fn fires(&self, event: &GitEvent) -> bool {
        self.event == event.event
            && self.repository == event.repository
            && branch_matches(self.branch.as_deref(), &event.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubEvent {
    pub project: String,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubTrigger {
    pub project: String,
    pub topic: String,
}

impl PubSubTrigger {
    pub fn fires(&self, event: &PubSubEvent) -> bool {
        self.project == event.project && self.topic == event.topic
    }
}

// A status filter only applies to finished events; nothing has a final status when it starts.
fn status_matches(expected: Option<&str>, actual: &str, event: TriggerEvent) -> bool {
    match (expected, event) {
        (Some(expected), TriggerEvent::Finished) if !expected.is_empty() => expected == actual,
        _ => true,
    }
}

/// Branch filters are anchored regular expressions; an invalid pattern
/// only matches itself literally.
fn branch_matches(pattern: Option<&str>, branch: &str) -> bool {
    let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
        return true;
    };
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(branch),
        Err(_) => pattern == branch,
    }
}
