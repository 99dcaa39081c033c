//! Pipeline manifest parsing.
//!
//! ```kdl
//! builder track="dev" os="linux"
//! version major=1 minor=2 patch="{{auto}}" label="{{branch}}" {
//!     release-branches "main"
//! }
//! stage "build" {
//!     image "golang:1.22"
//! }
//! release "production" {
//!     actions "deploy" "rollback"
//!     stage "deploy" {
//!         image "extensions/gke:stable"
//!     }
//! }
//! trigger {
//!     pipeline name="github.com/acme/lib" event="finished" status="succeeded"
//!     then branch="main"
//! }
//! ```

use crate::nodes::*;
use crate::{ConfigError, ConfigResult};
use convoy_core::manifest::{
    BuilderSettings, Manifest, ManifestStage, ReleaseTarget, VersionTemplate,
};
use convoy_core::trigger::{
    CronTrigger, GitTrigger, ManifestTrigger, PipelineTrigger, PubSubTrigger, ReleaseTrigger,
    TriggerAction, TriggerEvent, TriggerFilter,
};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashSet;

/// Parse a pipeline manifest from KDL text.
pub fn parse_manifest(kdl: &str) -> ConfigResult<Manifest> {
    let doc: KdlDocument = kdl.parse()?;

    let mut manifest = Manifest::default();

    for node in doc.nodes() {
        match node.name().value() {
            "builder" => {
                manifest.builder = parse_builder(node);
            }
            "version" => {
                manifest.version = parse_version(node)?;
            }
            "labels" => {
                manifest.labels = get_string_map(node.children());
            }
            "stage" => {
                manifest.stages.push(parse_stage(node)?);
            }
            "release" => {
                manifest.release_targets.push(parse_release_target(node)?);
            }
            "trigger" => {
                manifest.triggers.push(parse_trigger(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if manifest.stages.is_empty() {
        return Err(ConfigError::MissingField("at least one stage".to_string()));
    }

    check_unique("stage", manifest.stages.iter().map(|s| s.name.as_str()))?;
    check_unique(
        "release",
        manifest.release_targets.iter().map(|t| t.name.as_str()),
    )?;
    for target in &manifest.release_targets {
        check_unique("stage", target.stages.iter().map(|s| s.name.as_str()))?;
    }

    Ok(manifest)
}

fn parse_builder(node: &KdlNode) -> BuilderSettings {
    let defaults = BuilderSettings::default();
    BuilderSettings {
        track: get_string_prop(node, "track").unwrap_or(defaults.track),
        os: get_string_prop(node, "os").unwrap_or(defaults.os),
    }
}

fn parse_version(node: &KdlNode) -> ConfigResult<VersionTemplate> {
    let defaults = VersionTemplate::default();

    let major = non_negative(node, "major")?.unwrap_or(defaults.major);
    let minor = non_negative(node, "minor")?.unwrap_or(defaults.minor);
    let patch = get_string_prop(node, "patch").unwrap_or(defaults.patch);
    if patch.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "version patch".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    let label = get_string_prop(node, "label").unwrap_or(defaults.label);
    let release_branches = match get_string_list_prop(node, "release-branches") {
        branches if branches.is_empty() => defaults.release_branches,
        branches => branches,
    };

    Ok(VersionTemplate {
        major,
        minor,
        patch,
        label,
        release_branches,
    })
}

fn non_negative(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match get_integer_prop(node, name) {
        None => Ok(None),
        Some(value) => u64::try_from(value)
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: format!("version {name}"),
                message: format!("must be a non-negative integer, got {value}"),
            }),
    }
}

fn parse_stage(node: &KdlNode) -> ConfigResult<ManifestStage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut image = get_string_prop(node, "image").unwrap_or_default();
    let mut credentials = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child).unwrap_or_default();
                }
                "credentials" => {
                    credentials.extend(get_all_string_args(child));
                }
                _ => {}
            }
        }
    }

    if image.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "image for stage '{}'",
            name
        )));
    }

    Ok(ManifestStage {
        name,
        image,
        credentials,
    })
}

fn parse_release_target(node: &KdlNode) -> ConfigResult<ReleaseTarget> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("release name".to_string()))?;

    let mut target = ReleaseTarget {
        name,
        actions: Vec::new(),
        stages: Vec::new(),
        triggers: Vec::new(),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "actions" => target.actions.extend(get_all_string_args(child)),
                "stage" => target.stages.push(parse_stage(child)?),
                "trigger" => target.triggers.push(parse_trigger(child)?),
                _ => {}
            }
        }
    }

    if target.stages.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "stages for release '{}'",
            target.name
        )));
    }

    check_unique("action", target.actions.iter().map(|a| a.as_str()))?;

    // A release trigger must name one of the target's actions when it has any
    for trigger in &target.triggers {
        if let Some(action) = &trigger.then.action {
            if !target.actions.is_empty() && !target.actions.contains(action) {
                return Err(ConfigError::InvalidValue {
                    field: format!("trigger action for release '{}'", target.name),
                    message: format!("unknown action '{action}'"),
                });
            }
        }
    }

    Ok(target)
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<ManifestTrigger> {
    let children = node
        .children()
        .ok_or_else(|| ConfigError::MissingField("trigger body".to_string()))?;

    let mut filter = None;
    let mut then = TriggerAction::default();

    for child in children.nodes() {
        let parsed = match child.name().value() {
            "pipeline" => TriggerFilter::Pipeline(PipelineTrigger {
                event: parse_event(child)?,
                name: required_prop(child, "name", "pipeline trigger name")?,
                status: get_string_prop(child, "status"),
                branch: get_string_prop(child, "branch"),
            }),
            "release" => TriggerFilter::Release(ReleaseTrigger {
                event: parse_event(child)?,
                name: required_prop(child, "name", "release trigger name")?,
                target: get_string_prop(child, "target"),
                status: get_string_prop(child, "status"),
            }),
            "cron" => {
                let schedule = required_prop(child, "schedule", "cron schedule")?;
                CronTrigger::parse_schedule(&schedule)
                    .map_err(|e| ConfigError::InvalidValue {
                        field: "cron schedule".to_string(),
                        message: e.to_string(),
                    })?;
                TriggerFilter::Cron(CronTrigger { schedule })
            }
            "git" => TriggerFilter::Git(GitTrigger {
                event: get_string_prop(child, "event").unwrap_or_else(|| "push".to_string()),
                repository: required_prop(child, "repository", "git trigger repository")?,
                branch: get_string_prop(child, "branch"),
            }),
            "pubsub" => TriggerFilter::Pubsub(PubSubTrigger {
                project: required_prop(child, "project", "pubsub project")?,
                topic: required_prop(child, "topic", "pubsub topic")?,
            }),
            "then" => {
                then = TriggerAction {
                    branch: get_string_prop(child, "branch"),
                    action: get_string_prop(child, "action"),
                };
                continue;
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "trigger type".to_string(),
                    message: format!("unknown trigger type: {}", other),
                });
            }
        };

        if filter.replace(parsed).is_some() {
            return Err(ConfigError::Duplicate("trigger filter".to_string()));
        }
    }

    let filter = filter.ok_or_else(|| ConfigError::MissingField("trigger filter".to_string()))?;
    Ok(ManifestTrigger { filter, then })
}

fn parse_event(node: &KdlNode) -> ConfigResult<TriggerEvent> {
    match get_string_prop(node, "event").as_deref() {
        Some("started") => Ok(TriggerEvent::Started),
        Some("finished") | None => Ok(TriggerEvent::Finished),
        Some(other) => Err(ConfigError::InvalidValue {
            field: "trigger event".to_string(),
            message: format!("expected started or finished, got {other}"),
        }),
    }
}

fn required_prop(node: &KdlNode, name: &str, what: &str) -> ConfigResult<String> {
    get_string_prop(node, name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingField(what.to_string()))
}

fn check_unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate(format!("{what} '{name}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_manifest() {
        let kdl = r#"
            stage "build" {
                image "golang:1.22"
            }
        "#;

        let manifest = parse_manifest(kdl).unwrap();
        assert_eq!(manifest.builder.track, "stable");
        assert_eq!(manifest.builder.os, "linux");
        assert_eq!(manifest.version, VersionTemplate::default());
        assert_eq!(manifest.stages.len(), 1);
        assert_eq!(manifest.stages[0].image, "golang:1.22");
    }

    #[test]
    fn test_parse_full_manifest() {
        let kdl = r#"
            builder track="dev" os="windows"
            version major=1 minor=3 {
                release-branches "main" "release"
            }
            labels {
                team "platform"
                language "golang"
            }
            stage "build" {
                image "golang:1.22"
                credentials "github-api-token"
            }
            release "production" {
                actions "deploy" "rollback"
                stage "deploy" {
                    image "extensions/gke:stable"
                }
                trigger {
                    pipeline name="github.com/acme/app" event="finished" status="succeeded" branch="main"
                    then action="deploy"
                }
            }
            trigger {
                cron schedule="0 2 * * *"
                then branch="main"
            }
        "#;

        let manifest = parse_manifest(kdl).unwrap();
        assert_eq!(manifest.builder.track, "dev");
        assert_eq!(manifest.builder.os, "windows");
        assert_eq!(manifest.version.major, 1);
        assert_eq!(manifest.version.minor, 3);
        assert_eq!(manifest.version.release_branches, vec!["main", "release"]);
        assert_eq!(manifest.labels.get("team").map(String::as_str), Some("platform"));
        assert_eq!(manifest.stages[0].credentials, vec!["github-api-token"]);

        let target = &manifest.release_targets[0];
        assert_eq!(target.name, "production");
        assert_eq!(target.actions, vec!["deploy", "rollback"]);
        assert_eq!(target.triggers[0].then.action.as_deref(), Some("deploy"));
        assert!(matches!(
            &target.triggers[0].filter,
            TriggerFilter::Pipeline(p) if p.status.as_deref() == Some("succeeded")
        ));

        assert!(matches!(&manifest.triggers[0].filter, TriggerFilter::Cron(c) if c.schedule == "0 2 * * *"));
        assert_eq!(manifest.triggers[0].then.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_missing_stage_image() {
        let kdl = r#"
            stage "build" {
                credentials "x"
            }
        "#;
        assert!(matches!(
            parse_manifest(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_no_stages() {
        let kdl = r#"builder track="dev""#;
        assert!(parse_manifest(kdl).is_err());
    }

    #[test]
    fn test_duplicate_stage() {
        let kdl = r#"
            stage "build" {
                image "alpine"
            }
            stage "build" {
                image "alpine"
            }
        "#;
        assert!(matches!(
            parse_manifest(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_unknown_trigger_type() {
        let kdl = r#"
            stage "build" {
                image "alpine"
            }
            trigger {
                webhook url="https://example.com"
            }
        "#;
        assert!(matches!(
            parse_manifest(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_invalid_cron_schedule() {
        let kdl = r#"
            stage "build" {
                image "alpine"
            }
            trigger {
                cron schedule="every day"
            }
        "#;
        assert!(parse_manifest(kdl).is_err());
    }

    #[test]
    fn test_release_trigger_with_unknown_action() {
        let kdl = r#"
            stage "build" {
                image "alpine"
            }
            release "production" {
                actions "deploy"
                stage "deploy" {
                    image "alpine"
                }
                trigger {
                    pipeline name="github.com/acme/app"
                    then action="destroy"
                }
            }
        "#;
        assert!(parse_manifest(kdl).is_err());
    }

    #[test]
    fn test_unparseable_kdl() {
        assert!(matches!(
            parse_manifest("stage \"build\" {").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }
}
