//! Trigger dispatch.
//!
//! A pipeline declares triggers at two levels: on the pipeline itself, where
//! a firing trigger starts a new build, and on a release target, where it
//! starts a release of that target. Each firing trigger is dispatched as its
//! own unit of work on the queue.

use convoy_core::build::TRIGGERED_BY_TRIGGER;
use convoy_core::manifest::ReleaseTarget;
use convoy_core::trigger::{ManifestTrigger, TriggerFilter};
use convoy_core::{Pipeline, PipelineIdentity, Release, Status};
use tracing::{error, info, warn};

use crate::ServiceResult;
use crate::service::{BuildService, CiBuildService, rebuild_of};

impl CiBuildService {
    /// Dispatch every trigger of `pipelines` accepted by `fires`. Returns the
    /// number of dispatched actions.
    pub(crate) async fn dispatch_triggers<P>(&self, pipelines: Vec<Pipeline>, fires: P) -> usize
    where
        P: Fn(&TriggerFilter) -> bool + Send + Sync,
    {
        let mut dispatched = 0;

        for pipeline in &pipelines {
            for trigger in pipeline.triggers.iter().filter(|t| fires(&t.filter)) {
                self.dispatch_build(pipeline, trigger).await;
                dispatched += 1;
            }

            for target in &pipeline.release_targets {
                for trigger in target.triggers.iter().filter(|t| fires(&t.filter)) {
                    if self.dispatch_release(pipeline, target, trigger).await {
                        dispatched += 1;
                    }
                }
            }
        }

        dispatched
    }

    async fn dispatch_build(&self, pipeline: &Pipeline, trigger: &ManifestTrigger) {
        let identity = pipeline.identity.clone();
        let branch = trigger
            .then
            .branch
            .clone()
            .unwrap_or_else(|| pipeline.branch.clone());

        info!(pipeline = %identity, branch = %branch, "Trigger fired, starting build");

        let svc = self.clone();
        self.queue
            .submit_or_run(format!("trigger-build-{identity}-{branch}"), async move {
                if let Err(e) = svc.build_from_trigger(&identity, &branch).await {
                    error!(pipeline = %identity, branch = %branch, error = %e, "Failed to start triggered build");
                }
            })
            .await;
    }

    async fn build_from_trigger(&self, identity: &PipelineIdentity, branch: &str) -> ServiceResult<()> {
        let Some(previous) = self
            .repo
            .get_last_pipeline_build_for_branch(identity, branch)
            .await?
        else {
            warn!(pipeline = %identity, branch = %branch, "No earlier build on branch, skipping trigger");
            return Ok(());
        };

        BuildService::create_build(self, rebuild_of(previous), false).await?;
        Ok(())
    }

    /// Returns false when the trigger cannot be dispatched.
    async fn dispatch_release(&self, pipeline: &Pipeline, target: &ReleaseTarget, trigger: &ManifestTrigger) -> bool {
        let action = trigger.then.action.clone();
        if action.is_none() && !target.actions.is_empty() {
            error!(
                pipeline = %pipeline.identity,
                target = %target.name,
                "Release trigger has no action but the target requires one"
            );
            return false;
        }
        if pipeline.build_version.is_empty() {
            warn!(pipeline = %pipeline.identity, target = %target.name, "Pipeline has no version to release");
            return false;
        }

        let release = Release {
            id: 0,
            identity: pipeline.identity.clone(),
            name: target.name.clone(),
            action,
            version: pipeline.build_version.clone(),
            status: Status::Pending,
            triggered_by: Some(TRIGGERED_BY_TRIGGER.to_string()),
            inserted_at: None,
        };

        info!(
            pipeline = %release.identity,
            target = %release.name,
            version = %release.version,
            "Trigger fired, starting release"
        );

        let svc = self.clone();
        let name = format!("trigger-release-{}-{}", release.identity, release.name);
        self.queue
            .submit_or_run(name, async move {
                let identity = release.identity.clone();
                let target = release.name.clone();
                if let Err(e) = BuildService::create_release(&svc, release, false).await {
                    error!(pipeline = %identity, target = %target, error = %e, "Failed to start triggered release");
                }
            })
            .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::service::BuildService;
    use crate::testing::{MockCiBuilder, MockRepo, VALID_MANIFEST, service};
    use chrono::{TimeZone, Utc};
    use convoy_core::executor::JobType;
    use convoy_core::manifest::ReleaseTarget;
    use convoy_core::trigger::{
        CronTrigger, GitEvent, GitTrigger, ManifestTrigger, PipelineTrigger, PubSubEvent,
        PubSubTrigger, ReleaseTrigger, TriggerAction, TriggerEvent, TriggerFilter,
    };
    use convoy_core::{Build, Pipeline, PipelineIdentity, Release, Status};
    use std::sync::Arc;

    fn upstream() -> PipelineIdentity {
        PipelineIdentity::new("github.com", "acme", "lib")
    }

    fn downstream() -> PipelineIdentity {
        PipelineIdentity::new("github.com", "acme", "app")
    }

    fn on_branch(branch: &str) -> TriggerAction {
        TriggerAction {
            branch: Some(branch.to_string()),
            action: None,
        }
    }

    fn pipeline_trigger(event: TriggerEvent, status: Option<&str>, branch: Option<&str>) -> ManifestTrigger {
        ManifestTrigger {
            filter: TriggerFilter::Pipeline(PipelineTrigger {
                event,
                name: upstream().full_name(),
                status: status.map(str::to_string),
                branch: branch.map(str::to_string),
            }),
            then: on_branch("main"),
        }
    }

    fn pipeline(triggers: Vec<ManifestTrigger>, release_targets: Vec<ReleaseTarget>) -> Pipeline {
        Pipeline {
            identity: downstream(),
            build_id: 1,
            build_version: "0.0.1".to_string(),
            build_status: Status::Succeeded,
            branch: "main".to_string(),
            revision: "abc123".to_string(),
            manifest: VALID_MANIFEST.to_string(),
            triggers,
            release_targets,
        }
    }

    /// Seed the downstream pipeline with one succeeded build on main.
    fn seed(repo: &MockRepo, pipeline: Pipeline) -> Build {
        let mut build = Build::new(downstream(), "main", "abc123");
        build.manifest = VALID_MANIFEST.to_string();
        build.version = Some("0.0.1".to_string());
        build.status = Status::Succeeded;
        repo.set_counter(&downstream(), 1);
        repo.add_pipeline(pipeline);
        repo.add_build(build)
    }

    fn finished_upstream(branch: &str, status: Status) -> Build {
        let mut build = Build::new(upstream(), branch, "def456");
        build.id = 40;
        build.status = status;
        build
    }

    fn triggered_builds(repo: &MockRepo) -> Vec<Build> {
        repo.builds()
            .into_iter()
            .filter(|b| b.triggered_by.is_some())
            .collect()
    }

    #[tokio::test]
    async fn test_pipeline_trigger_starts_build_on_branch() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        seed(
            &repo,
            pipeline(vec![pipeline_trigger(TriggerEvent::Finished, Some("succeeded"), Some("main"))], vec![]),
        );

        svc.fire_pipeline_triggers(&finished_upstream("main", Status::Succeeded), TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;

        let triggered = triggered_builds(&repo);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].identity, downstream());
        assert_eq!(triggered[0].branch, "main");
        assert_eq!(triggered[0].status, Status::Running);
        assert_eq!(triggered[0].triggered_by.as_deref(), Some("trigger"));
        assert_eq!(triggered[0].version.as_deref(), Some("0.0.2"));

        let jobs = ci.created();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].triggered_by.as_deref(), Some("trigger"));
    }

    #[tokio::test]
    async fn test_create_build_fires_started_triggers_after_job_creation() {
        for wait_for_start in [true, false] {
            let repo = Arc::new(MockRepo::default());
            let ci = Arc::new(MockCiBuilder::with_journal(repo.journal.clone()));
            let svc = service(repo.clone(), ci.clone());
            seed(
                &repo,
                pipeline(vec![pipeline_trigger(TriggerEvent::Started, None, None)], vec![]),
            );

            let mut lib = Build::new(upstream(), "main", "def456");
            lib.manifest = VALID_MANIFEST.to_string();
            svc.create_build(lib, wait_for_start).await.unwrap();
            svc.queue().wait_idle().await;

            let triggered = triggered_builds(&repo);
            assert_eq!(triggered.len(), 1, "wait_for_start={wait_for_start}");
            assert_eq!(triggered[0].identity, downstream());
            assert_eq!(ci.created().len(), 2);

            let journal = &repo.journal;
            let insert = journal.first("insert_build").unwrap();
            let create = journal.first("create_job").unwrap();
            let fire = journal.first("get_pipeline_triggers").unwrap();
            assert!(insert < create, "wait_for_start={wait_for_start}");
            assert!(create < fire, "wait_for_start={wait_for_start}");
        }
    }

    #[tokio::test]
    async fn test_create_release_fires_started_triggers_after_job_creation() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::with_journal(repo.journal.clone()));
        let svc = service(repo.clone(), ci.clone());
        let trigger = ManifestTrigger {
            filter: TriggerFilter::Release(ReleaseTrigger {
                event: TriggerEvent::Started,
                name: upstream().full_name(),
                target: Some("production".to_string()),
                status: None,
            }),
            then: on_branch("main"),
        };
        seed(&repo, pipeline(vec![trigger], vec![]));

        let mut lib = Build::new(upstream(), "main", "def456");
        lib.manifest = VALID_MANIFEST.to_string();
        lib.version = Some("1.0.0".to_string());
        lib.status = Status::Succeeded;
        repo.add_build(lib);

        let release = Release {
            id: 0,
            identity: upstream(),
            name: "production".to_string(),
            action: Some("deploy".to_string()),
            version: "1.0.0".to_string(),
            status: Status::Pending,
            triggered_by: None,
            inserted_at: None,
        };
        svc.create_release(release, false).await.unwrap();
        svc.queue().wait_idle().await;

        assert_eq!(triggered_builds(&repo).len(), 1);
        let journal = &repo.journal;
        let insert = journal.first("insert_release").unwrap();
        let create = journal.first("create_job").unwrap();
        let fire = journal.first("get_release_triggers").unwrap();
        assert!(insert < create);
        assert!(create < fire);
    }

    #[tokio::test]
    async fn test_pipeline_trigger_filters() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        seed(
            &repo,
            pipeline(
                vec![
                    pipeline_trigger(TriggerEvent::Started, None, None),
                    pipeline_trigger(TriggerEvent::Finished, Some("succeeded"), Some("release/.+")),
                ],
                vec![],
            ),
        );

        // Wrong status.
        svc.fire_pipeline_triggers(&finished_upstream("release/1.2", Status::Failed), TriggerEvent::Finished)
            .await
            .unwrap();
        // Branch does not match the anchored pattern.
        svc.fire_pipeline_triggers(&finished_upstream("main", Status::Succeeded), TriggerEvent::Finished)
            .await
            .unwrap();
        // Other pipeline.
        let mut other = finished_upstream("release/1.2", Status::Succeeded);
        other.identity = PipelineIdentity::new("github.com", "acme", "other");
        svc.fire_pipeline_triggers(&other, TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert!(triggered_builds(&repo).is_empty());

        svc.fire_pipeline_triggers(&finished_upstream("release/1.2", Status::Succeeded), TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert_eq!(triggered_builds(&repo).len(), 1);

        svc.fire_pipeline_triggers(&finished_upstream("main", Status::Running), TriggerEvent::Started)
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert_eq!(triggered_builds(&repo).len(), 2);
    }

    #[tokio::test]
    async fn test_finish_build_fires_finished_triggers() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        seed(
            &repo,
            pipeline(vec![pipeline_trigger(TriggerEvent::Finished, Some("succeeded"), None)], vec![]),
        );
        let mut running = Build::new(upstream(), "main", "def456");
        running.status = Status::Running;
        let running = repo.add_build(running);

        svc.finish_build(&upstream(), running.id, Status::Succeeded)
            .await
            .unwrap();
        svc.queue().wait_idle().await;

        let triggered = triggered_builds(&repo);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].identity, downstream());
    }

    #[tokio::test]
    async fn test_no_earlier_build_skips_trigger() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        repo.add_pipeline(pipeline(
            vec![pipeline_trigger(TriggerEvent::Finished, None, None)],
            vec![],
        ));

        svc.fire_pipeline_triggers(&finished_upstream("main", Status::Succeeded), TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;

        assert!(repo.builds().is_empty());
        assert!(ci.created().is_empty());
    }

    fn production(trigger: ManifestTrigger) -> ReleaseTarget {
        ReleaseTarget {
            name: "production".to_string(),
            actions: vec!["deploy".to_string(), "rollback".to_string()],
            stages: vec![],
            triggers: vec![trigger],
        }
    }

    fn release_target_trigger(action: Option<&str>) -> ManifestTrigger {
        ManifestTrigger {
            filter: TriggerFilter::Pipeline(PipelineTrigger {
                event: TriggerEvent::Finished,
                name: upstream().full_name(),
                status: Some("succeeded".to_string()),
                branch: None,
            }),
            then: TriggerAction {
                branch: None,
                action: action.map(str::to_string),
            },
        }
    }

    #[tokio::test]
    async fn test_release_target_trigger_starts_release() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        seed(&repo, pipeline(vec![], vec![production(release_target_trigger(Some("deploy")))]));

        svc.fire_pipeline_triggers(&finished_upstream("main", Status::Succeeded), TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;

        let releases = repo.releases();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].identity, downstream());
        assert_eq!(releases[0].name, "production");
        assert_eq!(releases[0].action.as_deref(), Some("deploy"));
        assert_eq!(releases[0].version, "0.0.1");
        assert_eq!(releases[0].triggered_by.as_deref(), Some("trigger"));

        let jobs = ci.created();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Release);
    }

    #[tokio::test]
    async fn test_release_trigger_without_action_is_dropped() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        seed(&repo, pipeline(vec![], vec![production(release_target_trigger(None))]));

        svc.fire_pipeline_triggers(&finished_upstream("main", Status::Succeeded), TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;

        assert!(repo.releases().is_empty());
        assert!(ci.created().is_empty());
    }

    #[tokio::test]
    async fn test_finished_release_fires_release_triggers() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        let trigger = ManifestTrigger {
            filter: TriggerFilter::Release(ReleaseTrigger {
                event: TriggerEvent::Finished,
                name: upstream().full_name(),
                target: Some("staging".to_string()),
                status: Some("succeeded".to_string()),
            }),
            then: on_branch("main"),
        };
        seed(&repo, pipeline(vec![trigger], vec![]));

        let staging = Release {
            id: 3,
            identity: upstream(),
            name: "staging".to_string(),
            action: None,
            version: "1.0.0".to_string(),
            status: Status::Succeeded,
            triggered_by: None,
            inserted_at: None,
        };
        svc.fire_release_triggers(&Release { name: "qa".to_string(), ..staging.clone() }, TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert!(triggered_builds(&repo).is_empty());

        svc.fire_release_triggers(&staging, TriggerEvent::Finished)
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert_eq!(triggered_builds(&repo).len(), 1);
    }

    #[tokio::test]
    async fn test_cron_trigger_fires_on_schedule() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        let trigger = ManifestTrigger {
            filter: TriggerFilter::Cron(CronTrigger {
                schedule: "0 2 * * *".to_string(),
            }),
            then: on_branch("main"),
        };
        seed(&repo, pipeline(vec![trigger], vec![]));

        svc.fire_cron_triggers(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap())
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert!(triggered_builds(&repo).is_empty());

        svc.fire_cron_triggers(Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap())
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert_eq!(triggered_builds(&repo).len(), 1);
    }

    #[tokio::test]
    async fn test_git_and_pubsub_triggers() {
        let repo = Arc::new(MockRepo::default());
        let ci = Arc::new(MockCiBuilder::default());
        let svc = service(repo.clone(), ci.clone());
        let git = ManifestTrigger {
            filter: TriggerFilter::Git(GitTrigger {
                event: "push".to_string(),
                repository: "github.com/acme/lib".to_string(),
                branch: Some("main".to_string()),
            }),
            then: on_branch("main"),
        };
        let pubsub = ManifestTrigger {
            filter: TriggerFilter::Pubsub(PubSubTrigger {
                project: "acme-prod".to_string(),
                topic: "images".to_string(),
            }),
            then: on_branch("main"),
        };
        seed(&repo, pipeline(vec![git, pubsub], vec![]));

        let push = GitEvent {
            event: "push".to_string(),
            repository: "github.com/acme/lib".to_string(),
            branch: "feature".to_string(),
        };
        svc.fire_git_triggers(&push).await.unwrap();
        svc.queue().wait_idle().await;
        assert!(triggered_builds(&repo).is_empty());

        svc.fire_git_triggers(&GitEvent { branch: "main".to_string(), ..push })
            .await
            .unwrap();
        svc.queue().wait_idle().await;
        assert_eq!(triggered_builds(&repo).len(), 1);

        svc.fire_pubsub_triggers(&PubSubEvent {
            project: "acme-prod".to_string(),
            topic: "images".to_string(),
        })
        .await
        .unwrap();
        svc.queue().wait_idle().await;
        assert_eq!(triggered_builds(&repo).len(), 2);
    }
}
