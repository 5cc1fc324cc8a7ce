//! Setup task jobs
//!
//! A trial's setup tasks run as one Job per mode: a `create` job before the
//! trial starts and a `delete` job once it is finished (or deleted). Each task
//! becomes one container of that job. This module builds those jobs and reads
//! their status back into condition updates.

mod helm;
mod job;

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;

use crate::crd::{ConditionStatus, TrialConditionType};
use crate::{Error, Result};

pub use helm::{helm_task_config, HelmTaskConfig, HELM_CONFIG_ENV};
pub use job::{assignment_env, new_setup_job};

/// Which half of the setup lifecycle a job performs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupMode {
    /// Bring the setup state up before the trial runs
    Create,
    /// Tear it down after the trial finished
    Delete,
}

impl SetupMode {
    /// Value passed as `MODE` and as the default container argument
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }

    /// Trial condition tracking jobs of this mode
    pub fn condition_type(&self) -> TrialConditionType {
        match self {
            Self::Create => TrialConditionType::SetupCreated,
            Self::Delete => TrialConditionType::SetupDeleted,
        }
    }
}

impl fmt::Display for SetupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion of a setup job, never `Unknown`
///
/// `Unknown` on a setup condition means "no job observed yet", so an observed
/// job always maps to `True` or `False`.
pub fn is_setup_job_complete(job: &Job) -> ConditionStatus {
    if job_condition_true(job, "Complete").is_some() {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    }
}

/// Failure message for a failed setup job, None while it has not failed
pub fn is_setup_job_failed(job: &Job) -> Option<String> {
    if let Some(c) = job_condition_true(job, "Failed") {
        let reason = c.reason.as_deref().unwrap_or_default();
        let message = match reason {
            "BackoffLimitExceeded" => "Setup job did not complete successfully".to_string(),
            _ => match c.message.as_deref().filter(|m| !m.is_empty()) {
                Some(m) => m.to_string(),
                None if !reason.is_empty() => {
                    format!("Setup job failed with reason '{reason}'")
                }
                None => "Setup job failed without reporting a reason".to_string(),
            },
        };
        return Some(message);
    }

    // Older clusters do not report failure conditions on jobs
    let failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0);
    if failed > 0 {
        return Some(format!("Setup job has {failed} failed pod(s)"));
    }
    None
}

fn job_condition_true<'a>(
    job: &'a Job,
    type_: &str,
) -> Option<&'a k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_ && c.status == "True")
}

/// Classify a setup job by the `MODE` of its first container
pub fn find_setup_job_condition_type(job: &Job) -> Result<TrialConditionType> {
    let container = job
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.first())
        .ok_or_else(|| Error::configuration("unable to determine setup job type"))?;

    let mode = container
        .env
        .iter()
        .flatten()
        .find(|e| e.name == "MODE")
        .and_then(|e| e.value.as_deref())
        .ok_or_else(|| Error::configuration("unable to determine setup job type"))?;

    match mode {
        "create" => Ok(TrialConditionType::SetupCreated),
        "delete" => Ok(TrialConditionType::SetupDeleted),
        other => Err(Error::configuration(format!(
            "unknown setup job mode: {other}"
        ))),
    }
}

/// Failure message when a setup pod has a container that exited non-zero
///
/// This catches failures before the Job controller gets around to reporting
/// them.
pub fn failed_container_message(pods: &[Pod]) -> Option<&'static str> {
    let failed = pods
        .iter()
        .filter_map(|p| p.status.as_ref()?.container_statuses.as_ref())
        .flatten()
        .any(|cs| {
            !cs.ready
                && cs
                    .state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .is_some_and(|t| t.exit_code != 0)
        });
    failed.then_some("Setup job has a failed container")
}

/// Failure message for a job that never started a pod within `timeout`
///
/// This is a wall-clock heuristic against the job's creation time; it does
/// not look at why the pods are missing.
pub fn stuck_pending_message(
    job: &Job,
    now: DateTime<Utc>,
    timeout: std::time::Duration,
) -> Option<String> {
    let created = job.metadata.creation_timestamp.as_ref()?.0;
    let status = job.status.clone().unwrap_or_default();
    let started = status.active.unwrap_or(0) > 0
        || status.succeeded.unwrap_or(0) > 0
        || status.failed.unwrap_or(0) > 0
        || status.conditions.as_ref().is_some_and(|c| !c.is_empty());
    if started {
        return None;
    }
    let timeout = chrono::Duration::from_std(timeout).ok()?;
    (now - created > timeout).then(|| {
        format!(
            "Setup job did not start within {}s",
            timeout.num_seconds()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateTerminated, ContainerStatus, EnvVar,
        PodSpec, PodStatus, PodTemplateSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn job_with_mode(mode: &str) -> Job {
        Job {
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "t1-delete-db".to_string(),
                            env: Some(vec![EnvVar {
                                name: "MODE".to_string(),
                                value: Some(mode.to_string()),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn with_condition(mut job: Job, type_: &str, reason: Option<&str>) -> Job {
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: type_.to_string(),
                status: "True".to_string(),
                reason: reason.map(str::to_string),
                ..Default::default()
            }]),
            ..Default::default()
        });
        job
    }

    mod classification {
        use super::*;

        #[test]
        fn test_mode_maps_to_condition_type() {
            assert_eq!(
                find_setup_job_condition_type(&job_with_mode("create")).unwrap(),
                TrialConditionType::SetupCreated
            );
            assert_eq!(
                find_setup_job_condition_type(&job_with_mode("delete")).unwrap(),
                TrialConditionType::SetupDeleted
            );
        }

        #[test]
        fn test_unknown_or_missing_mode_is_an_error() {
            assert!(find_setup_job_condition_type(&job_with_mode("upgrade")).is_err());
            assert!(find_setup_job_condition_type(&Job::default()).is_err());
        }

        #[test]
        fn test_mode_round_trips_through_condition_type() {
            assert_eq!(
                SetupMode::Create.condition_type(),
                TrialConditionType::SetupCreated
            );
            assert_eq!(SetupMode::Delete.to_string(), "delete");
        }
    }

    mod status {
        use super::*;

        #[test]
        fn test_complete_is_never_unknown() {
            assert_eq!(is_setup_job_complete(&Job::default()), ConditionStatus::False);
            let job = with_condition(job_with_mode("create"), "Complete", None);
            assert_eq!(is_setup_job_complete(&job), ConditionStatus::True);
        }

        /// Story: A delete job exhausted its backoff limit
        #[test]
        fn story_backoff_limit_exceeded() {
            let job = with_condition(
                job_with_mode("delete"),
                "Failed",
                Some("BackoffLimitExceeded"),
            );
            assert_eq!(
                find_setup_job_condition_type(&job).unwrap(),
                TrialConditionType::SetupDeleted
            );
            assert_eq!(
                is_setup_job_failed(&job).as_deref(),
                Some("Setup job did not complete successfully")
            );
        }

        #[test]
        fn test_other_failure_reasons() {
            let job = with_condition(Job::default(), "Failed", Some("DeadlineExceeded"));
            assert_eq!(
                is_setup_job_failed(&job).as_deref(),
                Some("Setup job failed with reason 'DeadlineExceeded'")
            );
            let job = with_condition(Job::default(), "Failed", None);
            assert_eq!(
                is_setup_job_failed(&job).as_deref(),
                Some("Setup job failed without reporting a reason")
            );
        }

        #[test]
        fn test_failed_pod_count_without_conditions() {
            let job = Job {
                status: Some(JobStatus {
                    failed: Some(2),
                    ..Default::default()
                }),
                ..Default::default()
            };
            assert_eq!(
                is_setup_job_failed(&job).as_deref(),
                Some("Setup job has 2 failed pod(s)")
            );
            assert!(is_setup_job_failed(&Job::default()).is_none());
        }
    }

    mod pods {
        use super::*;

        fn pod_with_exit(code: i32) -> Pod {
            Pod {
                status: Some(PodStatus {
                    container_statuses: Some(vec![ContainerStatus {
                        name: "task".to_string(),
                        ready: false,
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: code,
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }

        #[test]
        fn test_non_zero_exit_fails_the_job() {
            assert_eq!(
                failed_container_message(&[pod_with_exit(0), pod_with_exit(3)]),
                Some("Setup job has a failed container")
            );
            assert!(failed_container_message(&[pod_with_exit(0)]).is_none());
            assert!(failed_container_message(&[]).is_none());
        }
    }

    mod startup {
        use super::*;

        fn pending_job(age_secs: i64) -> Job {
            let mut job = job_with_mode("create");
            job.metadata.creation_timestamp =
                Some(Time(Utc::now() - chrono::Duration::seconds(age_secs)));
            job
        }

        /// Story: A setup job whose service account is missing never starts
        #[test]
        fn story_job_stuck_pending_times_out() {
            let timeout = std::time::Duration::from_secs(120);
            assert!(stuck_pending_message(&pending_job(30), Utc::now(), timeout).is_none());
            assert_eq!(
                stuck_pending_message(&pending_job(300), Utc::now(), timeout).as_deref(),
                Some("Setup job did not start within 120s")
            );
        }

        #[test]
        fn test_started_job_never_times_out() {
            let mut job = pending_job(300);
            job.status = Some(JobStatus {
                active: Some(1),
                ..Default::default()
            });
            assert!(
                stuck_pending_message(&job, Utc::now(), std::time::Duration::from_secs(120))
                    .is_none()
            );
        }
    }
}
