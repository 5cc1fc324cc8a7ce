//! Setup job construction

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSecurityContext, PodSpec, PodTemplateSpec, SecurityContext, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::helm::{helm_task_config, HELM_CONFIG_ENV};
use super::SetupMode;
use crate::config::{ControllerConfig, DEFAULT_SETUP_IMAGE, DEFAULT_SETUP_IMAGE_PULL_POLICY};
use crate::crd::Trial;
use crate::kube_utils::controller_owner_ref;
use crate::template::TemplateEngine;
use crate::{Result, LABEL_EXPERIMENT, LABEL_TRIAL, LABEL_TRIAL_ROLE, ROLE_TRIAL_SETUP};

const SETUP_USER_ID: i64 = 1000;

/// One environment variable per assignment, upper-cased with `.` replaced by `_`
pub fn assignment_env(trial: &Trial) -> Vec<EnvVar> {
    trial
        .spec
        .assignments
        .iter()
        .map(|a| EnvVar {
            name: a.name.to_uppercase().replace('.', "_"),
            value: Some(a.value.to_string()),
            ..Default::default()
        })
        .collect()
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Build the setup job running every task that participates in `mode`
///
/// Tasks are skipped per mode with `skipCreate`/`skipDelete`. Volumes from the
/// trial and from Helm values sources are merged by name.
pub fn new_setup_job(
    trial: &Trial,
    mode: SetupMode,
    config: &ControllerConfig,
    engine: &TemplateEngine,
) -> Result<Job> {
    let job_name = format!("{}-{}", trial.name_any(), mode);
    let (_, experiment_name) = trial.experiment_key();
    let labels = BTreeMap::from([
        (LABEL_EXPERIMENT.to_string(), experiment_name),
        (LABEL_TRIAL.to_string(), trial.name_any()),
        (LABEL_TRIAL_ROLE.to_string(), ROLE_TRIAL_SETUP.to_string()),
    ]);

    let mut volumes: BTreeMap<String, Volume> = trial
        .spec
        .setup_volumes
        .iter()
        .map(|v| (v.name.clone(), v.clone()))
        .collect();

    let mut containers = Vec::new();
    for task in &trial.spec.setup_tasks {
        let skip = match mode {
            SetupMode::Create => task.skip_create,
            SetupMode::Delete => task.skip_delete,
        };
        if skip {
            continue;
        }

        let mut container = Container {
            name: format!("{}-{}", job_name, task.name),
            args: Some(vec![mode.to_string()]),
            security_context: Some(SecurityContext {
                run_as_user: Some(SETUP_USER_ID),
                run_as_group: Some(SETUP_USER_ID),
                allow_privilege_escalation: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        match task.image.as_deref().filter(|i| !i.is_empty()) {
            Some(image) => {
                // Floating tags are re-pulled, pinned ones are not
                let policy = if image.ends_with(":latest") {
                    "Always"
                } else {
                    "IfNotPresent"
                };
                container.image = Some(image.to_string());
                container.image_pull_policy = Some(policy.to_string());
                if !task.command.is_empty() {
                    container.command = Some(task.command.clone());
                }
                if !task.args.is_empty() {
                    container.args = Some(task.args.clone());
                }
            }
            None if config.setup_image_from_env => {
                // An image from the environment only gets the policy given with it
                container.image = Some(config.setup_image.clone());
                container.image_pull_policy = Some(config.setup_image_pull_policy.clone())
                    .filter(|p| !p.is_empty());
            }
            None => {
                container.image = Some(DEFAULT_SETUP_IMAGE.to_string());
                container.image_pull_policy = Some(DEFAULT_SETUP_IMAGE_PULL_POLICY.to_string());
            }
        }

        let mut env_vars = vec![
            env("NAMESPACE", trial.target_namespace()),
            env("NAME", task.name.clone()),
            env("TRIAL", trial.name_any()),
            env("MODE", mode.as_str()),
        ];
        env_vars.extend(assignment_env(trial));

        let mut mounts = task.volume_mounts.clone();
        if let Some(helm) = helm_task_config(task, trial, engine)? {
            env_vars.push(env(HELM_CONFIG_ENV, helm.encoded));
            mounts.extend(helm.volume_mounts);
            for v in helm.volumes {
                volumes.entry(v.name.clone()).or_insert(v);
            }
        }

        container.env = Some(env_vars);
        if !mounts.is_empty() {
            container.volume_mounts = Some(mounts);
        }
        containers.push(container);
    }

    let volumes: Vec<Volume> = volumes.into_values().collect();

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: trial.namespace(),
            labels: Some(labels.clone()),
            owner_references: controller_owner_ref(trial).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: trial
                        .spec
                        .setup_service_account_name
                        .clone()
                        .filter(|s| !s.is_empty()),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        ..Default::default()
                    }),
                    containers,
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Assignment, ConfigMapValuesReference, HelmValuesFromSource, SetupTask, TrialSpec,
    };
    use crate::setup::find_setup_job_condition_type;
    use crate::crd::TrialConditionType;
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, VolumeMount};

    fn task(name: &str) -> SetupTask {
        SetupTask {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn trial_with_tasks(tasks: Vec<SetupTask>) -> Trial {
        let mut trial = Trial::new(
            "tuning-001",
            TrialSpec {
                assignments: vec![
                    Assignment {
                        name: "cpu".to_string(),
                        value: 500,
                    },
                    Assignment {
                        name: "jvm.heap".to_string(),
                        value: 1024,
                    },
                ],
                setup_tasks: tasks,
                ..Default::default()
            },
        );
        trial.metadata.namespace = Some("default".to_string());
        trial.metadata.uid = Some("trial-uid".to_string());
        trial
    }

    fn build(trial: &Trial, mode: SetupMode) -> Job {
        new_setup_job(trial, mode, &ControllerConfig::default(), &TemplateEngine::new()).unwrap()
    }

    fn containers(job: &Job) -> &[Container] {
        &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers
    }

    fn env_value<'a>(c: &'a Container, name: &str) -> Option<&'a str> {
        c.env
            .iter()
            .flatten()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    /// Story: A create job carries the trial's identity and assignments
    #[test]
    fn story_create_job_shape() {
        let trial = trial_with_tasks(vec![task("db")]);
        let job = build(&trial, SetupMode::Create);

        assert_eq!(job.metadata.name.as_deref(), Some("tuning-001-create"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("default"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_TRIAL_ROLE).map(String::as_str), Some("trialSetup"));
        assert_eq!(labels.get(LABEL_TRIAL).map(String::as_str), Some("tuning-001"));
        assert_eq!(labels.get(LABEL_EXPERIMENT).map(String::as_str), Some("tuning-001"));

        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Trial");
        assert_eq!(owner.controller, Some(true));

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.security_context.as_ref().unwrap().run_as_non_root,
            Some(true)
        );

        let c = &containers(&job)[0];
        assert_eq!(c.name, "tuning-001-create-db");
        assert_eq!(c.args.as_deref(), Some(&["create".to_string()][..]));
        assert_eq!(env_value(c, "MODE"), Some("create"));
        assert_eq!(env_value(c, "NAMESPACE"), Some("default"));
        assert_eq!(env_value(c, "NAME"), Some("db"));
        assert_eq!(env_value(c, "TRIAL"), Some("tuning-001"));
        assert_eq!(env_value(c, "CPU"), Some("500"));
        assert_eq!(env_value(c, "JVM_HEAP"), Some("1024"));
        let sc = c.security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_user, Some(1000));
        assert_eq!(sc.allow_privilege_escalation, Some(false));

        assert_eq!(
            find_setup_job_condition_type(&job).unwrap(),
            TrialConditionType::SetupCreated
        );
    }

    #[test]
    fn test_skip_flags_filter_tasks_per_mode() {
        let mut keep_running = task("load");
        keep_running.skip_delete = true;
        let mut pre_provisioned = task("db");
        pre_provisioned.skip_create = true;
        let trial = trial_with_tasks(vec![keep_running, pre_provisioned]);

        let create = build(&trial, SetupMode::Create);
        assert_eq!(containers(&create).len(), 1);
        assert_eq!(containers(&create)[0].name, "tuning-001-create-load");

        let delete = build(&trial, SetupMode::Delete);
        assert_eq!(containers(&delete).len(), 1);
        assert_eq!(containers(&delete)[0].name, "tuning-001-delete-db");
    }

    #[test]
    fn test_target_namespace_is_passed_to_tasks() {
        let mut trial = trial_with_tasks(vec![task("db")]);
        trial.spec.target_namespace = Some("workload".to_string());
        let job = build(&trial, SetupMode::Create);
        assert_eq!(env_value(&containers(&job)[0], "NAMESPACE"), Some("workload"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("default"));
    }

    mod images {
        use super::*;

        #[test]
        fn test_builtin_image_and_policy() {
            let job = build(&trial_with_tasks(vec![task("db")]), SetupMode::Create);
            let c = &containers(&job)[0];
            assert_eq!(c.image.as_deref(), Some("setuptools:latest"));
            assert_eq!(c.image_pull_policy.as_deref(), Some("IfNotPresent"));
        }

        #[test]
        fn test_environment_image_and_policy() {
            let config = ControllerConfig::default()
                .with_setup_image("registry/setup:2.0".to_string(), Some("Always".to_string()));
            let trial = trial_with_tasks(vec![task("db")]);
            let job =
                new_setup_job(&trial, SetupMode::Create, &config, &TemplateEngine::new()).unwrap();
            let c = &containers(&job)[0];
            assert_eq!(c.image.as_deref(), Some("registry/setup:2.0"));
            assert_eq!(c.image_pull_policy.as_deref(), Some("Always"));
        }

        #[test]
        fn test_environment_image_without_policy_leaves_it_to_the_cluster() {
            let config = ControllerConfig::default()
                .with_setup_image("registry/setup:2.0".to_string(), None);
            let trial = trial_with_tasks(vec![task("db")]);
            let job =
                new_setup_job(&trial, SetupMode::Create, &config, &TemplateEngine::new()).unwrap();
            let c = &containers(&job)[0];
            assert_eq!(c.image.as_deref(), Some("registry/setup:2.0"));
            assert_eq!(c.image_pull_policy, None);
        }

        #[test]
        fn test_builtin_image_ignores_a_stray_policy() {
            let config = ControllerConfig {
                setup_image_pull_policy: "Never".to_string(),
                ..Default::default()
            };
            let trial = trial_with_tasks(vec![task("db")]);
            let job =
                new_setup_job(&trial, SetupMode::Create, &config, &TemplateEngine::new()).unwrap();
            let c = &containers(&job)[0];
            assert_eq!(c.image.as_deref(), Some("setuptools:latest"));
            assert_eq!(c.image_pull_policy.as_deref(), Some("IfNotPresent"));
        }

        /// Story: A custom image brings its own entrypoint
        #[test]
        fn story_custom_image_honours_command_and_args() {
            let mut custom = task("seed");
            custom.image = Some("example/seeder:latest".to_string());
            custom.command = vec!["/seed".to_string()];
            custom.args = vec!["--rows".to_string(), "1000".to_string()];
            let job = build(&trial_with_tasks(vec![custom]), SetupMode::Create);
            let c = &containers(&job)[0];
            assert_eq!(c.image_pull_policy.as_deref(), Some("Always"));
            assert_eq!(c.command.as_deref(), Some(&["/seed".to_string()][..]));
            assert_eq!(c.args.as_ref().unwrap().len(), 2);
        }

        #[test]
        fn test_command_ignored_without_image_override() {
            let mut t = task("db");
            t.command = vec!["/bin/false".to_string()];
            t.args = vec!["ignored".to_string()];
            let job = build(&trial_with_tasks(vec![t]), SetupMode::Delete);
            let c = &containers(&job)[0];
            assert!(c.command.is_none());
            assert_eq!(c.args.as_deref(), Some(&["delete".to_string()][..]));
        }

        #[test]
        fn test_pinned_custom_image_uses_if_not_present() {
            let mut t = task("db");
            t.image = Some("example/db:1.4".to_string());
            let job = build(&trial_with_tasks(vec![t]), SetupMode::Create);
            assert_eq!(
                containers(&job)[0].image_pull_policy.as_deref(),
                Some("IfNotPresent")
            );
        }
    }

    /// Story: Two Helm tasks reading the same values ConfigMap share one volume
    #[test]
    fn story_volumes_are_deduplicated_by_name() {
        let helm_task = |name: &str| SetupTask {
            name: name.to_string(),
            helm_chart: Some("example/chart".to_string()),
            helm_values_from: vec![HelmValuesFromSource {
                config_map: Some(ConfigMapValuesReference {
                    name: "shared-values".to_string(),
                }),
            }],
            ..Default::default()
        };
        let mut plain = task("scratch-user");
        plain.volume_mounts = vec![VolumeMount {
            name: "scratch".to_string(),
            mount_path: "/scratch".to_string(),
            ..Default::default()
        }];
        let mut trial = trial_with_tasks(vec![helm_task("a"), helm_task("b"), plain]);
        trial.spec.setup_volumes = vec![Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }];

        let job = build(&trial, SetupMode::Create);
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let names: Vec<_> = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(names, vec!["scratch", "shared-values"]);
        assert!(env_value(&pod.containers[0], HELM_CONFIG_ENV).is_some());
        assert!(env_value(&pod.containers[2], HELM_CONFIG_ENV).is_none());
        assert_eq!(pod.containers[2].volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_helm_configuration_error_aborts_job() {
        let mut t = task("bad");
        t.helm_chart = Some("example/chart".to_string());
        t.helm_values = vec![crate::crd::HelmValue {
            name: "orphan".to_string(),
            ..Default::default()
        }];
        let trial = trial_with_tasks(vec![t]);
        assert!(new_setup_job(
            &trial,
            SetupMode::Create,
            &ControllerConfig::default(),
            &TemplateEngine::new()
        )
        .is_err());
    }
}
