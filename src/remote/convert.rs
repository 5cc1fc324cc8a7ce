//! Conversions between cluster resources and their remote representation

use kube::ResourceExt;

use super::{
    Bounds, NextTrial, Optimization, RemoteAssignment, RemoteExperiment, RemoteMetric,
    RemoteParameter, RemoteValue, TrialValues,
};
use crate::conditions::is_failed;
use crate::crd::{Assignment, Experiment, Trial};
use crate::{Error, Result, ANNOTATION_REPORT_TRIAL_URL};

/// Build the remote representation of an experiment
///
/// Parameters whose bounds collapse to a single value are fixed and are not
/// sent to the optimizer.
pub fn experiment_to_remote(experiment: &Experiment) -> RemoteExperiment {
    let spec = &experiment.spec;
    RemoteExperiment {
        display_name: experiment.name_any(),
        optimization: Optimization {
            experiment_budget: spec.budget.unwrap_or(0),
            parallel_trials: spec.parallelism.unwrap_or_else(|| experiment.replicas()),
            burn_in: spec.burn_in.unwrap_or(0),
        },
        metrics: spec
            .metrics
            .iter()
            .map(|m| RemoteMetric {
                name: m.name.clone(),
                minimize: m.minimize,
            })
            .collect(),
        parameters: spec
            .parameters
            .iter()
            .filter(|p| p.min != p.max)
            .map(|p| RemoteParameter {
                name: p.name.clone(),
                type_: "int".to_string(),
                bounds: Bounds {
                    min: p.min,
                    max: p.max,
                },
            })
            .collect(),
        ..Default::default()
    }
}

/// Project a trial's assignments into their remote form
pub fn trial_assignments(trial: &Trial) -> Vec<RemoteAssignment> {
    trial
        .spec
        .assignments
        .iter()
        .map(|a| RemoteAssignment {
            parameter_name: a.name.clone(),
            value: a.value.into(),
        })
        .collect()
}

// -2^63 and 2^63, both exact as f64
const I64_LOWER: f64 = i64::MIN as f64;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

/// Convert suggested assignments into trial assignments
///
/// Values must be integral; a float with a fractional part or outside the
/// `i64` range is rejected.
pub fn assignments_from_remote(assignments: &[RemoteAssignment]) -> Result<Vec<Assignment>> {
    assignments
        .iter()
        .map(|a| {
            let value = a
                .value
                .as_i64()
                .or_else(|| {
                    a.value
                        .as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .filter(|f| (I64_LOWER..I64_UPPER).contains(f))
                        .map(|f| f as i64)
                })
                .or_else(|| a.value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| {
                    Error::serialization(format!(
                        "assignment for '{}' is not an integer: {}",
                        a.parameter_name, a.value
                    ))
                })?;
            Ok(Assignment {
                name: a.parameter_name.clone(),
                value,
            })
        })
        .collect()
}

/// Build the observation reported for a finished trial
pub fn trial_values(trial: &Trial) -> Result<TrialValues> {
    let status = trial.status_or_default();
    let failed = is_failed(&status.conditions);

    let mut values = Vec::new();
    if !failed {
        for v in &status.values {
            let value = v.value.parse::<f64>().map_err(|_| {
                Error::serialization(format!(
                    "value of metric '{}' is not a number: '{}'",
                    v.name, v.value
                ))
            })?;
            let error = match v.error.as_deref().filter(|e| !e.is_empty()) {
                Some(e) => Some(e.parse::<f64>().map_err(|_| {
                    Error::serialization(format!(
                        "error of metric '{}' is not a number: '{e}'",
                        v.name
                    ))
                })?),
                None => None,
            };
            values.push(RemoteValue {
                metric_name: v.name.clone(),
                value,
                error,
            });
        }
    }

    Ok(TrialValues {
        values,
        failed,
        start: status.start_time,
        end: status.completion_time,
    })
}

/// Name a trial after the last segment of its report URL
///
/// Numeric segments are zero padded to three digits.
pub fn trial_name(generate_name: &str, report_url: &str) -> String {
    let segment = report_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    match segment.parse::<u64>() {
        Ok(n) => format!("{generate_name}{n:03}"),
        Err(_) => format!("{generate_name}{segment}"),
    }
}

/// Populate a new trial from the experiment template and a suggestion
///
/// `namespace` is the slot picked by the namespace allocator.
pub fn populate_trial(experiment: &Experiment, namespace: &str, next: &NextTrial) -> Result<Trial> {
    let NextTrial::Assigned {
        assignments,
        report_url,
    } = next
    else {
        return Err(Error::remote("no suggestion to populate a trial from"));
    };

    let template = &experiment.spec.template;
    let mut trial = Trial::new(
        template.metadata.name.as_deref().unwrap_or_default(),
        template.spec.clone(),
    );
    trial.metadata.name = template.metadata.name.clone().filter(|n| !n.is_empty());
    trial.metadata.generate_name = template
        .metadata
        .generate_name
        .clone()
        .filter(|n| !n.is_empty());
    trial.metadata.namespace = template
        .metadata
        .namespace
        .clone()
        .filter(|n| !n.is_empty());
    if !template.metadata.labels.is_empty() {
        trial.metadata.labels = Some(template.metadata.labels.clone());
    }
    trial.metadata.annotations = Some(template.metadata.annotations.clone());

    // A single local trial keeps targeting its own namespace
    if experiment.replicas() > 1
        || experiment.spec.namespace_selector.is_some()
        || trial.metadata.namespace.is_some()
    {
        trial.spec.target_namespace = Some(namespace.to_string());
    }
    if trial.metadata.namespace.is_none() {
        trial.metadata.namespace = Some(namespace.to_string());
    }

    if trial.metadata.name.is_none() {
        if trial.metadata.namespace != experiment.namespace() {
            trial.metadata.name = Some(experiment.name_any());
        } else if trial.metadata.generate_name.is_none() {
            trial.metadata.generate_name = Some(format!("{}-", experiment.name_any()));
        }
    }

    if trial.labels().is_empty() {
        trial.metadata.labels = Some(experiment.default_labels());
    }
    if trial.spec.experiment_ref.is_none() {
        trial.spec.experiment_ref = Some(experiment.self_reference());
    }

    trial
        .annotations_mut()
        .insert(ANNOTATION_REPORT_TRIAL_URL.to_string(), report_url.clone());
    if trial.metadata.name.is_none() {
        if let Some(generate_name) = &trial.metadata.generate_name {
            trial.metadata.name = Some(trial_name(generate_name, report_url));
        }
    }
    trial.spec.assignments.extend(assignments_from_remote(assignments)?);
    Ok(trial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Condition, ConditionStatus, ExperimentSpec, Metric, Parameter, TrialConditionType,
        TrialSpec, TrialStatus, TrialValue,
    };
    use crate::LABEL_EXPERIMENT;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use serde_json::json;

    fn experiment() -> Experiment {
        let mut exp = Experiment::new(
            "tuning",
            ExperimentSpec {
                budget: Some(40),
                parameters: vec![
                    Parameter {
                        name: "cpu".to_string(),
                        min: 100,
                        max: 2000,
                    },
                    Parameter {
                        name: "fixed".to_string(),
                        min: 5,
                        max: 5,
                    },
                ],
                metrics: vec![Metric {
                    name: "cost".to_string(),
                    minimize: true,
                    query: "1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        exp.metadata.namespace = Some("default".to_string());
        exp.metadata.uid = Some("uid-1".to_string());
        exp
    }

    fn suggestion(report_url: &str) -> NextTrial {
        NextTrial::Assigned {
            assignments: vec![RemoteAssignment {
                parameter_name: "cpu".to_string(),
                value: json!(750),
            }],
            report_url: report_url.to_string(),
        }
    }

    mod experiments {
        use super::*;

        #[test]
        fn test_fixed_parameters_are_skipped() {
            let remote = experiment_to_remote(&experiment());
            assert_eq!(remote.display_name, "tuning");
            assert_eq!(remote.parameters.len(), 1);
            assert_eq!(remote.parameters[0].type_, "int");
            assert_eq!(remote.parameters[0].bounds, Bounds { min: 100, max: 2000 });
            assert_eq!(
                remote.metrics,
                vec![RemoteMetric {
                    name: "cost".to_string(),
                    minimize: true
                }]
            );
        }

        #[test]
        fn test_parallel_trials_prefers_parallelism() {
            let mut exp = experiment();
            exp.spec.replicas = Some(2);
            assert_eq!(experiment_to_remote(&exp).optimization.parallel_trials, 2);
            exp.spec.parallelism = Some(8);
            let remote = experiment_to_remote(&exp);
            assert_eq!(remote.optimization.parallel_trials, 8);
            assert_eq!(remote.optimization.experiment_budget, 40);
            assert_eq!(remote.optimization.burn_in, 0);
        }
    }

    mod assignments {
        use super::*;

        /// Story: Assignments survive the trip through the remote form
        #[test]
        fn story_assignments_round_trip() {
            let trial = Trial::new(
                "t",
                TrialSpec {
                    assignments: vec![
                        Assignment {
                            name: "cpu".to_string(),
                            value: 750,
                        },
                        Assignment {
                            name: "memory".to_string(),
                            value: -3,
                        },
                    ],
                    ..Default::default()
                },
            );
            let remote = trial_assignments(&trial);
            assert_eq!(assignments_from_remote(&remote).unwrap(), trial.spec.assignments);
        }

        #[test]
        fn test_integral_floats_and_strings_are_accepted() {
            let remote = vec![
                RemoteAssignment {
                    parameter_name: "a".to_string(),
                    value: json!(3.0),
                },
                RemoteAssignment {
                    parameter_name: "b".to_string(),
                    value: json!("12"),
                },
            ];
            let out = assignments_from_remote(&remote).unwrap();
            assert_eq!(out[0].value, 3);
            assert_eq!(out[1].value, 12);
        }

        #[test]
        fn test_fractional_value_is_rejected() {
            let remote = vec![RemoteAssignment {
                parameter_name: "a".to_string(),
                value: json!(0.5),
            }];
            assert!(matches!(
                assignments_from_remote(&remote),
                Err(Error::Serialization(_))
            ));
        }

        #[test]
        fn test_out_of_range_value_is_rejected() {
            for value in [json!(1e20), json!(-1e20), json!(9.223372036854775808e18)] {
                let remote = vec![RemoteAssignment {
                    parameter_name: "a".to_string(),
                    value,
                }];
                assert!(matches!(
                    assignments_from_remote(&remote),
                    Err(Error::Serialization(_))
                ));
            }
        }

        #[test]
        fn test_smallest_integer_float_is_accepted() {
            let remote = vec![RemoteAssignment {
                parameter_name: "a".to_string(),
                value: json!(-9.223372036854775808e18),
            }];
            assert_eq!(assignments_from_remote(&remote).unwrap()[0].value, i64::MIN);
        }
    }

    mod values {
        use super::*;

        fn trial_with_values(values: Vec<TrialValue>, failed: bool) -> Trial {
            let mut trial = Trial::new("t", TrialSpec::default());
            let now = Utc::now();
            let mut conditions = Vec::new();
            if failed {
                conditions.push(Condition::new(
                    TrialConditionType::Failed.as_str(),
                    ConditionStatus::True,
                    "PatchFailed",
                    "",
                    now,
                ));
            }
            trial.status = Some(TrialStatus {
                start_time: Some(now),
                completion_time: Some(now),
                conditions,
                values,
                ..Default::default()
            });
            trial
        }

        #[test]
        fn test_values_are_parsed() {
            let trial = trial_with_values(
                vec![TrialValue {
                    name: "cost".to_string(),
                    value: "12.5".to_string(),
                    error: Some("0.5".to_string()),
                    attempts_remaining: 0,
                }],
                false,
            );
            let out = trial_values(&trial).unwrap();
            assert!(!out.failed);
            assert_eq!(
                out.values,
                vec![RemoteValue {
                    metric_name: "cost".to_string(),
                    value: 12.5,
                    error: Some(0.5)
                }]
            );
            assert!(out.start.is_some() && out.end.is_some());
        }

        #[test]
        fn test_failed_trial_reports_no_values() {
            let trial = trial_with_values(
                vec![TrialValue {
                    name: "cost".to_string(),
                    value: "garbage".to_string(),
                    ..Default::default()
                }],
                true,
            );
            let out = trial_values(&trial).unwrap();
            assert!(out.failed);
            assert!(out.values.is_empty());
        }

        #[test]
        fn test_unparseable_value_is_an_error() {
            let trial = trial_with_values(
                vec![TrialValue {
                    name: "cost".to_string(),
                    value: "fast".to_string(),
                    ..Default::default()
                }],
                false,
            );
            assert!(matches!(trial_values(&trial), Err(Error::Serialization(_))));
        }
    }

    mod population {
        use super::*;

        #[test]
        fn test_trial_name_from_report_url() {
            assert_eq!(
                trial_name("tuning-", "http://x/experiments/tuning/trials/7"),
                "tuning-007"
            );
            assert_eq!(
                trial_name("tuning-", "http://x/experiments/tuning/trials/1234/"),
                "tuning-1234"
            );
            assert_eq!(
                trial_name("tuning-", "http://x/experiments/tuning/trials/abc"),
                "tuning-abc"
            );
        }

        /// Story: A single local trial runs next to its experiment
        #[test]
        fn story_single_replica_in_experiment_namespace() {
            let trial = populate_trial(
                &experiment(),
                "default",
                &suggestion("http://x/experiments/tuning/trials/3"),
            )
            .unwrap();
            assert_eq!(trial.metadata.name.as_deref(), Some("tuning-003"));
            assert_eq!(trial.metadata.generate_name.as_deref(), Some("tuning-"));
            assert_eq!(trial.namespace().as_deref(), Some("default"));
            assert!(trial.spec.target_namespace.is_none());
            assert_eq!(
                trial.labels().get(LABEL_EXPERIMENT),
                Some(&"tuning".to_string())
            );
            assert_eq!(
                trial.report_url(),
                Some("http://x/experiments/tuning/trials/3")
            );
            assert_eq!(
                trial.spec.experiment_ref.as_ref().unwrap().uid.as_deref(),
                Some("uid-1")
            );
            assert_eq!(
                trial.spec.assignments,
                vec![Assignment {
                    name: "cpu".to_string(),
                    value: 750
                }]
            );
        }

        /// Story: A namespace selector spreads trials over namespaces
        #[test]
        fn story_selected_namespace_becomes_target() {
            let mut exp = experiment();
            exp.spec.namespace_selector = Some(LabelSelector::default());
            let trial =
                populate_trial(&exp, "ns2", &suggestion("http://x/trials/9")).unwrap();
            assert_eq!(trial.namespace().as_deref(), Some("ns2"));
            assert_eq!(trial.spec.target_namespace.as_deref(), Some("ns2"));
            // Foreign namespace: trial is named after the experiment
            assert_eq!(trial.metadata.name.as_deref(), Some("tuning"));
        }

        #[test]
        fn test_template_labels_are_kept() {
            let mut exp = experiment();
            exp.spec
                .template
                .metadata
                .labels
                .insert("app".to_string(), "web".to_string());
            let trial = populate_trial(&exp, "default", &suggestion("http://x/t/1")).unwrap();
            assert_eq!(trial.labels().len(), 1);
            assert_eq!(trial.labels().get("app"), Some(&"web".to_string()));
        }

        #[test]
        fn test_exhausted_answer_cannot_populate() {
            assert!(populate_trial(&experiment(), "default", &NextTrial::Exhausted).is_err());
        }
    }
}
