//! Namespace slot allocation
//!
//! Each active trial occupies the namespace it targets. A new trial may only
//! be placed in a namespace no active trial is using, and only while the
//! number of active trials is below the experiment's replica count.

use std::collections::BTreeSet;

use kube::ResourceExt;

use crate::conditions::is_active;
use crate::crd::{Experiment, Trial};

/// Pick the namespace for the next trial of `experiment`
///
/// `candidates` are the namespaces matching the experiment's namespace
/// selector, in list order; they are ignored when no selector is configured
/// and the experiment's own namespace is the only slot. Returns None when the
/// experiment is at capacity or every eligible namespace is occupied.
pub fn find_available_namespace(
    experiment: &Experiment,
    trials: &[Trial],
    candidates: &[String],
) -> Option<String> {
    let active: Vec<&Trial> = trials.iter().filter(|t| is_active(t)).collect();
    let replicas = usize::try_from(experiment.replicas()).unwrap_or(0);
    if active.len() >= replicas {
        return None;
    }

    let in_use: BTreeSet<String> = active.iter().map(|t| t.target_namespace()).collect();

    if experiment.spec.namespace_selector.is_some() {
        return candidates.iter().find(|ns| !in_use.contains(*ns)).cloned();
    }

    experiment
        .namespace()
        .filter(|ns| !in_use.contains(ns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Condition, ConditionStatus, ExperimentSpec, TrialConditionType, TrialSpec, TrialStatus,
    };
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    fn experiment(replicas: i32, selector: bool) -> Experiment {
        let mut exp = Experiment::new(
            "tuning",
            ExperimentSpec {
                replicas: Some(replicas),
                namespace_selector: selector.then(|| LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "tuning".to_string(),
                        "enabled".to_string(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        exp.metadata.namespace = Some("default".to_string());
        exp
    }

    fn trial(
        name: &str,
        namespace: &str,
        conditions: &[(TrialConditionType, ConditionStatus)],
    ) -> Trial {
        let mut t = Trial::new(name, TrialSpec::default());
        t.metadata.namespace = Some(namespace.to_string());
        let now = Utc::now();
        t.status = Some(TrialStatus {
            conditions: conditions
                .iter()
                .map(|(type_, status)| Condition::new(type_.as_str(), *status, "", "", now))
                .collect(),
            ..Default::default()
        });
        t
    }

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_first_free_candidate_is_chosen() {
        let ns = find_available_namespace(&experiment(2, true), &[], &candidates(&["ns1", "ns2"]));
        assert_eq!(ns.as_deref(), Some("ns1"));
    }

    #[test]
    fn test_occupied_candidates_are_skipped() {
        let trials = vec![trial("t1", "ns1", &[])];
        let ns = find_available_namespace(
            &experiment(2, true),
            &trials,
            &candidates(&["ns1", "ns2"]),
        );
        assert_eq!(ns.as_deref(), Some("ns2"));
    }

    #[test]
    fn test_target_namespace_marks_the_slot() {
        let mut t = trial("t1", "default", &[]);
        t.spec.target_namespace = Some("ns2".to_string());
        let ns = find_available_namespace(
            &experiment(3, true),
            &[t],
            &candidates(&["ns2", "ns3"]),
        );
        assert_eq!(ns.as_deref(), Some("ns3"));
    }

    #[test]
    fn test_capacity_blocks_even_with_free_namespaces() {
        let trials = vec![trial("t1", "ns1", &[])];
        let ns = find_available_namespace(
            &experiment(1, true),
            &trials,
            &candidates(&["ns1", "ns2", "ns3"]),
        );
        assert_eq!(ns, None);
    }

    #[test]
    fn test_zero_replicas_never_allocates() {
        assert_eq!(
            find_available_namespace(&experiment(0, false), &[], &[]),
            None
        );
    }

    #[test]
    fn test_without_selector_uses_experiment_namespace() {
        let exp = experiment(1, false);
        assert_eq!(
            find_available_namespace(&exp, &[], &candidates(&["ns1"])).as_deref(),
            Some("default")
        );
    }

    #[test]
    fn test_without_selector_experiment_namespace_in_use() {
        let trials = vec![trial("t1", "default", &[])];
        assert_eq!(
            find_available_namespace(&experiment(2, false), &trials, &[]),
            None
        );
    }

    /// Story: a finished trial whose teardown has not run still holds its slot
    #[test]
    fn story_pending_cleanup_blocks_the_slot() {
        let finished = trial(
            "t1",
            "ns1",
            &[
                (TrialConditionType::Complete, ConditionStatus::True),
                (TrialConditionType::SetupDeleted, ConditionStatus::Unknown),
            ],
        );
        let exp = experiment(2, true);

        let ns = find_available_namespace(&exp, &[finished.clone()], &candidates(&["ns1"]));
        assert_eq!(ns, None);

        // Once teardown completes the namespace is free again
        let mut cleaned = finished;
        if let Some(status) = cleaned.status.as_mut() {
            status.conditions[1].status = ConditionStatus::True;
        }
        let ns = find_available_namespace(&exp, &[cleaned], &candidates(&["ns1"]));
        assert_eq!(ns.as_deref(), Some("ns1"));
    }

    #[test]
    fn test_finished_trial_without_setup_frees_the_slot() {
        let failed = trial(
            "t1",
            "default",
            &[(TrialConditionType::Failed, ConditionStatus::True)],
        );
        assert_eq!(
            find_available_namespace(&experiment(1, false), &[failed], &[]).as_deref(),
            Some("default")
        );
    }
}
