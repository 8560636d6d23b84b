//! Reconciler - turns (desired, observed) into an ordered action plan.
//!
//! The reconciler is pure: it reads nothing but its arguments and never
//! fails. The controller executes the returned actions strictly in order.
//!
//! Plan order for a live resource:
//! 1. scale down, oldest units first
//! 2. scale up with the desired template
//! 3. roll stale units, oldest first, one at a time
//!
//! Rolling keeps the unit count inside
//! `[replicas - max_unavailable, replicas + max_surge]`. The default
//! [`RolloutStrategy::InPlace`] updates each stale unit under its existing id,
//! so the count never moves. [`RolloutStrategy::Replace`] creates a
//! replacement before deleting each stale unit, peaking at `replicas + 1`.

use crate::types::{DesiredSpec, ObservedStatus, ReconcileAction, RolloutStrategy, Unit};

/// Compute the actions that move `observed` towards `desired`.
pub fn plan(
    desired: Option<&DesiredSpec>,
    observed: Option<&ObservedStatus>,
) -> Vec<ReconcileAction> {
    match (desired, observed) {
        (None, None) => Vec::new(),
        (None, Some(status)) => teardown(&status.units),
        (Some(spec), None) => (0..spec.replicas).map(|_| create(spec)).collect(),
        (Some(spec), Some(status)) => converge(spec, &status.units),
    }
}

/// Delete everything, newest first.
fn teardown(units: &[Unit]) -> Vec<ReconcileAction> {
    units.iter().rev().map(delete).collect()
}

fn converge(spec: &DesiredSpec, units: &[Unit]) -> Vec<ReconcileAction> {
    let replicas = spec.replicas as usize;
    let mut actions = Vec::new();

    // Units are stored oldest first, so the excess is a prefix.
    let excess = units.len().saturating_sub(replicas);
    let (evicted, kept) = units.split_at(excess);
    actions.extend(evicted.iter().map(delete));

    actions.extend((kept.len()..replicas).map(|_| create(spec)));

    // Replace without surge room would exceed the bound; fall back to in-place.
    let replace = spec.strategy == RolloutStrategy::Replace && spec.max_surge >= 1;
    for unit in kept.iter().filter(|u| u.template != spec.template) {
        if replace {
            actions.push(create(spec));
            actions.push(delete(unit));
        } else {
            actions.push(ReconcileAction::Update {
                unit_id: unit.id.clone(),
                template: spec.template.clone(),
            });
        }
    }

    actions
}

fn create(spec: &DesiredSpec) -> ReconcileAction {
    ReconcileAction::Create {
        template: spec.template.clone(),
    }
}

fn delete(unit: &Unit) -> ReconcileAction {
    ReconcileAction::Delete {
        unit_id: unit.id.clone(),
    }
}

/// Lowest and highest unit count while `plan` runs from `start`.
///
/// An in-place update keeps its unit, so it does not move the count.
pub fn live_count_bounds(start: usize, plan: &[ReconcileAction]) -> (usize, usize) {
    let mut live = start;
    let (mut low, mut high) = (start, start);

    for action in plan {
        match action {
            ReconcileAction::Create { .. } => {
                live += 1;
                high = high.max(live);
            }
            ReconcileAction::Delete { .. } => {
                live = live.saturating_sub(1);
                low = low.min(live);
            }
            ReconcileAction::Update { .. } => {}
        }
    }

    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObservedStatus, UnitTemplate};
    use chrono::Utc;

    const STRATEGIES: [RolloutStrategy; 2] = [RolloutStrategy::InPlace, RolloutStrategy::Replace];

    fn template(image: &str) -> UnitTemplate {
        UnitTemplate::new(image)
    }

    fn spec(replicas: u32, image: &str) -> DesiredSpec {
        DesiredSpec::new(replicas, template(image))
    }

    /// Status with units `u0..un`, oldest first.
    fn observed(count: usize, image: &str) -> ObservedStatus {
        let mut status = ObservedStatus::empty(1);
        status.units = (0..count)
            .map(|i| Unit {
                id: format!("u{}", i),
                template: template(image),
                created_at: Utc::now(),
            })
            .collect();
        status
    }

    /// Apply a plan assuming every call succeeds.
    fn apply(mut status: ObservedStatus, plan: &[ReconcileAction], next_id: &mut usize) -> ObservedStatus {
        for action in plan {
            match action {
                ReconcileAction::Create { template } => {
                    status.units.push(Unit {
                        id: format!("n{}", next_id),
                        template: template.clone(),
                        created_at: Utc::now(),
                    });
                    *next_id += 1;
                }
                ReconcileAction::Delete { unit_id } => status.units.retain(|u| &u.id != unit_id),
                ReconcileAction::Update { unit_id, template } => {
                    let unit = status.units.iter_mut().find(|u| &u.id == unit_id).unwrap();
                    unit.template = template.clone();
                }
            }
        }
        status
    }

    fn deleted_ids(plan: &[ReconcileAction]) -> Vec<&str> {
        plan.iter()
            .filter_map(|a| match a {
                ReconcileAction::Delete { unit_id } => Some(unit_id.as_str()),
                _ => None,
            })
            .collect()
    }

    fn count_kind(plan: &[ReconcileAction], kind: &str) -> usize {
        plan.iter().filter(|a| a.kind() == kind).count()
    }

    #[test]
    fn test_nothing_to_do_without_state() {
        assert!(plan(None, None).is_empty());
    }

    #[test]
    fn test_fresh_resource_creates_replicas() {
        let desired = spec(3, "nginx:1");
        let actions = plan(Some(&desired), None);

        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|a| *a
            == ReconcileAction::Create {
                template: template("nginx:1")
            }));
    }

    #[test]
    fn test_scale_up_creates_difference() {
        let actions = plan(Some(&spec(5, "nginx:1")), Some(&observed(3, "nginx:1")));
        assert_eq!(actions.len(), 2);
        assert_eq!(count_kind(&actions, "create"), 2);
    }

    #[test]
    fn test_teardown_is_newest_first() {
        let actions = plan(None, Some(&observed(3, "nginx:1")));
        assert_eq!(deleted_ids(&actions), vec!["u2", "u1", "u0"]);
        assert_eq!(actions.len(), 3);
    }

    #[test]
    fn test_teardown_of_empty_status_is_empty() {
        assert!(plan(None, Some(&observed(0, "nginx:1"))).is_empty());
    }

    #[test]
    fn test_scale_down_evicts_oldest() {
        for n in 1..8usize {
            for k in 0..=n {
                let desired = spec((n - k) as u32, "nginx:1");
                let actions = plan(Some(&desired), Some(&observed(n, "nginx:1")));

                let expected: Vec<String> = (0..k).map(|i| format!("u{}", i)).collect();
                assert_eq!(deleted_ids(&actions), expected, "n={} k={}", n, k);
                assert_eq!(actions.len(), k);
            }
        }
    }

    #[test]
    fn test_idempotent_when_satisfied() {
        for replicas in 0..6 {
            let desired = spec(replicas, "nginx:1");
            let status = observed(replicas as usize, "nginx:1");
            assert!(status.satisfies(&desired));
            assert!(plan(Some(&desired), Some(&status)).is_empty());
        }
    }

    fn updated_ids(plan: &[ReconcileAction], image: &str) -> Vec<String> {
        plan.iter()
            .map(|a| match a {
                ReconcileAction::Update { unit_id, template } => {
                    assert_eq!(template.image, image);
                    unit_id.clone()
                }
                other => panic!("unexpected action {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_template_change_updates_in_place_by_default() {
        let desired = spec(3, "nginx:2");
        let actions = plan(Some(&desired), Some(&observed(3, "nginx:1")));

        assert_eq!(updated_ids(&actions, "nginx:2"), vec!["u0", "u1", "u2"]);
    }

    #[test]
    fn test_rolling_update_in_place_when_unavailability_allowed() {
        let desired = spec(3, "nginx:2").with_rollout(0, 1);
        let actions = plan(Some(&desired), Some(&observed(3, "nginx:1")));

        assert_eq!(updated_ids(&actions, "nginx:2"), vec!["u0", "u1", "u2"]);
    }

    #[test]
    fn test_replace_strategy_surges() {
        let desired = spec(2, "nginx:2")
            .with_rollout(1, 0)
            .with_strategy(RolloutStrategy::Replace);
        let actions = plan(Some(&desired), Some(&observed(2, "nginx:1")));

        assert_eq!(
            actions,
            vec![
                ReconcileAction::Create {
                    template: template("nginx:2")
                },
                ReconcileAction::Delete {
                    unit_id: "u0".into()
                },
                ReconcileAction::Create {
                    template: template("nginx:2")
                },
                ReconcileAction::Delete {
                    unit_id: "u1".into()
                },
            ]
        );
    }

    #[test]
    fn test_replace_without_surge_updates_in_place() {
        let desired = spec(2, "nginx:2")
            .with_rollout(0, 1)
            .with_strategy(RolloutStrategy::Replace);
        let actions = plan(Some(&desired), Some(&observed(2, "nginx:1")));

        assert_eq!(updated_ids(&actions, "nginx:2"), vec!["u0", "u1"]);
    }

    #[test]
    fn test_only_stale_units_are_rolled() {
        let desired = spec(3, "nginx:2").with_rollout(1, 1);
        let mut status = observed(3, "nginx:2");
        status.units[1].template = template("nginx:1");

        let actions = plan(Some(&desired), Some(&status));
        assert_eq!(
            actions,
            vec![ReconcileAction::Update {
                unit_id: "u1".into(),
                template: template("nginx:2")
            }]
        );
    }

    #[test]
    fn test_rolling_bounds_hold() {
        for replicas in 1..7u32 {
            for (surge, unavailable) in [(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (3, 2)] {
                for stale in 0..=replicas as usize {
                    for strategy in STRATEGIES {
                        let desired = spec(replicas, "app:new")
                            .with_rollout(surge, unavailable)
                            .with_strategy(strategy);
                        let mut status = observed(replicas as usize, "app:new");
                        for unit in status.units.iter_mut().take(stale) {
                            unit.template = template("app:old");
                        }

                        let actions = plan(Some(&desired), Some(&status));
                        let (low, high) = live_count_bounds(status.count(), &actions);
                        let r = replicas as usize;
                        let ctx = format!("r={} s={} u={} {:?}", r, surge, unavailable, strategy);
                        assert!(high <= r + surge as usize, "{}", ctx);
                        assert!(low + unavailable as usize >= r, "{}", ctx);
                    }
                }
            }
        }
    }

    #[test]
    fn test_bounds_hold_while_scaling_and_rolling() {
        for start in 0..7usize {
            for replicas in 0..7u32 {
                for ((surge, unavailable), strategy) in [(1, 0), (0, 1), (2, 1)]
                    .into_iter()
                    .flat_map(|b| STRATEGIES.map(|s| (b, s)))
                {
                    let desired = spec(replicas, "app:new")
                        .with_rollout(surge, unavailable)
                        .with_strategy(strategy);
                    let status = observed(start, "app:old");

                    let actions = plan(Some(&desired), Some(&status));
                    let (low, high) = live_count_bounds(start, &actions);
                    let r = replicas as usize;
                    assert!(high <= start.max(r + surge as usize));
                    assert!(low + unavailable as usize >= start.min(r));
                }
            }
        }
    }

    #[test]
    fn test_converges_in_one_pass() {
        let mut next_id = 0;
        for start in 0..6usize {
            for replicas in 0..6u32 {
                for strategy in STRATEGIES {
                    let desired = spec(replicas, "app:new").with_strategy(strategy);
                    let mut status = observed(start, "app:old");

                    let mut passes = 0;
                    loop {
                        let actions = plan(Some(&desired), Some(&status));
                        if actions.is_empty() {
                            break;
                        }
                        status = apply(status, &actions, &mut next_id);
                        passes += 1;
                        assert!(passes <= 2, "no fixed point from {} to {}", start, replicas);
                    }

                    assert_eq!(status.count(), replicas as usize);
                    assert!(status.satisfies(&desired));
                    assert!(passes <= 1);
                }
            }
        }
    }

    #[test]
    fn test_live_count_bounds() {
        let actions = vec![
            ReconcileAction::Create {
                template: template("a"),
            },
            ReconcileAction::Delete {
                unit_id: "u0".into(),
            },
            ReconcileAction::Update {
                unit_id: "u1".into(),
                template: template("a"),
            },
        ];
        assert_eq!(live_count_bounds(2, &actions), (2, 3));
        assert_eq!(live_count_bounds(0, &[]), (0, 0));
    }
}
