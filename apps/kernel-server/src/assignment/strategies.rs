// [[AXON]]/apps/kernel-server/src/assignment/strategies.rs
// Purpose: The five routing strategies and the selection precedence.
// Architecture: Domain Logic Layer
// Dependencies: rand

use rand::seq::SliceRandom;
use std::collections::HashSet;

use super::rules::RuleBook;
use super::AssignError;
use crate::config::AssignmentConfig;
use crate::models::{Agent, Task, TaskPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    CapabilityMatch,
    CostOptimized,
    PerformanceBased,
}

impl Strategy {
    pub fn label(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastLoaded => "least-loaded",
            Strategy::CapabilityMatch => "capability-match",
            Strategy::CostOptimized => "cost-optimized",
            Strategy::PerformanceBased => "performance-based",
        }
    }
}

/// Precedence: high/urgent priority forces performance-based; the
/// cost_sensitive tag forces cost-optimized; an explicit rule wins next;
/// capability-match is the default.
pub fn select(task: &Task, rules: &RuleBook) -> Strategy {
    if matches!(task.priority, TaskPriority::High | TaskPriority::Urgent) {
        return Strategy::PerformanceBased;
    }
    if task.is_cost_sensitive() {
        return Strategy::CostOptimized;
    }
    if let Some(strategy) = rules.strategy_for(task) {
        return strategy;
    }
    Strategy::CapabilityMatch
}

pub fn pick(
    strategy: Strategy,
    task: &Task,
    eligible: &[&Agent],
    cfg: &AssignmentConfig,
    rr_cursor: &mut usize,
) -> Result<String, AssignError> {
    match strategy {
        Strategy::RoundRobin => round_robin(eligible, rr_cursor),
        Strategy::LeastLoaded => least_loaded(eligible),
        Strategy::CapabilityMatch => capability_match(task, eligible),
        Strategy::CostOptimized => cost_optimized(task, eligible),
        Strategy::PerformanceBased => performance_based(eligible, cfg),
    }
}

/// Cyclic pointer over the eligible set. The cursor is per tenant and only
/// advances on use, so an idle tenant doesn't drift.
fn round_robin(eligible: &[&Agent], cursor: &mut usize) -> Result<String, AssignError> {
    if eligible.is_empty() {
        return Err(AssignError::NoEligibleAgent);
    }
    let chosen = eligible[*cursor % eligible.len()].id.clone();
    *cursor = (*cursor + 1) % eligible.len();
    Ok(chosen)
}

/// Score = 0.7 * active + 0.3 * queued; lowest wins, random tie-break.
fn least_loaded(eligible: &[&Agent]) -> Result<String, AssignError> {
    let best = eligible
        .iter()
        .map(|a| a.workload_score())
        .fold(f64::INFINITY, f64::min);
    let tied: Vec<&&Agent> = eligible
        .iter()
        .filter(|a| (a.workload_score() - best).abs() < f64::EPSILON)
        .collect();
    tied.choose(&mut rand::thread_rng())
        .map(|a| a.id.clone())
        .ok_or(AssignError::NoEligibleAgent)
}

/// Candidates must carry a superset of the required capabilities; among
/// supersets the smallest capability set wins (most specialized agent),
/// random tie-break.
fn capability_match(task: &Task, eligible: &[&Agent]) -> Result<String, AssignError> {
    let required: HashSet<String> = task.required_capabilities();
    let supersets: Vec<&&Agent> = eligible
        .iter()
        .filter(|a| required.iter().all(|c| a.capabilities.contains(c)))
        .collect();
    if supersets.is_empty() {
        return Err(AssignError::NoMatchingCapability);
    }
    let smallest = supersets
        .iter()
        .map(|a| a.capabilities.len())
        .min()
        .unwrap_or(0);
    let tied: Vec<&&&Agent> = supersets
        .iter()
        .filter(|a| a.capabilities.len() == smallest)
        .collect();
    tied.choose(&mut rand::thread_rng())
        .map(|a| a.id.clone())
        .ok_or(AssignError::NoMatchingCapability)
}

/// Cost = rate * estimated hours, lowest wins among capability matches.
/// Agents without a published rate are considered last.
fn cost_optimized(task: &Task, eligible: &[&Agent]) -> Result<String, AssignError> {
    let required: HashSet<String> = task.required_capabilities();
    let hours = task.estimated_hours();
    let mut matching: Vec<&&Agent> = eligible
        .iter()
        .filter(|a| required.iter().all(|c| a.capabilities.contains(c)))
        .collect();
    if matching.is_empty() {
        return Err(AssignError::NoMatchingCapability);
    }
    matching.sort_by(|a, b| {
        let cost_a = a.cost_rate.map(|r| r * hours).unwrap_or(f64::INFINITY);
        let cost_b = b.cost_rate.map(|r| r * hours).unwrap_or(f64::INFINITY);
        cost_a.partial_cmp(&cost_b).unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(matching[0].id.clone())
}

/// Score = w0 * success_rate + w1 * (1 / avg_completion) + w2 * availability,
/// components normalized to [0, 1] across the candidate set; highest wins.
fn performance_based(eligible: &[&Agent], cfg: &AssignmentConfig) -> Result<String, AssignError> {
    if eligible.is_empty() {
        return Err(AssignError::NoEligibleAgent);
    }
    let [w_success, w_speed, w_avail] = cfg.performance_weights;

    let speeds: Vec<f64> = eligible
        .iter()
        .map(|a| {
            if a.avg_completion_secs > 0.0 {
                1.0 / a.avg_completion_secs
            } else {
                // No history yet: treat as fast rather than unrankable.
                1.0
            }
        })
        .collect();
    let max_speed = speeds.iter().cloned().fold(f64::MIN, f64::max).max(f64::MIN_POSITIVE);

    let mut best: Option<(f64, &str)> = None;
    for (agent, speed) in eligible.iter().zip(speeds.iter()) {
        let score = w_success * agent.success_rate.clamp(0.0, 1.0)
            + w_speed * (speed / max_speed)
            + w_avail * agent.availability.clamp(0.0, 1.0);
        match best {
            Some((top, _)) if score <= top => {}
            _ => best = Some((score, &agent.id)),
        }
    }
    best.map(|(_, id)| id.to_string())
        .ok_or(AssignError::NoEligibleAgent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::tests::{agent, task_with};
    use serde_json::json;

    fn cfg() -> AssignmentConfig {
        AssignmentConfig::default()
    }

    #[test]
    fn selection_precedence() {
        let rules = RuleBook::with_defaults();
        let urgent = task_with(json!({}), TaskPriority::Urgent);
        assert_eq!(select(&urgent, &rules), Strategy::PerformanceBased);

        let costed = task_with(json!({"cost_sensitive": true}), TaskPriority::Normal);
        assert_eq!(select(&costed, &rules), Strategy::CostOptimized);

        let plain = task_with(json!({}), TaskPriority::Normal);
        assert_eq!(select(&plain, &rules), Strategy::CapabilityMatch);
    }

    #[test]
    fn rule_book_overrides_default() {
        let rules = RuleBook::with_defaults();
        rules.register(super::super::rules::AssignmentRule {
            id: "bulk".to_string(),
            name: "bulk imports spread evenly".to_string(),
            task_type: "bulk-import".to_string(),
            strategy: Strategy::RoundRobin,
        });
        let mut task = task_with(json!({}), TaskPriority::Normal);
        task.task_type = "bulk-import".to_string();
        assert_eq!(select(&task, &rules), Strategy::RoundRobin);
    }

    #[test]
    fn capability_match_prefers_most_specialized_superset() {
        // Spec scenario: A1={build,test}, A2={build}; task requires both.
        let a1 = agent("A1", &["build", "test"]);
        let a2 = agent("A2", &["build"]);
        let task = task_with(json!({"required_capabilities": ["build", "test"]}), TaskPriority::Normal);
        // The task type "build" is also a required capability.
        let eligible = vec![&a1, &a2];
        let chosen = capability_match(&task, &eligible).unwrap();
        assert_eq!(chosen, "A1");
    }

    #[test]
    fn capability_match_smallest_superset_wins() {
        let generalist = agent("generalist", &["build", "test", "deploy", "review"]);
        let specialist = agent("specialist", &["build", "test"]);
        let task = task_with(json!({"required_capabilities": ["test"]}), TaskPriority::Normal);
        let eligible = vec![&generalist, &specialist];
        assert_eq!(capability_match(&task, &eligible).unwrap(), "specialist");
    }

    #[test]
    fn capability_match_reports_missing_capability() {
        let a = agent("A", &["docs"]);
        let task = task_with(json!({"required_capabilities": ["build"]}), TaskPriority::Normal);
        let eligible = vec![&a];
        assert!(matches!(
            capability_match(&task, &eligible),
            Err(AssignError::NoMatchingCapability)
        ));
    }

    #[test]
    fn least_loaded_weighs_active_over_queued() {
        let mut busy = agent("busy", &["build"]);
        busy.active_tasks = 10;
        busy.queued_tasks = 0;
        let mut queued = agent("queued", &["build"]);
        queued.active_tasks = 0;
        queued.queued_tasks = 10;
        // 0.7*10 = 7.0 vs 0.3*10 = 3.0
        let eligible = vec![&busy, &queued];
        assert_eq!(least_loaded(&eligible).unwrap(), "queued");
    }

    #[test]
    fn round_robin_cycles() {
        let a = agent("a", &[]);
        let b = agent("b", &[]);
        let c = agent("c", &[]);
        let eligible = vec![&a, &b, &c];
        let mut cursor = 0;
        let picks: Vec<String> = (0..4)
            .map(|_| round_robin(&eligible, &mut cursor).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn cost_optimized_picks_cheapest_matching() {
        let mut cheap = agent("cheap", &["build"]);
        cheap.cost_rate = Some(5.0);
        let mut pricey = agent("pricey", &["build"]);
        pricey.cost_rate = Some(50.0);
        let mut unpriced = agent("unpriced", &["build"]);
        unpriced.cost_rate = None;
        let task = task_with(json!({"estimated_hours": 2.0}), TaskPriority::Normal);
        let eligible = vec![&pricey, &unpriced, &cheap];
        assert_eq!(cost_optimized(&task, &eligible).unwrap(), "cheap");
    }

    #[test]
    fn performance_based_highest_score_wins() {
        let mut fast = agent("fast", &[]);
        fast.success_rate = 0.9;
        fast.avg_completion_secs = 10.0;
        fast.availability = 0.9;
        let mut slow = agent("slow", &[]);
        slow.success_rate = 0.9;
        slow.avg_completion_secs = 1000.0;
        slow.availability = 0.9;
        let eligible = vec![&slow, &fast];
        assert_eq!(performance_based(&eligible, &cfg()).unwrap(), "fast");
    }

    #[test]
    fn performance_based_success_rate_dominates() {
        let mut reliable = agent("reliable", &[]);
        reliable.success_rate = 1.0;
        reliable.avg_completion_secs = 100.0;
        reliable.availability = 0.5;
        let mut flaky = agent("flaky", &[]);
        flaky.success_rate = 0.1;
        flaky.avg_completion_secs = 100.0;
        flaky.availability = 0.5;
        let eligible = vec![&flaky, &reliable];
        assert_eq!(performance_based(&eligible, &cfg()).unwrap(), "reliable");
    }
}
