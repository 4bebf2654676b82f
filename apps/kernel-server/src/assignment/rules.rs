// [[AXON]]/apps/kernel-server/src/assignment/rules.rs
// Purpose: Rule book mapping task types to configured routing strategies.
// Architecture: Domain Logic Layer
// Dependencies: DashMap

use dashmap::DashMap;

use super::strategies::Strategy;
use crate::models::Task;

#[derive(Debug, Clone)]
pub struct AssignmentRule {
    pub id: String,
    pub name: String,
    /// Exact task type, or a prefix ending in '*'.
    pub task_type: String,
    pub strategy: Strategy,
}

impl AssignmentRule {
    fn matches(&self, task_type: &str) -> bool {
        match self.task_type.strip_suffix('*') {
            Some(prefix) => task_type.starts_with(prefix),
            None => self.task_type == task_type,
        }
    }
}

/// Active routing rules. Operators register rules over the admin surface;
/// the defaults cover the platform's own background task types.
pub struct RuleBook {
    rules: DashMap<String, AssignmentRule>,
}

impl RuleBook {
    pub fn with_defaults() -> Self {
        let book = RuleBook {
            rules: DashMap::new(),
        };
        // Heartbeat-style maintenance work spreads evenly regardless of
        // capability weighting.
        book.register(AssignmentRule {
            id: "maintenance-rr".to_string(),
            name: "Maintenance tasks round-robin".to_string(),
            task_type: "maintenance.*".to_string(),
            strategy: Strategy::RoundRobin,
        });
        // Fan-out batches go wherever the queue is shortest.
        book.register(AssignmentRule {
            id: "batch-least-loaded".to_string(),
            name: "Batch shards to least-loaded".to_string(),
            task_type: "batch.*".to_string(),
            strategy: Strategy::LeastLoaded,
        });
        book
    }

    pub fn register(&self, rule: AssignmentRule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.rules.remove(id).is_some()
    }

    pub fn strategy_for(&self, task: &Task) -> Option<Strategy> {
        self.rules
            .iter()
            .find(|r| r.matches(&task.task_type))
            .map(|r| r.strategy)
    }

    pub fn list(&self) -> Vec<AssignmentRule> {
        self.rules.iter().map(|r| r.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::tests::task_with;
    use crate::models::TaskPriority;
    use serde_json::json;

    #[test]
    fn prefix_rules_match() {
        let book = RuleBook::with_defaults();
        let mut task = task_with(json!({}), TaskPriority::Normal);
        task.task_type = "maintenance.compact".to_string();
        assert_eq!(book.strategy_for(&task), Some(Strategy::RoundRobin));

        task.task_type = "batch.shard-7".to_string();
        assert_eq!(book.strategy_for(&task), Some(Strategy::LeastLoaded));

        task.task_type = "build".to_string();
        assert_eq!(book.strategy_for(&task), None);
    }

    #[test]
    fn exact_rules_match_and_remove() {
        let book = RuleBook::with_defaults();
        book.register(AssignmentRule {
            id: "r1".to_string(),
            name: "deploys by cost".to_string(),
            task_type: "deploy".to_string(),
            strategy: Strategy::CostOptimized,
        });
        let mut task = task_with(json!({}), TaskPriority::Normal);
        task.task_type = "deploy".to_string();
        assert_eq!(book.strategy_for(&task), Some(Strategy::CostOptimized));

        assert!(book.remove("r1"));
        assert_eq!(book.strategy_for(&task), None);
    }
}
