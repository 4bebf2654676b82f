// [[AXON]]/apps/kernel-server/src/protocol/methods.rs
// Purpose: The method table. String names on the JSON wire, numeric ids on the binary wire.
// Architecture: Protocol Layer
// Dependencies: std

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "initialized";
pub const PING: &str = "ping";
pub const SHUTDOWN: &str = "shutdown";

pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";
pub const RESOURCES_LIST: &str = "resources/list";
pub const RESOURCES_READ: &str = "resources/read";
pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
pub const PROMPTS_LIST: &str = "prompts/list";

pub const TASK_CREATE: &str = "task.create";
pub const TASK_STATUS: &str = "task.status";
pub const TASK_CANCEL: &str = "task.cancel";
pub const TASK_LIST: &str = "task.list";
pub const WORKFLOW_EXECUTE: &str = "workflow.execute";
pub const WORKFLOW_LIST: &str = "workflow.list";
pub const CONTEXT_UPDATE: &str = "context.update";
pub const CONTEXT_GET: &str = "context.get";
pub const SEARCH_SEMANTIC: &str = "search.semantic";

/// Server-to-client event notifications (task/workflow/document topics).
pub const NOTIFY_EVENT: &str = "notifications/event";

/// Numeric ids parallel the string table. Id 0 is reserved for "no method"
/// (responses, pings). Stable: appending only.
const TABLE: &[(u16, &str)] = &[
    (1, INITIALIZE),
    (2, INITIALIZED),
    (3, PING),
    (4, SHUTDOWN),
    (10, TOOLS_LIST),
    (11, TOOLS_CALL),
    (12, RESOURCES_LIST),
    (13, RESOURCES_READ),
    (14, RESOURCES_SUBSCRIBE),
    (15, PROMPTS_LIST),
    (20, TASK_CREATE),
    (21, TASK_STATUS),
    (22, TASK_CANCEL),
    (23, TASK_LIST),
    (30, WORKFLOW_EXECUTE),
    (31, WORKFLOW_LIST),
    (40, CONTEXT_UPDATE),
    (41, CONTEXT_GET),
    (50, SEARCH_SEMANTIC),
    (60, NOTIFY_EVENT),
];

pub fn method_to_id(method: &str) -> Option<u16> {
    TABLE.iter().find(|(_, m)| *m == method).map(|(id, _)| *id)
}

pub fn id_to_method(id: u16) -> Option<&'static str> {
    TABLE.iter().find(|(i, _)| *i == id).map(|(_, m)| *m)
}

/// Coarse method class used for per-session rate limiting. Tool and search
/// calls are the expensive ones and get their own buckets.
pub fn method_class(method: &str) -> &'static str {
    if method.starts_with("tools/") {
        "tools"
    } else if method.starts_with("resources/") || method.starts_with("prompts/") {
        "resources"
    } else if method.starts_with("task.") {
        "tasks"
    } else if method.starts_with("workflow.") {
        "workflows"
    } else if method == SEARCH_SEMANTIC {
        "search"
    } else {
        "control"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_bijective() {
        for (id, method) in TABLE {
            assert_eq!(method_to_id(method), Some(*id));
            assert_eq!(id_to_method(*id), Some(*method));
        }
    }

    #[test]
    fn zero_is_reserved() {
        assert_eq!(id_to_method(0), None);
    }

    #[test]
    fn unknown_method_has_no_id() {
        assert_eq!(method_to_id("nope/never"), None);
    }

    #[test]
    fn method_classes() {
        assert_eq!(method_class(TOOLS_CALL), "tools");
        assert_eq!(method_class(TASK_CREATE), "tasks");
        assert_eq!(method_class(SEARCH_SEMANTIC), "search");
        assert_eq!(method_class(PING), "control");
    }
}
