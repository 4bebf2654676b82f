// [[AXON]]/apps/kernel-server/src/workflow/mod.rs
// Purpose: Workflow execution engine. Stage state machine, step dispatch, compensation.
// Architecture: Domain Logic Layer
// Dependencies: tokio, dashmap, repo, assignment

pub mod steps;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assignment::AssignmentEngine;
use crate::config::WorkflowConfig;
use crate::error::{KernelError, KernelResult};
use crate::events::{DomainEvent, EventBus, EventTopic};
use crate::models::{
    ExecutionStatus, StepResult, StepStatus, StepType, Task, TaskPriority, TaskStatus,
    VectorClock, Workflow, WorkflowExecution, WorkflowStep, WorkflowType,
};
use crate::repo::Repositories;
use crate::resilience::BreakerRegistry;
use steps::ScriptRegistry;

const ACTOR: &str = "executor";

pub struct WorkflowExecutor {
    repos: Repositories,
    engine: Arc<AssignmentEngine>,
    breakers: Arc<BreakerRegistry>,
    http: reqwest::Client,
    events: EventBus,
    cfg: WorkflowConfig,
    scripts: ScriptRegistry,
    /// Live executions; cancelling the token cancels in-flight step waits.
    running: DashMap<Uuid, CancellationToken>,
}

impl WorkflowExecutor {
    pub fn new(
        repos: Repositories,
        engine: Arc<AssignmentEngine>,
        breakers: Arc<BreakerRegistry>,
        http: reqwest::Client,
        events: EventBus,
        cfg: WorkflowConfig,
        scripts: ScriptRegistry,
    ) -> Arc<Self> {
        Arc::new(WorkflowExecutor {
            repos,
            engine,
            breakers,
            http,
            events,
            cfg,
            scripts,
            running: DashMap::new(),
        })
    }

    /// Validate and launch a new execution. The run loop is spawned; the
    /// caller gets the execution id immediately.
    pub async fn start(
        self: &Arc<Self>,
        workflow: Arc<Workflow>,
        context: Value,
    ) -> KernelResult<Uuid> {
        if workflow.steps.is_empty() {
            return Err(KernelError::InvalidInput("workflow has no steps".into()));
        }
        let mut clock = VectorClock::default();
        clock.tick(ACTOR);
        let exec = WorkflowExecution {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id,
            status: ExecutionStatus::Pending,
            cursor: 0,
            step_results: Vec::new(),
            context,
            clock,
            version: 1,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.repos.workflows.create_execution(&exec).await?;
        let exec_id = exec.id;

        let executor = self.clone();
        let tenant_id = workflow.tenant_id;
        tokio::spawn(async move {
            executor.drive(tenant_id, exec_id).await;
        });
        Ok(exec_id)
    }

    /// Boot recovery: an execution left running by a previous process is
    /// unresumable (step state lived in that process), so it is marked
    /// failed rather than silently stalling forever.
    pub async fn recover_stranded(&self) -> KernelResult<usize> {
        let stranded = self.repos.workflows.list_stranded().await?;
        let count = stranded.len();
        for exec in stranded {
            tracing::warn!(
                "recovering stranded execution {} (status {:?})",
                exec.id,
                exec.status
            );
            if let Err(e) = self
                .force_fail(exec.tenant_id, exec.id, "kernel restarted during execution")
                .await
            {
                tracing::error!("could not recover execution {}: {}", exec.id, e);
            }
        }
        Ok(count)
    }

    /// Cancel a live execution: in-flight step waits observe the token.
    pub fn cancel(&self, exec_id: Uuid) -> bool {
        if let Some(entry) = self.running.get(&exec_id) {
            entry.cancel();
            true
        } else {
            false
        }
    }

    /// Outer driver: owns the cancellation token, converts run-loop errors
    /// into a failed execution, never lets an error escape the task.
    async fn drive(self: Arc<Self>, tenant_id: Uuid, exec_id: Uuid) {
        let cancel = CancellationToken::new();
        self.running.insert(exec_id, cancel.clone());

        let result = self.run_loop(tenant_id, exec_id, cancel).await;
        self.running.remove(&exec_id);

        if let Err(e) = result {
            tracing::error!("execution {} run loop failed: {}", exec_id, e);
            if let Err(persist_err) = self.force_fail(tenant_id, exec_id, &e.to_string()).await {
                // Unrecoverable storage error: alert the operator.
                tracing::error!(
                    "ALERT execution {} could not be marked failed: {}",
                    exec_id,
                    persist_err
                );
            }
        }
    }

    async fn force_fail(&self, tenant_id: Uuid, exec_id: Uuid, reason: &str) -> KernelResult<()> {
        let mut exec = self.repos.workflows.get_execution(tenant_id, exec_id).await?;
        if exec.status.is_terminal() {
            return Ok(());
        }
        let from = exec.status;
        exec.status = ExecutionStatus::Failed;
        exec.completed_at = Some(Utc::now());
        exec.clock.tick(ACTOR);
        let version = exec.version;
        self.repos
            .workflows
            .persist_transition(&exec, version, from, reason)
            .await?;
        self.publish(&exec, "workflow.failed", json!({"reason": reason}));
        Ok(())
    }

    async fn run_loop(
        self: &Arc<Self>,
        tenant_id: Uuid,
        exec_id: Uuid,
        cancel: CancellationToken,
    ) -> KernelResult<()> {
        let mut exec = self.repos.workflows.get_execution(tenant_id, exec_id).await?;
        let workflow = self
            .repos
            .workflows
            .get(tenant_id, exec.workflow_id)
            .await?;
        let mut version = exec.version;

        if exec.status == ExecutionStatus::Pending {
            self.transition(&mut exec, &mut version, ExecutionStatus::Running, "start")
                .await?;
            self.publish(&exec, "workflow.started", json!({}));
        }
        if exec.status != ExecutionStatus::Running {
            // Suspended or terminal: nothing to drive until resumed.
            return Ok(());
        }

        if workflow.workflow_type == WorkflowType::Parallel {
            return self.run_parallel_workflow(&workflow, exec, version, cancel).await;
        }

        while exec.cursor < workflow.steps.len() {
            if cancel.is_cancelled() {
                return self
                    .fail_with_compensation(&workflow, &mut exec, &mut version, "cancelled")
                    .await;
            }
            let step = workflow.steps[exec.cursor].clone();

            match step.step_type {
                // Hooks only fire on the compensation path; forward
                // execution records them as skipped.
                StepType::CompensationHook => {
                    exec.step_results.push(result_now(&step.id, StepStatus::Skipped, json!({}), 0));
                    exec.cursor += 1;
                    exec.clock.tick(ACTOR);
                    self.persist(&mut exec, &mut version, ExecutionStatus::Running, "skip hook")
                        .await?;
                }
                StepType::Approval => {
                    self.transition(&mut exec, &mut version, ExecutionStatus::Suspended, "awaiting approval")
                        .await?;
                    self.publish(
                        &exec,
                        "workflow.awaiting_approval",
                        json!({"step": step.id, "approvers": step.config.get("approvers")}),
                    );
                    return Ok(());
                }
                StepType::ConditionalBranch => {
                    let token = steps::evaluate_predicate(&step.config, &exec.context)?;
                    let target = step.next.get(&token).ok_or_else(|| {
                        KernelError::InvalidInput(format!(
                            "invalid-definition: no branch for outcome '{}' of step {}",
                            token, step.id
                        ))
                    })?;
                    let position = workflow
                        .steps
                        .iter()
                        .position(|s| &s.id == target)
                        .ok_or_else(|| {
                            KernelError::InvalidInput(format!(
                                "invalid-definition: branch target '{}' not found",
                                target
                            ))
                        })?;
                    if position <= exec.cursor {
                        return Err(KernelError::InvalidInput(format!(
                            "invalid-definition: branch target '{}' would move the cursor backwards",
                            target
                        )));
                    }
                    exec.step_results.push(result_now(
                        &step.id,
                        StepStatus::Succeeded,
                        json!({"branch": token}),
                        1,
                    ));
                    exec.cursor = position;
                    exec.clock.tick(ACTOR);
                    self.persist(&mut exec, &mut version, ExecutionStatus::Running, "branch")
                        .await?;
                }
                _ => {
                    let outcome = self
                        .run_step_with_retry(&workflow, &exec, &step, &cancel)
                        .await;
                    match outcome {
                        Ok((output, attempts)) => {
                            steps::set_path(
                                &mut exec.context,
                                &format!("steps.{}", step.id),
                                output.clone(),
                            );
                            exec.step_results.push(result_now(
                                &step.id,
                                StepStatus::Succeeded,
                                output,
                                attempts,
                            ));
                            // Explicit next-step rule, otherwise fall through.
                            exec.cursor = match step.next.get("default") {
                                Some(target) => {
                                    let position = workflow
                                        .steps
                                        .iter()
                                        .position(|s| &s.id == target)
                                        .ok_or_else(|| {
                                            KernelError::InvalidInput(format!(
                                                "invalid-definition: next target '{}' not found",
                                                target
                                            ))
                                        })?;
                                    if position <= exec.cursor {
                                        return Err(KernelError::InvalidInput(
                                            "invalid-definition: next target would move the cursor backwards".into(),
                                        ));
                                    }
                                    position
                                }
                                None => exec.cursor + 1,
                            };
                            exec.clock.tick(ACTOR);
                            self.persist(&mut exec, &mut version, ExecutionStatus::Running, "step ok")
                                .await?;
                            self.publish(&exec, "workflow.step_completed", json!({"step": step.id}));
                        }
                        Err((e, attempts)) => {
                            exec.step_results.push(result_now(
                                &step.id,
                                StepStatus::Failed,
                                json!({"error": e.to_string()}),
                                attempts,
                            ));
                            exec.clock.tick(ACTOR);
                            self.persist(&mut exec, &mut version, ExecutionStatus::Running, "step failed")
                                .await?;
                            return self
                                .fail_with_compensation(
                                    &workflow,
                                    &mut exec,
                                    &mut version,
                                    &e.to_string(),
                                )
                                .await;
                        }
                    }
                }
            }
        }

        exec.completed_at = Some(Utc::now());
        self.transition(&mut exec, &mut version, ExecutionStatus::Completed, "done")
            .await?;
        self.publish(&exec, "workflow.completed", json!({}));
        metrics::counter!("workflow_executions_total", "status" => "completed").increment(1);
        Ok(())
    }

    /// A parallel-type workflow runs its whole step list as one fan-out
    /// with policy `all`.
    async fn run_parallel_workflow(
        self: &Arc<Self>,
        workflow: &Workflow,
        mut exec: WorkflowExecution,
        mut version: i64,
        cancel: CancellationToken,
    ) -> KernelResult<()> {
        let fanout = WorkflowStep {
            id: "parallel-root".to_string(),
            step_type: StepType::ParallelFanOut,
            config: json!({
                "children": workflow.steps,
                "policy": "all",
            }),
            retry: Default::default(),
            next: Default::default(),
            timeout_secs: None,
        };
        match self.run_step_with_retry(workflow, &exec, &fanout, &cancel).await {
            Ok((output, attempts)) => {
                exec.step_results
                    .push(result_now(&fanout.id, StepStatus::Succeeded, output, attempts));
                exec.cursor = workflow.steps.len();
                exec.completed_at = Some(Utc::now());
                self.transition(&mut exec, &mut version, ExecutionStatus::Completed, "done")
                    .await?;
                self.publish(&exec, "workflow.completed", json!({}));
                Ok(())
            }
            Err((e, attempts)) => {
                exec.step_results.push(result_now(
                    &fanout.id,
                    StepStatus::Failed,
                    json!({"error": e.to_string()}),
                    attempts,
                ));
                self.fail_with_compensation(workflow, &mut exec, &mut version, &e.to_string())
                    .await
            }
        }
    }

    /// Run one step under its retry policy. Returns the output and the
    /// number of attempts spent.
    async fn run_step_with_retry(
        self: &Arc<Self>,
        workflow: &Workflow,
        exec: &WorkflowExecution,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> Result<(Value, u32), (KernelError, u32)> {
        let timeout = Duration::from_secs(
            step.timeout_secs
                .unwrap_or(self.cfg.default_step_timeout_secs),
        );
        with_retry(step, timeout, cancel, || {
            self.run_leaf_step(workflow, exec, step, cancel)
        })
        .await
    }

    async fn run_leaf_step(
        self: &Arc<Self>,
        workflow: &Workflow,
        exec: &WorkflowExecution,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        match step.step_type {
            StepType::ParallelFanOut => self.run_fanout_step(workflow, exec, step, cancel).await,
            _ => self.run_basic_step(exec, step, cancel).await,
        }
    }

    /// The leaf step types a fan-out child may also use. No recursion:
    /// nested fan-out is rejected up front.
    async fn run_basic_step(
        &self,
        exec: &WorkflowExecution,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        match step.step_type {
            StepType::Task => self.run_task_step(exec, step, cancel).await,
            StepType::Script => {
                let name = step
                    .config
                    .get("script")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| {
                        KernelError::InvalidInput(format!("script step {} missing 'script'", step.id))
                    })?;
                let script = self.scripts.get(name).ok_or_else(|| {
                    KernelError::NotFound(format!("script '{}' is not registered", name))
                })?;
                let params = step.config.get("params").cloned().unwrap_or(json!({}));
                script.run(params).await
            }
            StepType::Webhook => {
                let host = step
                    .config
                    .get("url")
                    .and_then(|u| u.as_str())
                    .and_then(url_host)
                    .unwrap_or_else(|| "webhook".to_string());
                let breaker = self.breakers.get(&format!("webhook:{}", host));
                let timeout = Duration::from_secs(
                    step.timeout_secs
                        .unwrap_or(self.cfg.default_step_timeout_secs),
                );
                steps::run_webhook(&self.http, &breaker, &step.config, timeout).await
            }
            other => Err(KernelError::InvalidInput(format!(
                "invalid-definition: step type {:?} cannot run as a leaf",
                other
            ))),
        }
    }

    /// Create a task through the assignment engine and wait for a terminal
    /// status, bounded by the surrounding step timeout.
    async fn run_task_step(
        &self,
        exec: &WorkflowExecution,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        let task_type = step
            .config
            .get("task_type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                KernelError::InvalidInput(format!("task step {} missing 'task_type'", step.id))
            })?;
        let priority: TaskPriority = step
            .config
            .get("priority")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| KernelError::InvalidInput(format!("bad priority: {}", e)))?
            .unwrap_or_default();

        let task = Task {
            id: Uuid::new_v4(),
            tenant_id: exec.tenant_id,
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            priority,
            title: step
                .config
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or(&step.id)
                .to_string(),
            parameters: step.config.get("parameters").cloned().unwrap_or(json!({})),
            assigned_to: None,
            delegated_from: None,
            parent_id: None,
            created_by: format!("workflow:{}", exec.workflow_id),
            idempotency_key: Some(format!("wfexec:{}:{}", exec.id, step.id)),
            version: 1,
            created_at: Utc::now(),
            assigned_at: None,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            deadline: None,
            deleted_at: None,
        };
        let task = self.repos.tasks.create(&task).await?;
        let task = if task.status == TaskStatus::Pending {
            self.engine.assign(&task, ACTOR).await?
        } else {
            task
        };

        // Long waits park on the poll interval; no worker is held.
        let poll = Duration::from_millis(self.cfg.task_poll_interval_ms);
        loop {
            if cancel.is_cancelled() {
                return Err(KernelError::ShuttingDown);
            }
            let current = self.repos.tasks.get(exec.tenant_id, task.id).await?;
            match current.status {
                TaskStatus::Completed => {
                    return Ok(json!({"task_id": task.id, "status": "completed"}));
                }
                TaskStatus::Failed => {
                    return Err(KernelError::Upstream(format!("task {} failed", task.id)));
                }
                TaskStatus::Cancelled => {
                    return Err(KernelError::Upstream(format!("task {} cancelled", task.id)));
                }
                _ => tokio::time::sleep(poll).await,
            }
        }
    }

    /// Spawn the children concurrently. Policy `all` waits for everything
    /// (optionally failing fast); policy `any` resolves on the first
    /// success and cancels the rest.
    async fn run_fanout_step(
        self: &Arc<Self>,
        _workflow: &Workflow,
        exec: &WorkflowExecution,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        let children: Vec<WorkflowStep> = step
            .config
            .get("children")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| KernelError::InvalidInput(format!("bad children: {}", e)))?
            .unwrap_or_default();
        if children.is_empty() {
            return Err(KernelError::InvalidInput(
                "invalid-definition: parallel step has no children".into(),
            ));
        }
        if children.len() > self.cfg.max_parallel_children {
            return Err(KernelError::InvalidInput(format!(
                "parallel step exceeds max_parallel_children ({})",
                self.cfg.max_parallel_children
            )));
        }
        if children
            .iter()
            .any(|c| matches!(c.step_type, StepType::ParallelFanOut | StepType::ConditionalBranch | StepType::Approval))
        {
            return Err(KernelError::InvalidInput(
                "invalid-definition: parallel children must be leaf steps".into(),
            ));
        }
        let policy = step
            .config
            .get("policy")
            .and_then(|p| p.as_str())
            .unwrap_or("all")
            .to_string();
        let fail_fast = step
            .config
            .get("fail_fast")
            .and_then(|f| f.as_bool())
            .unwrap_or(false);

        let default_timeout = Duration::from_secs(self.cfg.default_step_timeout_secs);
        let child_cancel = cancel.child_token();
        let mut join_set = tokio::task::JoinSet::new();
        for child in children {
            // Each child runs the basic-step path with its own retry budget.
            let this = self.clone();
            let ex = exec.clone();
            let token = child_cancel.clone();
            join_set.spawn(async move {
                let id = child.id.clone();
                let timeout = child
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout);
                let result = with_retry(&child, timeout, &token, || {
                    this.run_basic_step(&ex, &child, &token)
                })
                .await;
                (id, result)
            });
        }

        let mut outputs = serde_json::Map::new();
        let mut failures: Vec<String> = Vec::new();
        let total = join_set.len();
        while let Some(joined) = join_set.join_next().await {
            let (child_id, result) = match joined {
                Ok(pair) => pair,
                Err(e) if e.is_panic() => {
                    failures.push("child panicked".to_string());
                    continue;
                }
                Err(_) => continue,
            };
            match (result, policy.as_str()) {
                (Ok((output, _)), "any") => {
                    child_cancel.cancel();
                    join_set.abort_all();
                    return Ok(json!({"winner": child_id, "output": output}));
                }
                (Ok((output, _)), _) => {
                    outputs.insert(child_id, output);
                }
                (Err((e, _)), "any") => {
                    failures.push(format!("{}: {}", child_id, e));
                }
                (Err((e, _)), _) => {
                    failures.push(format!("{}: {}", child_id, e));
                    if fail_fast {
                        child_cancel.cancel();
                        join_set.abort_all();
                        return Err(KernelError::Upstream(format!(
                            "parallel step failed fast: {}",
                            e
                        )));
                    }
                }
            }
        }

        match policy.as_str() {
            "any" => Err(KernelError::Upstream(format!(
                "all {} children failed: {}",
                total,
                failures.join("; ")
            ))),
            _ => {
                if failures.is_empty() {
                    Ok(Value::Object(outputs))
                } else {
                    Err(KernelError::Upstream(format!(
                        "{} of {} children failed: {}",
                        failures.len(),
                        total,
                        failures.join("; ")
                    )))
                }
            }
        }
    }

    /// Approval verdicts arrive over the gateway or the admin surface.
    pub async fn resolve_approval(
        self: &Arc<Self>,
        tenant_id: Uuid,
        exec_id: Uuid,
        approve: bool,
        actor: &str,
        actor_is_admin: bool,
    ) -> KernelResult<()> {
        let mut exec = self.repos.workflows.get_execution(tenant_id, exec_id).await?;
        if exec.status != ExecutionStatus::Suspended {
            return Err(KernelError::Conflict(
                "execution is not awaiting approval".into(),
            ));
        }
        let workflow = self
            .repos
            .workflows
            .get(tenant_id, exec.workflow_id)
            .await?;
        let step = workflow
            .steps
            .get(exec.cursor)
            .filter(|s| s.step_type == StepType::Approval)
            .ok_or_else(|| KernelError::Conflict("cursor is not at an approval step".into()))?
            .clone();

        // Policy: the approver list on the step, or admin scope when the
        // list is absent.
        let approvers: Vec<String> = step
            .config
            .get("approvers")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| KernelError::InvalidInput(format!("bad approvers: {}", e)))?
            .unwrap_or_default();
        let authorized = if approvers.is_empty() {
            actor_is_admin
        } else {
            approvers.iter().any(|a| a == actor)
        };
        if !authorized {
            return Err(KernelError::Forbidden(format!(
                "{} is not an authorized approver",
                actor
            )));
        }

        let mut version = exec.version;
        if approve {
            exec.step_results.push(result_now(
                &step.id,
                StepStatus::Succeeded,
                json!({"verdict": "approved", "actor": actor}),
                1,
            ));
            exec.cursor += 1;
            self.transition(&mut exec, &mut version, ExecutionStatus::Running, "approved")
                .await?;
            self.publish(&exec, "workflow.approved", json!({"actor": actor}));

            let executor = self.clone();
            tokio::spawn(async move {
                executor.drive(tenant_id, exec_id).await;
            });
            Ok(())
        } else {
            exec.step_results.push(result_now(
                &step.id,
                StepStatus::Failed,
                json!({"verdict": "rejected", "actor": actor}),
                1,
            ));
            self.persist(&mut exec, &mut version, ExecutionStatus::Suspended, "rejected")
                .await?;
            self.fail_with_compensation(&workflow, &mut exec, &mut version, "approval rejected")
                .await
        }
    }

    /// Compensation runs hooks in reverse order of the completed steps,
    /// then lands the execution in `failed`.
    async fn fail_with_compensation(
        &self,
        workflow: &Workflow,
        exec: &mut WorkflowExecution,
        version: &mut i64,
        reason: &str,
    ) -> KernelResult<()> {
        let has_hooks = workflow
            .steps
            .iter()
            .any(|s| s.step_type == StepType::CompensationHook);
        if has_hooks {
            self.transition(exec, version, ExecutionStatus::Compensating, reason)
                .await?;
            self.publish(exec, "workflow.compensating", json!({"reason": reason}));

            let succeeded: Vec<String> = exec
                .step_results
                .iter()
                .filter(|r| r.status == StepStatus::Succeeded)
                .map(|r| r.step_id.clone())
                .collect();
            for step_id in succeeded.iter().rev() {
                let hook = workflow.steps.iter().find(|s| {
                    s.step_type == StepType::CompensationHook
                        && s.config.get("for").and_then(|f| f.as_str()) == Some(step_id)
                });
                let Some(hook) = hook else { continue };
                let output = self.run_compensation_hook(hook).await;
                let status = if output.is_ok() {
                    StepStatus::Compensated
                } else {
                    StepStatus::Failed
                };
                let body = output.unwrap_or_else(|e| json!({"error": e.to_string()}));
                exec.step_results.push(result_now(&hook.id, status, body, 1));
                exec.clock.tick(ACTOR);
                self.persist(exec, version, ExecutionStatus::Compensating, "compensation hook")
                    .await?;
            }
        }

        exec.completed_at = Some(Utc::now());
        let from = exec.status;
        exec.status = ExecutionStatus::Failed;
        exec.clock.tick(ACTOR);
        *version = self
            .repos
            .workflows
            .persist_transition(exec, *version, from, reason)
            .await?;
        exec.version = *version;
        self.publish(exec, "workflow.failed", json!({"reason": reason}));
        metrics::counter!("workflow_executions_total", "status" => "failed").increment(1);
        Ok(())
    }

    async fn run_compensation_hook(&self, hook: &WorkflowStep) -> KernelResult<Value> {
        if let Some(script) = hook.config.get("script").and_then(|s| s.as_str()) {
            let callable = self.scripts.get(script).ok_or_else(|| {
                KernelError::NotFound(format!("compensation script '{}' missing", script))
            })?;
            let params = hook.config.get("params").cloned().unwrap_or(json!({}));
            return callable.run(params).await;
        }
        if hook.config.get("url").is_some() {
            let host = hook
                .config
                .get("url")
                .and_then(|u| u.as_str())
                .and_then(url_host)
                .unwrap_or_else(|| "webhook".to_string());
            let breaker = self.breakers.get(&format!("webhook:{}", host));
            return steps::run_webhook(
                &self.http,
                &breaker,
                &hook.config,
                Duration::from_secs(self.cfg.default_step_timeout_secs),
            )
            .await;
        }
        Err(KernelError::InvalidInput(
            "compensation hook has neither script nor url".into(),
        ))
    }

    async fn transition(
        &self,
        exec: &mut WorkflowExecution,
        version: &mut i64,
        to: ExecutionStatus,
        detail: &str,
    ) -> KernelResult<()> {
        let from = exec.status;
        exec.status = to;
        exec.clock.tick(ACTOR);
        self.persist(exec, version, from, detail).await
    }

    async fn persist(
        &self,
        exec: &mut WorkflowExecution,
        version: &mut i64,
        from: ExecutionStatus,
        detail: &str,
    ) -> KernelResult<()> {
        *version = self
            .repos
            .workflows
            .persist_transition(exec, *version, from, detail)
            .await?;
        exec.version = *version;
        Ok(())
    }

    fn publish(&self, exec: &WorkflowExecution, kind: &str, mut payload: Value) {
        if let Some(map) = payload.as_object_mut() {
            map.insert("execution_id".to_string(), json!(exec.id));
            map.insert("workflow_id".to_string(), json!(exec.workflow_id));
            map.insert("status".to_string(), json!(exec.status));
        }
        self.events.publish(DomainEvent::new(
            Some(exec.tenant_id),
            EventTopic::Workflow,
            kind,
            payload,
        ));
    }
}

/// Retry/timeout shell shared by the main loop and fan-out children. The
/// closure builds a fresh attempt each iteration; cancellation wins over
/// both the attempt and its backoff sleep.
async fn with_retry<F, Fut>(
    step: &WorkflowStep,
    timeout: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<(Value, u32), (KernelError, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = KernelResult<Value>>,
{
    let max_attempts = step.retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(KernelError::ShuttingDown),
            result = tokio::time::timeout(timeout, op()) => match result {
                Ok(inner) => inner,
                Err(_) => Err(KernelError::Upstream(format!(
                    "step {} timed out after {:?}", step.id, timeout
                ))),
            },
        };
        match outcome {
            Ok(output) => return Ok((output, attempt)),
            Err(e) if attempt < max_attempts && !matches!(e, KernelError::ShuttingDown) => {
                let delay = Duration::from_millis(
                    (step.retry.backoff_base_ms * 2u64.saturating_pow(attempt - 1))
                        .min(step.retry.backoff_cap_ms),
                );
                tracing::warn!(
                    "step {} attempt {}/{} failed: {}; retrying in {:?}",
                    step.id,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

fn result_now(step_id: &str, status: StepStatus, output: Value, attempts: u32) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_id: step_id.to_string(),
        status,
        output,
        attempts,
        started_at: now,
        finished_at: now,
    }
}

fn url_host(url: &str) -> Option<String> {
    let after_scheme = url.split("://").nth(1)?;
    let host = after_scheme.split(['/', '?']).next()?;
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_host_extraction() {
        assert_eq!(url_host("https://ci.example.com/hook?x=1").as_deref(), Some("ci.example.com"));
        assert_eq!(url_host("http://localhost:9000").as_deref(), Some("localhost:9000"));
        assert_eq!(url_host("not a url"), None);
    }

    #[test]
    fn step_result_helper_stamps_times() {
        let r = result_now("s1", StepStatus::Succeeded, json!({"x": 1}), 2);
        assert_eq!(r.step_id, "s1");
        assert_eq!(r.attempts, 2);
        assert_eq!(r.output["x"], 1);
    }
}
