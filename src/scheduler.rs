//! Scheduler: the per-execution main loop — dispatch, state
//! transitions, and event emission — per spec.md §4.8.
//!
//! Grounded on the teacher's `engine/executor.rs` `ExecutionEngine`
//! (an active-execution map driving bounded dispatch with status
//! tracking); narrowed to the general ready/dispatch/complete loop
//! shape. None of the teacher's human-in-loop, breakpoint, auth, or
//! streaming machinery carries over since nothing here calls for it.

use crate::config::RuntimeConfig;
use crate::context::{ExecutionContext, SharedExecutionState};
use crate::diagram::{Diagram, Node, NodeState, NodeStatus};
use crate::envelope::{Envelope, EnvelopeBody};
use crate::error::{Result, RuntimeError};
use crate::events::{EventBus, ExecutionEvent};
use crate::handler::{execute_with_envelopes, ExecutionRequest};
use crate::ids::{DiagramId, ExecutionId, NodeId};
use crate::metrics::{HANDLERS_IN_FLIGHT, NODES_COMPLETED, NODES_DISPATCHED, NODES_FAILED};
use crate::registry::HandlerRegistry;
use crate::store::{ExecutionState, ExecutionStatus, StateStore};
use crate::tracker::CompletionStatus;
use crate::transition::StateTransitionLogic;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;

/// Cooperative cancellation flag shared between the caller and a
/// running scheduler loop. Cheap to clone; `is_cancelled` is lock-free.
/// Built on a flag plus `Notify` rather than `tokio_util::CancellationToken`
/// to avoid pulling in a dependency the rest of the crate doesn't use.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

enum Outcome {
    Completed { output: Envelope },
    Failed { output: Envelope, message: String },
}

struct TaskResult {
    node_id: NodeId,
    started_at: DateTime<Utc>,
    outcome: Outcome,
}

/// Drives one execution from PENDING to a terminal status, per
/// spec.md §4.8's state machine: PENDING → RUNNING →
/// (COMPLETED | FAILED | ABORTED).
pub struct Scheduler {
    diagram: Arc<Diagram>,
    registry: Arc<HandlerRegistry>,
    store: Arc<StateStore>,
    events: Arc<EventBus>,
    config: RuntimeConfig,
}

impl Scheduler {
    pub fn new(
        diagram: Arc<Diagram>,
        registry: Arc<HandlerRegistry>,
        store: Arc<StateStore>,
        events: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            diagram,
            registry,
            store,
            events,
            config,
        }
    }

    /// Run (or resume) one execution to completion.
    pub async fn run(
        &self,
        execution_id: ExecutionId,
        diagram_id: DiagramId,
        variables: HashMap<String, Value>,
        cancel: CancelToken,
    ) -> Result<ExecutionState> {
        let (shared, started_at) = self.initialize_shared(&execution_id, &diagram_id, &variables).await?;
        let ctx = ExecutionContext::new(
            self.diagram.clone(),
            execution_id.clone(),
            diagram_id.clone(),
            shared.clone(),
        );

        self.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            diagram_id: diagram_id.clone(),
            timestamp: Utc::now(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut any_failed = false;
        let mut invariant_violation: Option<String> = None;
        let mut cancel_deadline: Option<tokio::time::Instant> = None;
        let mut aborted = false;

        'main: loop {
            if invariant_violation.is_some() {
                tasks.abort_all();
                break 'main;
            }

            if cancel.is_cancelled() && cancel_deadline.is_none() {
                cancel_deadline = Some(tokio::time::Instant::now() + self.config.cancel_grace_period);
            }

            if cancel_deadline.is_none() {
                let ready_ids: Vec<NodeId> = ctx
                    .get_ready_nodes()
                    .await
                    .into_iter()
                    .map(|n| n.id.clone())
                    .collect();

                if ready_ids.is_empty() && tasks.is_empty() {
                    break 'main;
                }
                for node_id in ready_ids {
                    self.dispatch(&shared, &ctx, &semaphore, &mut tasks, node_id).await?;
                }
            }

            if tasks.is_empty() {
                if cancel_deadline.is_some() {
                    aborted = true;
                }
                break 'main;
            }

            let joined = if let Some(deadline) = cancel_deadline {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    tasks.abort_all();
                    aborted = true;
                    break 'main;
                }
                match tokio::time::timeout(remaining, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_elapsed) => {
                        tasks.abort_all();
                        aborted = true;
                        break 'main;
                    }
                }
            } else {
                tasks.join_next().await
            };

            if let Some(joined) = joined {
                match joined {
                    Ok(result) => {
                        if let Err(err) = self
                            .apply_result(&ctx, &shared, started_at, result, &mut any_failed)
                            .await
                        {
                            invariant_violation = Some(err.to_string());
                        }
                    }
                    Err(join_err) => {
                        invariant_violation = Some(format!("dispatch task panicked: {join_err}"));
                    }
                }
            }
        }

        let aborted = aborted || invariant_violation.is_some();
        self.finalize(
            &shared,
            execution_id,
            diagram_id,
            started_at,
            any_failed,
            aborted,
            invariant_violation,
        )
        .await
    }

    /// Apply the persisted `ExecutionState` (if any) to a fresh
    /// `SharedExecutionState`: replay `exec_counts`/`node_outputs` into
    /// the tracker and seed `node_states`, defaulting missing nodes to
    /// PENDING, per spec.md §4.8 step 1.
    async fn initialize_shared(
        &self,
        execution_id: &ExecutionId,
        diagram_id: &DiagramId,
        variables: &HashMap<String, Value>,
    ) -> Result<(Arc<Mutex<SharedExecutionState>>, DateTime<Utc>)> {
        let persisted = self.store.get_state(execution_id).await?;
        let started_at = persisted.as_ref().map(|s| s.started_at).unwrap_or_else(Utc::now);

        let mut state = SharedExecutionState::new(variables.clone());

        if let Some(existing) = &persisted {
            state.variables = existing.variables.clone();
            for (node_id, count) in &existing.exec_counts {
                // A node left in RUNNING at persist time was interrupted
                // mid-dispatch (e.g. the execution was cancelled before it
                // finished) — that attempt never produced a result, so
                // only its prior completed iterations are replayed into
                // history; the interrupted one is re-run from scratch
                // rather than counted as a silent success.
                let was_interrupted = existing
                    .node_states
                    .get(node_id)
                    .map(|s| s.status == NodeStatus::Running)
                    .unwrap_or(false);
                let completed_count = if was_interrupted { count.saturating_sub(1) } else { *count };

                let output = existing.node_outputs.get(node_id).cloned();
                for _ in 0..completed_count {
                    state.tracker.start_execution(node_id);
                    state.tracker.complete_execution(
                        node_id,
                        CompletionStatus::Success,
                        output.clone(),
                        None,
                        None,
                    )?;
                }
            }
        }

        for node in &self.diagram.nodes {
            let persisted_state = persisted.as_ref().and_then(|s| s.node_states.get(&node.id));
            let node_state = match persisted_state {
                Some(s) if s.status == NodeStatus::Running => NodeState::pending(),
                Some(s) => s.clone(),
                None => NodeState::pending(),
            };
            state.node_states.insert(node.id.clone(), node_state);
        }

        if persisted.is_none() {
            self.store
                .create_execution(execution_id.clone(), diagram_id.clone(), variables.clone())
                .await?;
        }

        Ok((Arc::new(Mutex::new(state)), started_at))
    }

    /// Transition a ready node to RUNNING and spawn its handler dispatch.
    /// The transition happens synchronously here (not inside the spawned
    /// task) so the node leaves PENDING before the next readiness poll —
    /// otherwise a slow-to-schedule task could be picked up twice.
    async fn dispatch(
        &self,
        shared: &Arc<Mutex<SharedExecutionState>>,
        ctx: &ExecutionContext,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskResult>,
        node_id: NodeId,
    ) -> Result<()> {
        let node = self
            .diagram
            .get_node(&node_id)
            .cloned()
            .ok_or_else(|| RuntimeError::Diagram(format!("ready node {node_id} missing from diagram")))?;

        let execution_number = {
            let mut guard = shared.lock().await;
            let logic = StateTransitionLogic::new(&self.diagram);
            let mut current = guard.current_node_id.clone();
            let n = logic.to_running(&node_id, &mut guard.tracker, &mut guard.node_states, &mut current);
            guard.current_node_id = current;
            n
        };

        NODES_DISPATCHED.inc();
        self.events.publish(ExecutionEvent::NodeStarted {
            execution_id: ctx.execution_id.clone(),
            node_id: node_id.clone(),
            node_type: node.node_type.tag().to_string(),
            timestamp: Utc::now(),
        });

        let registry = self.registry.clone();
        let scoped_ctx = ctx.scoped_to(node_id.clone());
        let semaphore = semaphore.clone();
        let started_at = Utc::now();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            HANDLERS_IN_FLIGHT.inc();
            let outcome = run_node(&registry, &scoped_ctx, &node, execution_number).await;
            HANDLERS_IN_FLIGHT.dec();
            TaskResult {
                node_id,
                started_at,
                outcome,
            }
        });
        Ok(())
    }

    /// Route a finished dispatch task through the right transition and
    /// emit its completion event, then checkpoint progress.
    async fn apply_result(
        &self,
        ctx: &ExecutionContext,
        shared: &Arc<Mutex<SharedExecutionState>>,
        execution_started_at: DateTime<Utc>,
        result: TaskResult,
        any_failed: &mut bool,
    ) -> Result<()> {
        let duration_ms = (Utc::now() - result.started_at).num_milliseconds();

        match result.outcome {
            Outcome::Completed { output } => {
                let max_iteration = self
                    .diagram
                    .get_node(&result.node_id)
                    .and_then(|n| n.node_type.max_iteration());

                let final_status = {
                    let mut guard = shared.lock().await;
                    let logic = StateTransitionLogic::new(&self.diagram);
                    // A PersonJob whose just-finished run reached its
                    // configured cap is classified MAXITER_REACHED rather
                    // than COMPLETED, so it's no longer eligible for the
                    // downstream reset cascade to re-arm it.
                    let at_cap = max_iteration
                        .map(|cap| guard.tracker.get_execution_count(&result.node_id) >= cap)
                        .unwrap_or(false);
                    if at_cap {
                        let mut current = guard.current_node_id.clone();
                        logic.to_maxiter(
                            &result.node_id,
                            output.clone(),
                            &mut guard.tracker,
                            &mut guard.node_states,
                            &mut current,
                        )?;
                        guard.current_node_id = current;
                        NodeStatus::MaxIterReached
                    } else {
                        let mut current = guard.current_node_id.clone();
                        logic.to_completed(
                            &result.node_id,
                            output.clone(),
                            None,
                            &mut guard.tracker,
                            &mut guard.node_states,
                            &mut current,
                        )?;
                        guard.current_node_id = current;
                        NodeStatus::Completed
                    }
                };
                NODES_COMPLETED.inc();
                self.events.publish(ExecutionEvent::NodeCompleted {
                    execution_id: ctx.execution_id.clone(),
                    node_id: result.node_id,
                    status: final_status,
                    output_summary: summarize_output(&output),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            Outcome::Failed { output, message } => {
                {
                    let mut guard = shared.lock().await;
                    let logic = StateTransitionLogic::new(&self.diagram);
                    let mut current = guard.current_node_id.clone();
                    logic.to_failed(
                        &result.node_id,
                        message.clone(),
                        &mut guard.tracker,
                        &mut guard.node_states,
                        &mut current,
                    )?;
                    guard.current_node_id = current;
                }
                *any_failed = true;
                NODES_FAILED.inc();
                let error_type = match &output.body {
                    EnvelopeBody::ErrorEnvelope { error_type, .. } => error_type.clone(),
                    _ => "HandlerError".to_string(),
                };
                self.events.publish(ExecutionEvent::NodeFailed {
                    execution_id: ctx.execution_id.clone(),
                    node_id: result.node_id,
                    error: message,
                    error_type,
                    timestamp: Utc::now(),
                });
            }
        }

        let snapshot = self
            .snapshot_state(
                shared,
                &ctx.execution_id,
                &ctx.diagram_id,
                execution_started_at,
                ExecutionStatus::Running,
                None,
            )
            .await;
        // Best-effort checkpoint; persistence degradation is handled (and
        // metered) inside StateStore, not surfaced as a scheduler error.
        let _ = self.store.save_state(snapshot).await;
        Ok(())
    }

    async fn finalize(
        &self,
        shared: &Arc<Mutex<SharedExecutionState>>,
        execution_id: ExecutionId,
        diagram_id: DiagramId,
        started_at: DateTime<Utc>,
        any_failed: bool,
        aborted: bool,
        abort_reason: Option<String>,
    ) -> Result<ExecutionState> {
        let status = if aborted {
            ExecutionStatus::Aborted
        } else if any_failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        if !aborted {
            self.skip_unreached_nodes(shared).await;
        }

        let state = self
            .snapshot_state(shared, &execution_id, &diagram_id, started_at, status, abort_reason)
            .await;

        self.store.persist_final_state(state.clone()).await?;

        let summary_total = state.executed_nodes.len() as u64;
        self.events.publish(ExecutionEvent::ExecutionCompleted {
            execution_id,
            total_steps: summary_total,
            execution_path: state.executed_nodes.clone(),
            timestamp: Utc::now(),
        });

        Ok(state)
    }

    /// At loop exit, any node still PENDING never became reachable — a
    /// branch not taken, or downstream of a fail-fast failure — and is
    /// classified SKIPPED per spec.md §7's propagation policy. Not called
    /// on an aborted execution: a cancelled run may resume, and its
    /// pending nodes are still legitimately pending, not unreachable.
    async fn skip_unreached_nodes(&self, shared: &Arc<Mutex<SharedExecutionState>>) {
        let mut guard = shared.lock().await;
        let logic = StateTransitionLogic::new(&self.diagram);
        let pending: Vec<NodeId> = guard
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in pending {
            // A PersonJob that's Pending but already at its iteration cap
            // (e.g. reset by a stale cascade before its condition sibling
            // ran) is at its cap, not unreachable; classify it that way
            // rather than SKIPPED.
            let at_cap = self
                .diagram
                .get_node(&node_id)
                .and_then(|n| n.node_type.max_iteration())
                .map(|cap| guard.tracker.get_execution_count(&node_id) >= cap)
                .unwrap_or(false);
            if at_cap {
                if let Some(last_output) = guard.tracker.get_last_output(&node_id).cloned() {
                    let mut current = guard.current_node_id.clone();
                    let _ = logic.to_maxiter(&node_id, last_output, &mut guard.tracker, &mut guard.node_states, &mut current);
                    guard.current_node_id = current;
                    continue;
                }
            }
            logic.to_skipped(&node_id, &mut guard.tracker, &mut guard.node_states).ok();
        }
    }

    async fn snapshot_state(
        &self,
        shared: &Arc<Mutex<SharedExecutionState>>,
        execution_id: &ExecutionId,
        diagram_id: &DiagramId,
        started_at: DateTime<Utc>,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> ExecutionState {
        let guard = shared.lock().await;
        let summary = guard.tracker.get_execution_summary();

        let mut node_outputs = HashMap::new();
        let mut exec_counts = HashMap::new();
        for node in &self.diagram.nodes {
            if let Some(output) = guard.tracker.get_last_output(&node.id) {
                node_outputs.insert(node.id.clone(), output.clone());
            }
            exec_counts.insert(node.id.clone(), guard.tracker.get_execution_count(&node.id));
        }

        ExecutionState {
            execution_id: execution_id.clone(),
            diagram_id: diagram_id.clone(),
            status,
            started_at,
            ended_at: if status.is_terminal() { Some(Utc::now()) } else { None },
            node_states: guard.node_states.clone(),
            node_outputs,
            token_usage: summary.total_tokens,
            error,
            variables: guard.variables.clone(),
            exec_counts,
            executed_nodes: summary.execution_order.clone(),
            metrics: None,
            persistence_degraded: false,
        }
    }
}

async fn run_node(
    registry: &HandlerRegistry,
    ctx: &ExecutionContext,
    node: &Node,
    execution_number: u32,
) -> Outcome {
    let inputs = match ctx.resolve_inputs(node).await {
        Ok(inputs) => inputs,
        Err(err) => {
            let output = Envelope::error(
                err.to_string(),
                "InputResolutionError",
                node.id.clone(),
                ctx.execution_id.clone(),
            );
            return Outcome::Failed {
                output,
                message: err.to_string(),
            };
        }
    };

    let handler = match registry.dispatch(node.node_type.tag()) {
        Ok(handler) => handler,
        Err(err) => {
            let output = Envelope::error(err.to_string(), "HandlerMissing", node.id.clone(), ctx.execution_id.clone());
            return Outcome::Failed {
                output,
                message: err.to_string(),
            };
        }
    };

    let request = ExecutionRequest {
        node,
        execution_id: ctx.execution_id.clone(),
        exec_count: execution_number,
        context: ctx.clone(),
    };
    let output = execute_with_envelopes(handler.as_ref(), &request, inputs).await;

    if output.has_error() {
        let message = match &output.body {
            EnvelopeBody::ErrorEnvelope { message, .. } => message.clone(),
            _ => "handler error".to_string(),
        };
        Outcome::Failed { output, message }
    } else {
        Outcome::Completed { output }
    }
}

fn summarize_output(envelope: &Envelope) -> String {
    const MAX_CHARS: usize = 200;
    let text = match envelope.as_text() {
        Ok(text) => text.to_string(),
        Err(_) => match envelope.as_json() {
            Ok(value) => value.to_string(),
            Err(_) => format!("<{}>", envelope.content_type),
        },
    };
    if text.chars().count() <= MAX_CHARS {
        text
    } else {
        let truncated: String = text.chars().take(MAX_CHARS).collect();
        format!("{truncated}...")
    }
}
