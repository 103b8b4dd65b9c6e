use crate::handlers::{
    Evaluation, HandlerFailure, HandlerOutcome, RepositoryContext, run_model_node, run_tool_node,
};
use crate::{
    Checkpoint, EngineError, EngineEvent, EngineEventKind, EngineEventSink, EngineState,
    NodeAttemptRecord, OutcomeStatus, QuestionState, RetryBackoffConfig, SharedCancelProbe,
    SharedCheckpointSink, SharedHumanGate, SharedOutcomeSink, build_retry_policy,
    delay_for_attempt_ms, jitter_seed, ports,
};
use gyre_graph::{Edge, Graph, Node, NodeType, validate_or_raise};
use gyre_llm::{ModelConfig, ProviderRegistry};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_HUMAN_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct EngineConfig {
    pub run_id: String,
    pub model_config: ModelConfig,
    /// Context entries present before the first node runs; ignored on
    /// checkpoint resume, which restores the saved context instead.
    pub initial_context: BTreeMap<String, serde_json::Value>,
    pub repository: RepositoryContext,
    pub workdir: PathBuf,
    pub providers: ProviderRegistry,
    pub events: EngineEventSink,
    pub cancel: SharedCancelProbe,
    pub outcomes: SharedOutcomeSink,
    pub checkpoints: SharedCheckpointSink,
    pub human: SharedHumanGate,
    pub backoff: RetryBackoffConfig,
    pub max_parallel: usize,
    pub human_poll_interval: Duration,
}

impl EngineConfig {
    pub fn new(run_id: impl Into<String>, model_config: ModelConfig) -> Self {
        Self {
            run_id: run_id.into(),
            model_config,
            initial_context: BTreeMap::new(),
            repository: RepositoryContext::default(),
            workdir: std::env::temp_dir(),
            providers: ProviderRegistry::new(),
            events: EngineEventSink::default(),
            cancel: Arc::new(ports::NeverCanceled),
            outcomes: Arc::new(ports::NullOutcomeSink),
            checkpoints: Arc::new(ports::NullCheckpointSink),
            human: Arc::new(ports::AutoAnswerGate),
            backoff: RetryBackoffConfig::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            human_poll_interval: DEFAULT_HUMAN_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Succeeded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct EngineRunResult {
    pub status: EngineStatus,
    pub failure_reason: Option<String>,
    pub final_node: Option<String>,
    pub state: EngineState,
}

struct Emitter {
    sink: EngineEventSink,
    sequence: AtomicU64,
}

impl Emitter {
    fn new(sink: EngineEventSink) -> Self {
        Self {
            sink,
            sequence: AtomicU64::new(0),
        }
    }

    fn emit(&self, kind: EngineEventKind) {
        if !self.sink.is_enabled() {
            return;
        }
        let sequence_no = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.emit(EngineEvent { sequence_no, kind });
    }
}

/// Result of one branch sub-sequence under a parallel node.
struct BranchRun {
    label: String,
    final_output: String,
    node_outputs: BTreeMap<String, String>,
    context_updates: BTreeMap<String, serde_json::Value>,
    completed: Vec<(String, OutcomeStatus, Option<String>, u32)>,
    failure: Option<String>,
}

/// The attractor graph interpreter: single-threaded per run, cooperative
/// cancellation at every suspension point, checkpoint after every step.
pub struct Engine {
    graph: Graph,
    config: EngineConfig,
}

impl Engine {
    pub fn new(graph: Graph, config: EngineConfig) -> Self {
        Self { graph, config }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub async fn run(&self, resume: Option<Checkpoint>) -> Result<EngineRunResult, EngineError> {
        validate_or_raise(&self.graph, &[])
            .map_err(|error| EngineError::InvalidGraph(error.to_string()))?;

        let emitter = Emitter::new(self.config.events.clone());
        let resumed = resume.is_some();
        let (mut state, mut current, mut step) = match resume {
            Some(checkpoint) => {
                let next = checkpoint.next_node_id.ok_or_else(|| {
                    EngineError::Runtime(
                        "resume checkpoint has no next node; the run already finished".to_string(),
                    )
                })?;
                (checkpoint.state, next, checkpoint.step)
            }
            None => {
                let start = self
                    .graph
                    .start_node()
                    .ok_or_else(|| EngineError::InvalidGraph("graph has no start node".to_string()))?;
                let mut state = EngineState::new();
                state.context.extend(self.config.initial_context.clone());
                (state, start.id.clone(), 0)
            }
        };

        emitter.emit(EngineEventKind::Started {
            run_id: self.config.run_id.clone(),
            graph_id: self.graph.id.clone(),
            resumed,
        });

        let max_steps = self.graph.max_steps();

        loop {
            if self.config.cancel.is_canceled().await {
                return Err(EngineError::Canceled);
            }

            let node = self.graph.nodes.get(&current).ok_or_else(|| {
                EngineError::InvalidGraph(format!("traversal reached unknown node '{current}'"))
            })?;

            if node.node_type() == NodeType::Terminal {
                emitter.emit(EngineEventKind::Completed {
                    final_node: Some(node.id.clone()),
                });
                return Ok(EngineRunResult {
                    status: EngineStatus::Succeeded,
                    failure_reason: None,
                    final_node: Some(node.id.clone()),
                    state,
                });
            }

            step += 1;
            if step > max_steps {
                let reason = format!("max_steps {max_steps} exhausted at node '{current}'");
                emitter.emit(EngineEventKind::Failed {
                    reason: reason.clone(),
                });
                return Ok(EngineRunResult {
                    status: EngineStatus::Failed,
                    failure_reason: Some(reason),
                    final_node: Some(current),
                    state,
                });
            }

            let (evaluation, attempts) = match node.node_type() {
                NodeType::Parallel => self.run_parallel(node, &mut state, &emitter).await?,
                _ => self.execute_with_retry(node, &state, &emitter).await?,
            };

            let next = match &evaluation {
                Evaluation::Success(outcome) => {
                    state.record_output(&node.id, outcome.output.clone());
                    for (key, value) in &outcome.context_updates {
                        state.context.insert(key.clone(), value.clone());
                    }
                    state.record_outcome(&node.id, OutcomeStatus::Succeeded, None, attempts);
                    outcome
                        .chosen_next
                        .clone()
                        .or_else(|| self.route_success(node))
                }
                Evaluation::Failure(failure) => {
                    state.record_outcome(
                        &node.id,
                        OutcomeStatus::Failed,
                        Some(failure.reason.clone()),
                        attempts,
                    );
                    if node.attrs.get_bool("continue_on_error") == Some(true) {
                        self.route_on_error(node).or_else(|| self.route_success(node))
                    } else {
                        None
                    }
                }
            };

            let checkpoint = Checkpoint::new(
                self.config.run_id.clone(),
                step,
                node.id.clone(),
                next.clone(),
                state.clone(),
            );
            self.config.checkpoints.save(&checkpoint).await?;
            emitter.emit(EngineEventKind::CheckpointSaved {
                node_id: node.id.clone(),
                step,
            });

            if let Evaluation::Failure(failure) = &evaluation {
                if node.attrs.get_bool("continue_on_error") != Some(true) {
                    emitter.emit(EngineEventKind::Failed {
                        reason: failure.reason.clone(),
                    });
                    return Ok(EngineRunResult {
                        status: EngineStatus::Failed,
                        failure_reason: Some(failure.reason.clone()),
                        final_node: Some(node.id.clone()),
                        state,
                    });
                }
            }

            match next {
                Some(next_node) => current = next_node,
                None => {
                    emitter.emit(EngineEventKind::Completed {
                        final_node: Some(node.id.clone()),
                    });
                    return Ok(EngineRunResult {
                        status: EngineStatus::Succeeded,
                        failure_reason: None,
                        final_node: Some(node.id.clone()),
                        state,
                    });
                }
            }
        }
    }

    async fn execute_with_retry(
        &self,
        node: &Node,
        state: &EngineState,
        emitter: &Emitter,
    ) -> Result<(Evaluation, u32), EngineError> {
        let policy = build_retry_policy(node, &self.graph, self.config.backoff.clone());
        let seed = jitter_seed(&self.config.run_id, &node.id);

        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.config.cancel.is_canceled().await {
                return Err(EngineError::Canceled);
            }
            emitter.emit(EngineEventKind::NodeRunning {
                node_id: node.id.clone(),
                attempt,
            });

            let evaluation = self.evaluate(node, state, emitter).await?;
            match evaluation {
                Evaluation::Success(outcome) => {
                    let output_bytes = outcome
                        .output
                        .as_ref()
                        .map(|output| output.len() as u64)
                        .unwrap_or(0);
                    self.config
                        .outcomes
                        .record(NodeAttemptRecord {
                            run_id: self.config.run_id.clone(),
                            node_id: node.id.clone(),
                            attempt,
                            status: OutcomeStatus::Succeeded,
                            payload: json!({ "output_bytes": output_bytes }),
                        })
                        .await?;
                    emitter.emit(EngineEventKind::NodeSucceeded {
                        node_id: node.id.clone(),
                        attempt,
                        output_bytes,
                    });
                    return Ok((Evaluation::Success(outcome), attempt));
                }
                Evaluation::Failure(failure) => {
                    let will_retry = failure.retriable && attempt < policy.max_attempts;
                    self.config
                        .outcomes
                        .record(NodeAttemptRecord {
                            run_id: self.config.run_id.clone(),
                            node_id: node.id.clone(),
                            attempt,
                            status: OutcomeStatus::Failed,
                            payload: json!({ "error": failure.reason }),
                        })
                        .await?;
                    emitter.emit(EngineEventKind::NodeFailed {
                        node_id: node.id.clone(),
                        attempt,
                        reason: failure.reason.clone(),
                        will_retry,
                    });

                    if !will_retry {
                        return Ok((Evaluation::Failure(failure), attempt));
                    }

                    let delay_ms = delay_for_attempt_ms(attempt, &policy.backoff, seed);
                    emitter.emit(EngineEventKind::NodeRetrying {
                        node_id: node.id.clone(),
                        attempt,
                        next_attempt: attempt + 1,
                        delay_ms,
                    });
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }
    }

    async fn evaluate(
        &self,
        node: &Node,
        state: &EngineState,
        emitter: &Emitter,
    ) -> Result<Evaluation, EngineError> {
        match node.node_type() {
            NodeType::Start => Ok(Evaluation::Success(HandlerOutcome::default())),
            NodeType::Model => {
                let node_id = node.id.clone();
                let on_delta = move |text: String| {
                    emitter.emit(EngineEventKind::ModelDelta {
                        node_id: node_id.clone(),
                        text,
                    });
                };
                run_model_node(
                    node,
                    &self.graph,
                    state,
                    &self.config.repository,
                    &self.config.model_config,
                    &self.config.providers,
                    &on_delta,
                )
                .await
            }
            NodeType::Tool => {
                run_tool_node(node, &self.graph, &self.config.run_id, &self.config.workdir).await
            }
            NodeType::Human => self.run_human(node, emitter).await,
            NodeType::Decision => Ok(self.run_decision(node, state)),
            NodeType::Parallel => Ok(Evaluation::Failure(HandlerFailure::fatal(
                "parallel nodes cannot be nested inside a parallel branch",
            ))),
            NodeType::Terminal => Ok(Evaluation::Success(HandlerOutcome::default())),
        }
    }

    async fn run_human(&self, node: &Node, emitter: &Emitter) -> Result<Evaluation, EngineError> {
        let prompt = node
            .attrs
            .get_str("prompt")
            .filter(|prompt| !prompt.trim().is_empty())
            .or_else(|| node.attrs.get_str("label"))
            .unwrap_or("Select an option:")
            .to_string();
        let options: Vec<String> = self
            .routable_edges(node)
            .iter()
            .map(|edge| edge.branch_label().to_string())
            .collect();

        let ticket = self
            .config
            .human
            .register(&self.config.run_id, &node.id, &prompt, &options)
            .await?;
        emitter.emit(EngineEventKind::HumanQuestionPending {
            node_id: node.id.clone(),
            prompt,
        });

        let timeout_ms = node.attrs.get("timeout_ms").and_then(|value| value.as_millis());
        let started = tokio::time::Instant::now();

        loop {
            if self.config.cancel.is_canceled().await {
                return Err(EngineError::Canceled);
            }

            match self.config.human.poll(&ticket).await? {
                QuestionState::Answered(answer) => {
                    emitter.emit(EngineEventKind::HumanQuestionAnswered {
                        node_id: node.id.clone(),
                        answer: answer.clone(),
                    });
                    let chosen_next = self
                        .routable_edges(node)
                        .into_iter()
                        .find(|edge| {
                            edge.branch_label().eq_ignore_ascii_case(answer.trim())
                                || edge.to.eq_ignore_ascii_case(answer.trim())
                        })
                        .map(|edge| edge.to.clone());
                    let mut outcome = HandlerOutcome::with_output(answer.clone());
                    outcome.context_updates.insert(
                        format!("human.{}", node.id),
                        serde_json::Value::String(answer),
                    );
                    outcome.chosen_next = chosen_next;
                    return Ok(Evaluation::Success(outcome));
                }
                QuestionState::TimedOut => {
                    emitter.emit(EngineEventKind::HumanQuestionTimedOut {
                        node_id: node.id.clone(),
                    });
                    return Ok(Evaluation::Failure(HandlerFailure::fatal(
                        "human question timed out",
                    )));
                }
                QuestionState::Pending => {
                    if let Some(bound) = timeout_ms {
                        if started.elapsed() >= Duration::from_millis(bound) {
                            self.config.human.mark_timed_out(&ticket).await?;
                            emitter.emit(EngineEventKind::HumanQuestionTimedOut {
                                node_id: node.id.clone(),
                            });
                            return Ok(Evaluation::Failure(HandlerFailure::fatal(format!(
                                "human question timed out after {bound} ms"
                            ))));
                        }
                    }
                    tokio::time::sleep(self.config.human_poll_interval).await;
                }
            }
        }
    }

    fn run_decision(&self, node: &Node, state: &EngineState) -> Evaluation {
        let Some(selector) = node
            .attrs
            .get_str("selector")
            .map(str::trim)
            .filter(|selector| !selector.is_empty())
        else {
            return Evaluation::Failure(HandlerFailure::fatal("decision node has no selector"));
        };
        let Some(value) = state.context_str(selector) else {
            return Evaluation::Failure(HandlerFailure::fatal(format!(
                "decision selector '{selector}' is not present in the context"
            )));
        };

        let matched = self
            .sorted_outgoing(node)
            .into_iter()
            .find(|edge| {
                edge.attrs
                    .get_str("when")
                    .map(str::trim)
                    .is_some_and(|when| when == value)
            })
            .map(|edge| edge.to.clone());

        match matched {
            Some(next) => {
                let mut outcome = HandlerOutcome::with_output(value);
                outcome.chosen_next = Some(next);
                Evaluation::Success(outcome)
            }
            None => Evaluation::Failure(HandlerFailure::fatal(format!(
                "decision selector '{selector}' value '{value}' matched no edge"
            ))),
        }
    }

    async fn run_parallel(
        &self,
        node: &Node,
        state: &mut EngineState,
        emitter: &Emitter,
    ) -> Result<(Evaluation, u32), EngineError> {
        let branches: Vec<(String, String)> = self
            .routable_edges(node)
            .iter()
            .map(|edge| (edge.branch_label().to_string(), edge.to.clone()))
            .collect();
        if branches.is_empty() {
            let failure = HandlerFailure::fatal(format!(
                "parallel node '{}' has no outgoing branches",
                node.id
            ));
            self.record_parallel_outcome(node, 0, 0, Some(&failure.reason)).await?;
            return Ok((Evaluation::Failure(failure), 1));
        }

        let join = self.compute_join(&branches);
        emitter.emit(EngineEventKind::ParallelStarted {
            node_id: node.id.clone(),
            branch_count: branches.len(),
        });

        let max_parallel = self.config.max_parallel.max(1);
        let mut runs: Vec<BranchRun> = Vec::with_capacity(branches.len());
        for window in branches.chunks(max_parallel) {
            let futures: Vec<_> = window
                .iter()
                .map(|(label, target)| {
                    self.run_branch(label.clone(), target.clone(), join.clone(), state, emitter)
                })
                .collect();
            for run in futures::future::join_all(futures).await {
                runs.push(run?);
            }
        }
        runs.sort_by(|left, right| left.label.cmp(&right.label));

        let mut failures = Vec::new();
        for run in &runs {
            emitter.emit(EngineEventKind::ParallelBranchCompleted {
                node_id: node.id.clone(),
                branch_label: run.label.clone(),
                succeeded: run.failure.is_none(),
            });
            if let Some(reason) = &run.failure {
                failures.push(format!("branch '{}': {reason}", run.label));
            }
        }

        // Merge branch results in label order so joins never depend on
        // completion order.
        let parallel_slot = state
            .parallel_outputs
            .entry(node.id.clone())
            .or_default();
        for run in &runs {
            parallel_slot.insert(run.label.clone(), run.final_output.clone());
        }
        for run in &runs {
            for (node_id, output) in &run.node_outputs {
                state
                    .node_outputs
                    .insert(node_id.clone(), output.clone());
            }
            for (key, value) in &run.context_updates {
                state.context.insert(key.clone(), value.clone());
            }
            for (node_id, status, reason, attempts) in &run.completed {
                state.record_outcome(node_id, *status, reason.clone(), *attempts);
            }
        }

        let success_count = runs.iter().filter(|run| run.failure.is_none()).count();
        self.record_parallel_outcome(
            node,
            success_count,
            runs.len() - success_count,
            failures.first().map(String::as_str),
        )
        .await?;

        if !failures.is_empty() {
            return Ok((
                Evaluation::Failure(HandlerFailure::fatal(failures.join("; "))),
                1,
            ));
        }

        let mut outcome = HandlerOutcome::default();
        outcome.chosen_next = join;
        Ok((Evaluation::Success(outcome), 1))
    }

    async fn record_parallel_outcome(
        &self,
        node: &Node,
        succeeded: usize,
        failed: usize,
        first_failure: Option<&str>,
    ) -> Result<(), EngineError> {
        let status = if failed == 0 && first_failure.is_none() {
            OutcomeStatus::Succeeded
        } else {
            OutcomeStatus::Failed
        };
        self.config
            .outcomes
            .record(NodeAttemptRecord {
                run_id: self.config.run_id.clone(),
                node_id: node.id.clone(),
                attempt: 1,
                status,
                payload: json!({
                    "branches_succeeded": succeeded,
                    "branches_failed": failed,
                    "error": first_failure,
                }),
            })
            .await
    }

    /// Execute one labeled branch as a sub-sequence of nodes, stopping at the
    /// join node (executed later by the main loop) or where successors end.
    async fn run_branch(
        &self,
        label: String,
        target: String,
        join: Option<String>,
        base_state: &EngineState,
        emitter: &Emitter,
    ) -> Result<BranchRun, EngineError> {
        let mut local = base_state.clone();
        let mut run = BranchRun {
            label,
            final_output: String::new(),
            node_outputs: BTreeMap::new(),
            context_updates: BTreeMap::new(),
            completed: Vec::new(),
            failure: None,
        };

        let mut current = target;
        let mut steps = 0u64;
        loop {
            if join.as_deref() == Some(current.as_str()) {
                break;
            }
            steps += 1;
            if steps > self.graph.max_steps() {
                run.failure = Some(format!("branch exceeded max_steps at '{current}'"));
                break;
            }

            let Some(node) = self.graph.nodes.get(&current) else {
                run.failure = Some(format!("branch reached unknown node '{current}'"));
                break;
            };
            if node.node_type() == NodeType::Terminal {
                break;
            }

            let (evaluation, attempts) = self.execute_with_retry(node, &local, emitter).await?;
            match evaluation {
                Evaluation::Success(outcome) => {
                    if let Some(output) = &outcome.output {
                        run.final_output = output.clone();
                        run.node_outputs.insert(node.id.clone(), output.clone());
                        local.record_output(&node.id, Some(output.clone()));
                    }
                    for (key, value) in outcome.context_updates {
                        local.context.insert(key.clone(), value.clone());
                        run.context_updates.insert(key, value);
                    }
                    run.completed
                        .push((node.id.clone(), OutcomeStatus::Succeeded, None, attempts));

                    let next = outcome.chosen_next.or_else(|| self.route_success(node));
                    match next {
                        Some(next) => current = next,
                        None => break,
                    }
                }
                Evaluation::Failure(failure) => {
                    run.completed.push((
                        node.id.clone(),
                        OutcomeStatus::Failed,
                        Some(failure.reason.clone()),
                        attempts,
                    ));
                    // Same rule as the main loop: a non-fatal node routes on
                    // through its on_error edge instead of failing the branch.
                    if node.attrs.get_bool("continue_on_error") == Some(true) {
                        let next = self.route_on_error(node).or_else(|| self.route_success(node));
                        match next {
                            Some(next) => current = next,
                            None => break,
                        }
                    } else {
                        run.failure = Some(failure.reason);
                        break;
                    }
                }
            }
        }

        Ok(run)
    }

    /// Join node: the nearest node reachable from every branch entry.
    fn compute_join(&self, branches: &[(String, String)]) -> Option<String> {
        let closures: Vec<BTreeSet<String>> = branches
            .iter()
            .map(|(_, target)| self.forward_closure(target))
            .collect();
        let (first, rest) = closures.split_first()?;
        let common: BTreeSet<&String> = first
            .iter()
            .filter(|node| rest.iter().all(|closure| closure.contains(*node)))
            .collect();
        if common.is_empty() {
            return None;
        }

        // Breadth-first from the first branch entry keeps "nearest" stable.
        let mut queue = VecDeque::from([branches[0].1.clone()]);
        let mut seen = BTreeSet::from([branches[0].1.clone()]);
        while let Some(node_id) = queue.pop_front() {
            if common.contains(&node_id) {
                return Some(node_id);
            }
            for edge in self.graph.outgoing_edges(&node_id) {
                if seen.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        None
    }

    fn forward_closure(&self, from: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::from([from.to_string()]);
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(node_id) = queue.pop_front() {
            for edge in self.graph.outgoing_edges(&node_id) {
                if closure.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        closure
    }

    /// Outgoing edges eligible for normal routing: `when`-guarded edges
    /// belong to decision matching and `on_error` edges to failure routing.
    fn routable_edges<'a>(&'a self, node: &'a Node) -> Vec<&'a Edge> {
        self.sorted_outgoing(node)
            .into_iter()
            .filter(|edge| {
                edge.attrs.get_bool("on_error") != Some(true)
                    && edge
                        .attrs
                        .get_str("when")
                        .map(str::trim)
                        .unwrap_or_default()
                        .is_empty()
            })
            .collect()
    }

    fn sorted_outgoing<'a>(&'a self, node: &'a Node) -> Vec<&'a Edge> {
        let mut edges: Vec<&Edge> = self.graph.outgoing_edges(&node.id).collect();
        edges.sort_by(|left, right| left.to.cmp(&right.to));
        edges
    }

    fn route_success(&self, node: &Node) -> Option<String> {
        self.routable_edges(node)
            .into_iter()
            .max_by(|left, right| {
                edge_weight(left)
                    .cmp(&edge_weight(right))
                    .then_with(|| right.to.cmp(&left.to))
            })
            .map(|edge| edge.to.clone())
    }

    fn route_on_error(&self, node: &Node) -> Option<String> {
        self.sorted_outgoing(node)
            .into_iter()
            .find(|edge| edge.attrs.get_bool("on_error") == Some(true))
            .map(|edge| edge.to.clone())
    }
}

fn edge_weight(edge: &Edge) -> i64 {
    edge.attrs.get_i64("weight").unwrap_or(0)
}
