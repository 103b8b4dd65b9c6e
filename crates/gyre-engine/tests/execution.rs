use async_trait::async_trait;
use gyre_engine::{
    CancelProbe, Checkpoint, CheckpointSink, Engine, EngineConfig, EngineError, EngineStatus,
    HumanGate, NodeAttemptRecord, OutcomeSink, OutcomeStatus, QuestionState, QuestionTicket,
    RetryBackoffConfig,
};
use gyre_graph::parse;
use gyre_llm::{ModelConfig, ProviderRegistry, ScriptedProvider, ScriptedTurn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn model_config() -> ModelConfig {
    ModelConfig {
        provider: "anthropic".to_string(),
        model: "claude-sonnet-4-5".to_string(),
        temperature: None,
        max_tokens: None,
        reasoning: None,
    }
}

fn config_with_provider(run_id: &str, turns: Vec<ScriptedTurn>) -> EngineConfig {
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(ScriptedProvider::new("anthropic", turns)));
    let mut config = EngineConfig::new(run_id, model_config());
    config.providers = providers;
    config.backoff = RetryBackoffConfig {
        initial_delay_ms: 1,
        backoff_factor: 1.0,
        max_delay_ms: 1,
        jitter: false,
    };
    config
}

#[derive(Default)]
struct RecordingOutcomes {
    rows: Mutex<Vec<NodeAttemptRecord>>,
}

impl RecordingOutcomes {
    fn rows(&self) -> Vec<NodeAttemptRecord> {
        self.rows.lock().expect("rows mutex locks").clone()
    }
}

#[async_trait]
impl OutcomeSink for RecordingOutcomes {
    async fn record(&self, record: NodeAttemptRecord) -> Result<(), EngineError> {
        self.rows.lock().expect("rows mutex locks").push(record);
        Ok(())
    }
}

#[derive(Default)]
struct CollectingCheckpoints {
    saved: Mutex<Vec<Checkpoint>>,
}

impl CollectingCheckpoints {
    fn saved(&self) -> Vec<Checkpoint> {
        self.saved.lock().expect("checkpoint mutex locks").clone()
    }
}

#[async_trait]
impl CheckpointSink for CollectingCheckpoints {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        self.saved
            .lock()
            .expect("checkpoint mutex locks")
            .push(checkpoint.clone());
        Ok(())
    }
}

struct CancelAfter {
    calls: AtomicU32,
    threshold: u32,
}

impl CancelAfter {
    fn new(threshold: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            threshold,
        }
    }
}

#[async_trait]
impl CancelProbe for CancelAfter {
    async fn is_canceled(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1 > self.threshold
    }
}

struct FixedAnswerGate {
    answer: String,
}

#[async_trait]
impl HumanGate for FixedAnswerGate {
    async fn register(
        &self,
        _run_id: &str,
        _node_id: &str,
        _prompt: &str,
        _options: &[String],
    ) -> Result<QuestionTicket, EngineError> {
        Ok(QuestionTicket {
            question_id: "q-1".to_string(),
        })
    }

    async fn poll(&self, _ticket: &QuestionTicket) -> Result<QuestionState, EngineError> {
        Ok(QuestionState::Answered(self.answer.clone()))
    }

    async fn mark_timed_out(&self, _ticket: &QuestionTicket) -> Result<(), EngineError> {
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn linear_graph_runs_to_terminal() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            plan [prompt="write the plan"]
            done [shape=Msquare]
            start -> plan -> done
        }
        "#,
    )
    .expect("graph parses");

    let config = config_with_provider("run-1", vec![ScriptedTurn::Text("the plan".to_string())]);
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");

    assert_eq!(result.status, EngineStatus::Succeeded);
    assert_eq!(result.final_node.as_deref(), Some("done"));
    assert_eq!(
        result.state.node_outputs.get("plan").map(String::as_str),
        Some("the plan")
    );
    assert_eq!(result.state.completed_nodes, vec!["start", "plan"]);
}

#[tokio::test(flavor = "current_thread")]
async fn transient_failure_retries_then_succeeds() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            plan [prompt="p", retries=2]
            done [shape=Msquare]
            start -> plan -> done
        }
        "#,
    )
    .expect("graph parses");

    let outcomes = Arc::new(RecordingOutcomes::default());
    let mut config = config_with_provider(
        "run-2",
        vec![
            ScriptedTurn::Failure {
                message: "overloaded".to_string(),
                retriable: true,
            },
            ScriptedTurn::Text("recovered".to_string()),
        ],
    );
    config.outcomes = outcomes.clone();

    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");
    assert_eq!(result.status, EngineStatus::Succeeded);
    assert_eq!(result.state.node_retry_counts.get("plan"), Some(&1));

    let plan_rows: Vec<_> = outcomes
        .rows()
        .into_iter()
        .filter(|row| row.node_id == "plan")
        .collect();
    assert_eq!(plan_rows.len(), 2);
    assert_eq!(plan_rows[0].attempt, 1);
    assert_eq!(plan_rows[0].status, OutcomeStatus::Failed);
    assert_eq!(plan_rows[1].attempt, 2);
    assert_eq!(plan_rows[1].status, OutcomeStatus::Succeeded);
}

#[tokio::test(flavor = "current_thread")]
async fn fatal_failure_after_retry_budget_fails_run() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            plan [prompt="p", retries=1]
            done [shape=Msquare]
            start -> plan -> done
        }
        "#,
    )
    .expect("graph parses");

    let config = config_with_provider(
        "run-3",
        vec![
            ScriptedTurn::Failure {
                message: "overloaded".to_string(),
                retriable: true,
            },
            ScriptedTurn::Failure {
                message: "still overloaded".to_string(),
                retriable: true,
            },
        ],
    );

    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");
    assert_eq!(result.status, EngineStatus::Failed);
    assert!(
        result
            .failure_reason
            .as_deref()
            .expect("failure reason present")
            .contains("still overloaded")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn decision_routes_on_context_value() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            check [shape=parallelogram, tool="printf approve", output="verdict"]
            gate [shape=diamond, selector="verdict"]
            ship [prompt="ship"]
            stop [prompt="stop"]
            done [shape=Msquare]
            start -> check -> gate
            gate -> ship [when="approve"]
            gate -> stop [when="reject"]
            ship -> done
            stop -> done
        }
        "#,
    )
    .expect("graph parses");

    let config = config_with_provider("run-4", vec![ScriptedTurn::Text("shipped".to_string())]);
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");

    assert_eq!(result.status, EngineStatus::Succeeded);
    assert!(result.state.completed_nodes.contains(&"ship".to_string()));
    assert!(!result.state.completed_nodes.contains(&"stop".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn decision_without_match_fails_node() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            check [shape=parallelogram, tool="printf maybe", output="verdict"]
            gate [shape=diamond, selector="verdict"]
            ship
            done [shape=Msquare]
            start -> check -> gate
            gate -> ship [when="approve"]
            ship -> done
        }
        "#,
    )
    .expect("graph parses");

    let config = config_with_provider("run-5", Vec::new());
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");
    assert_eq!(result.status, EngineStatus::Failed);
    assert!(
        result
            .failure_reason
            .expect("failure reason present")
            .contains("matched no edge")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn parallel_branches_join_with_labeled_outputs() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            fan [shape=component]
            lint [prompt="lint the code"]
            test [prompt="test the code"]
            merge [prompt="merge results"]
            done [shape=Msquare]
            start -> fan
            fan -> lint [label="lint"]
            fan -> test [label="test"]
            lint -> merge
            test -> merge
            merge -> done
        }
        "#,
    )
    .expect("graph parses");

    // The echoing provider reflects each branch prompt, keeping outputs
    // distinguishable regardless of completion order.
    let config = config_with_provider("run-6", Vec::new());
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");

    assert_eq!(result.status, EngineStatus::Succeeded);
    let fan = result
        .state
        .parallel_outputs
        .get("fan")
        .expect("parallel outputs recorded");
    assert_eq!(
        fan.get("lint").map(String::as_str),
        Some("[scripted] lint the code")
    );
    assert_eq!(
        fan.get("test").map(String::as_str),
        Some("[scripted] test the code")
    );
    assert!(result.state.completed_nodes.contains(&"merge".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn parallel_branch_failure_completes_siblings_then_fails() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            fan [shape=component]
            bad [shape=parallelogram, tool="exit 9"]
            good [shape=parallelogram, tool="printf fine"]
            merge
            done [shape=Msquare]
            start -> fan
            fan -> bad [label="bad"]
            fan -> good [label="good"]
            bad -> merge
            good -> merge
            merge -> done
        }
        "#,
    )
    .expect("graph parses");

    let config = config_with_provider("run-7", Vec::new());
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");

    assert_eq!(result.status, EngineStatus::Failed);
    let reason = result.failure_reason.expect("failure reason present");
    assert!(reason.contains("branch 'bad'"));
    // The sibling branch ran to completion before the join failed.
    assert_eq!(
        result.state.node_outputs.get("good").map(String::as_str),
        Some("fine")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn parallel_branch_continue_on_error_routes_through_fallback() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            fan [shape=component]
            risky [shape=parallelogram, tool="exit 7", continue_on_error=true]
            patch_up [shape=parallelogram, tool="printf recovered"]
            steady [shape=parallelogram, tool="printf steady"]
            merge [prompt="merge results"]
            done [shape=Msquare]
            start -> fan
            fan -> risky [label="risky"]
            fan -> steady [label="steady"]
            risky -> merge
            risky -> patch_up [on_error=true]
            patch_up -> merge
            steady -> merge
            merge -> done
        }
        "#,
    )
    .expect("graph parses");

    let config = config_with_provider("run-13", Vec::new());
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");

    // The non-fatal failure routes the branch through its on_error edge, so
    // the join still sees both branches and the run succeeds.
    assert_eq!(result.status, EngineStatus::Succeeded);
    let fan = result
        .state
        .parallel_outputs
        .get("fan")
        .expect("parallel outputs recorded");
    assert_eq!(fan.get("risky").map(String::as_str), Some("recovered"));
    assert_eq!(fan.get("steady").map(String::as_str), Some("steady"));
    assert_eq!(
        result.state.node_outcomes.get("risky").map(|o| o.status),
        Some(OutcomeStatus::Failed)
    );
    assert!(result.state.completed_nodes.contains(&"patch_up".to_string()));
    assert!(result.state.completed_nodes.contains(&"merge".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn human_gate_answer_selects_edge() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            gate [shape=hexagon, prompt="Proceed with the release?"]
            yes [prompt="release"]
            no [prompt="halt"]
            done [shape=Msquare]
            start -> gate
            gate -> yes [label="Yes"]
            gate -> no [label="No"]
            yes -> done
            no -> done
        }
        "#,
    )
    .expect("graph parses");

    let mut config = config_with_provider("run-8", Vec::new());
    config.human = Arc::new(FixedAnswerGate {
        answer: "yes".to_string(),
    });
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");

    assert_eq!(result.status, EngineStatus::Succeeded);
    assert!(result.state.completed_nodes.contains(&"yes".to_string()));
    assert_eq!(
        result.state.context.get("human.gate"),
        Some(&serde_json::json!("yes"))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_marker_aborts_between_steps() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            one [prompt="one"]
            two [prompt="two"]
            done [shape=Msquare]
            start -> one -> two -> done
        }
        "#,
    )
    .expect("graph parses");

    let mut config = config_with_provider("run-9", Vec::new());
    config.cancel = Arc::new(CancelAfter::new(2));
    let error = Engine::new(graph, config)
        .run(None)
        .await
        .expect_err("run must abort");
    assert!(matches!(error, EngineError::Canceled));
}

#[tokio::test(flavor = "current_thread")]
async fn checkpoint_resume_skips_completed_nodes() {
    let source = r#"
        digraph pipeline {
            start [shape=Mdiamond]
            plan [prompt="plan"]
            apply [prompt="apply"]
            done [shape=Msquare]
            start -> plan -> apply -> done
        }
    "#;
    let graph = parse(source).expect("graph parses");

    let checkpoints = Arc::new(CollectingCheckpoints::default());
    let mut config = config_with_provider(
        "run-10",
        vec![
            ScriptedTurn::Text("the plan".to_string()),
            ScriptedTurn::Text("applied".to_string()),
        ],
    );
    config.checkpoints = checkpoints.clone();
    let result = Engine::new(parse(source).expect("graph parses"), config)
        .run(None)
        .await
        .expect("first run completes");
    assert_eq!(result.status, EngineStatus::Succeeded);

    // Resume from the checkpoint taken after `plan`; only `apply` runs, so a
    // single scripted turn suffices.
    let mid = checkpoints
        .saved()
        .into_iter()
        .find(|checkpoint| checkpoint.current_node_id == "plan")
        .expect("plan checkpoint saved");
    assert_eq!(mid.next_node_id.as_deref(), Some("apply"));

    let resume_config = config_with_provider(
        "run-10",
        vec![ScriptedTurn::Text("applied after resume".to_string())],
    );
    let resumed = Engine::new(graph, resume_config)
        .run(Some(mid))
        .await
        .expect("resume completes");

    assert_eq!(resumed.status, EngineStatus::Succeeded);
    assert_eq!(
        resumed.state.node_outputs.get("plan").map(String::as_str),
        Some("the plan")
    );
    assert_eq!(
        resumed.state.node_outputs.get("apply").map(String::as_str),
        Some("applied after resume")
    );
    let plan_runs = resumed
        .state
        .completed_nodes
        .iter()
        .filter(|node| node.as_str() == "plan")
        .count();
    assert_eq!(plan_runs, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn continue_on_error_takes_on_error_edge() {
    let graph = parse(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            risky [shape=parallelogram, tool="exit 1", continue_on_error=true]
            fallback [prompt="recover"]
            happy [prompt="never"]
            done [shape=Msquare]
            start -> risky
            risky -> happy
            risky -> fallback [on_error=true]
            happy -> done
            fallback -> done
        }
        "#,
    )
    .expect("graph parses");

    let config = config_with_provider("run-11", vec![ScriptedTurn::Text("recovered".to_string())]);
    let result = Engine::new(graph, config)
        .run(None)
        .await
        .expect("run completes");

    assert_eq!(result.status, EngineStatus::Succeeded);
    assert!(result.state.completed_nodes.contains(&"fallback".to_string()));
    assert!(!result.state.completed_nodes.contains(&"happy".to_string()));
    assert_eq!(
        result.state.node_outcomes.get("risky").map(|o| o.status),
        Some(OutcomeStatus::Failed)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn max_steps_exhaustion_fails_run() {
    let graph = parse(
        r#"
        digraph pipeline {
            graph [max_steps=4]
            start [shape=Mdiamond]
            a [prompt="a"]
            b [shape=diamond, selector="loop"]
            done [shape=Msquare]
            start -> a -> b
            b -> a [when="again"]
            b -> done [when="stop"]
        }
        "#,
    )
    .expect("graph parses");

    let mut config = config_with_provider("run-12", Vec::new());
    // Seed the loop selector so the decision always routes back to `a`.
    let checkpoints = Arc::new(CollectingCheckpoints::default());
    config.checkpoints = checkpoints.clone();
    let engine = Engine::new(graph, config);
    let mut seeded = gyre_engine::EngineState::new();
    seeded.context.insert("loop".to_string(), serde_json::json!("again"));
    let seed_checkpoint = Checkpoint::new("run-12", 1, "start", Some("a".to_string()), seeded);

    let result = engine
        .run(Some(seed_checkpoint))
        .await
        .expect("run completes");
    assert_eq!(result.status, EngineStatus::Failed);
    assert!(
        result
            .failure_reason
            .expect("failure reason present")
            .contains("max_steps")
    );
}
