//! End-to-end scale-out scenarios driven through the planner.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use scalegrid_placement::{InstancePrice, StaticPricing, WeightTable};
use scalegrid_scheduler::{
    BinPackScheduler, CancelToken, CycleOutcome, CycleState, SchedulerLauncher, SchedulerResult,
    SchedulingAlgorithm,
};
use scalegrid_sim::{
    MultiSimulationsPerGroup, Planner, PlannerDeps, ScaleOutSimulator, ScalingPlanResult,
    SimulationError, SimulationSettings,
};
use scalegrid_state::{
    AdviceGenerationMode, ClientFacade, ClusterSnapshot, EventReason, Node, NodePlacement, NodePool,
    NodeTemplate, ResourceList, ScaleItem, ScaleOutPlan, ScalingAdviceRequest, ScalingConstraint,
    ScoringStrategy, SimulationStrategy, Workload, labels,
};

const REGION: &str = "eu-west-1";

// ── Fixtures ───────────────────────────────────────────────────────

fn make_template(name: &str, instance_type: &str, cores: i64, gib: i64) -> NodeTemplate {
    NodeTemplate {
        name: name.to_string(),
        instance_type: instance_type.to_string(),
        architecture: "amd64".to_string(),
        capacity: ResourceList::cpu_mem(cores, gib),
        kube_reserved: ResourceList::new(),
        system_reserved: ResourceList::new(),
        taints: Vec::new(),
    }
}

fn make_pool(name: &str, priority: i32, templates: Vec<NodeTemplate>, zones: &[&str]) -> NodePool {
    NodePool {
        name: name.to_string(),
        region: REGION.to_string(),
        priority,
        zones: zones.iter().map(|z| z.to_string()).collect(),
        labels: BTreeMap::new(),
        taints: Vec::new(),
        node_templates: templates,
        max_nodes: None,
    }
}

fn pending(count: usize, cores: i64, gib: i64) -> Vec<Workload> {
    (0..count)
        .map(|i| Workload::pending("default", &format!("w{i}"), ResourceList::cpu_mem(cores, gib)))
        .collect()
}

fn make_request(pools: Vec<NodePool>, workloads: Vec<Workload>) -> ScalingAdviceRequest {
    ScalingAdviceRequest {
        id: "req-1".to_string(),
        correlation_id: "corr-1".to_string(),
        labels: BTreeMap::from([("origin".to_string(), "test".to_string())]),
        constraint: ScalingConstraint { node_pools: pools },
        snapshot: ClusterSnapshot {
            workloads,
            ..Default::default()
        },
        scoring_strategy: ScoringStrategy::LeastCost,
        simulation_strategy: SimulationStrategy::MultiSimulationsPerGroup,
        advice_generation_mode: AdviceGenerationMode::AllAtOnce,
        diagnostic_verbosity: 0,
    }
}

fn pricing() -> Arc<StaticPricing> {
    let prices = [("t3.small", 0.02), ("m5.large", 0.1), ("m5.xlarge", 0.2), ("m5.2xlarge", 0.4)];
    Arc::new(
        StaticPricing::from_prices(prices.iter().map(|(instance_type, price)| InstancePrice {
            region: REGION.to_string(),
            instance_type: instance_type.to_string(),
            hourly_price: *price,
        }))
        .unwrap(),
    )
}

fn settings() -> SimulationSettings {
    SimulationSettings {
        max_parallel: 4,
        poll_interval: Duration::from_millis(5),
        simulation_timeout: Duration::from_secs(5),
        resync_interval: Duration::from_millis(20),
        trace_dir: std::env::temp_dir(),
        rng_seed: Some(7),
    }
}

fn make_planner_with(settings: SimulationSettings, algorithm: Arc<dyn SchedulingAlgorithm>) -> Planner {
    Planner::new(PlannerDeps {
        launcher: Arc::new(SchedulerLauncher::new(settings.max_parallel, algorithm)),
        pricing: pricing(),
        weights: Arc::new(WeightTable::default()),
        settings,
    })
}

fn make_planner(settings: SimulationSettings) -> Planner {
    make_planner_with(settings, Arc::new(BinPackScheduler))
}

/// Run a request to completion and collect every message it produced.
async fn run_plan(planner: &Planner, request: ScalingAdviceRequest) -> Vec<ScalingPlanResult> {
    let (tx, mut rx) = mpsc::channel(16);
    tokio::time::timeout(
        Duration::from_secs(20),
        planner.plan(request, &CancelToken::new(), &tx),
    )
    .await
    .expect("plan finished in time");
    drop(tx);

    let mut messages = Vec::new();
    while let Some(message) = rx.recv().await {
        messages.push(message);
    }
    messages
}

fn terminal_plan(messages: &[ScalingPlanResult]) -> &ScaleOutPlan {
    let terminal: Vec<_> = messages.iter().filter(|m| m.terminal).collect();
    assert_eq!(terminal.len(), 1, "exactly one terminal result");
    assert!(messages.last().is_some_and(|m| m.terminal), "terminal result comes last");
    match &terminal[0].outcome {
        Ok(plan) => plan,
        Err(e) => panic!("expected a plan, got {e}"),
    }
}

fn terminal_error(messages: &[ScalingPlanResult]) -> &SimulationError {
    let terminal: Vec<_> = messages.iter().filter(|m| m.terminal).collect();
    assert_eq!(terminal.len(), 1, "exactly one terminal result");
    match &terminal[0].outcome {
        Ok(plan) => panic!("expected an error, got {plan:?}"),
        Err(e) => {
            assert_eq!(e.request_id, "req-1");
            assert_eq!(e.correlation_id, "corr-1");
            &e.source
        }
    }
}

fn placement(pool: &str, template: &str, instance_type: &str, zone: &str) -> NodePlacement {
    NodePlacement {
        node_pool: pool.to_string(),
        node_template: template.to_string(),
        instance_type: instance_type.to_string(),
        region: REGION.to_string(),
        zone: zone.to_string(),
    }
}

/// Never binds anything, so simulations only end by deadline or cancellation.
struct IdleScheduler;

impl SchedulingAlgorithm for IdleScheduler {
    fn name(&self) -> &str {
        "idle"
    }

    fn run_cycle(&self, _client: &ClientFacade, _state: &mut CycleState) -> SchedulerResult<CycleOutcome> {
        Ok(CycleOutcome::default())
    }
}

/// Idles in any view holding a synthetic node of the `slow` template and
/// bin-packs everywhere else.
struct SlowTemplateScheduler;

impl SchedulingAlgorithm for SlowTemplateScheduler {
    fn name(&self) -> &str {
        "slow-template"
    }

    fn run_cycle(&self, client: &ClientFacade, state: &mut CycleState) -> SchedulerResult<CycleOutcome> {
        let stuck = client
            .list_nodes()?
            .iter()
            .any(|n| n.label(labels::NODE_TEMPLATE) == Some("slow"));
        if stuck {
            return Ok(CycleOutcome::default());
        }
        BinPackScheduler.run_cycle(client, state)
    }
}

/// Reports an already placed workload as scheduled on the synthetic node and
/// gives up on everything pending, so no pass ever shrinks the pending set.
struct NoProgressScheduler;

impl SchedulingAlgorithm for NoProgressScheduler {
    fn name(&self) -> &str {
        "no-progress"
    }

    fn run_cycle(&self, client: &ClientFacade, state: &mut CycleState) -> SchedulerResult<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        if !state.reported_unschedulable.is_empty() {
            return Ok(outcome);
        }
        let Some(node) = client
            .list_nodes()?
            .into_iter()
            .find(|n| n.label(labels::SIMULATED).is_some())
        else {
            return Ok(outcome);
        };
        let workloads = client.list_workloads()?;
        for w in workloads.iter().filter(|w| !w.is_unscheduled()) {
            client.record_event(EventReason::Scheduled, &w.key(), Some(node.name.as_str()), "already placed")?;
        }
        for w in workloads.iter().filter(|w| w.is_unscheduled()) {
            client.report_unschedulable(&w.key(), "no fit")?;
            state.reported_unschedulable.insert(w.key());
            outcome.unschedulable += 1;
        }
        Ok(outcome)
    }
}

fn bound_workload(name: &str, node: &str, cores: i64, gib: i64) -> Workload {
    let mut workload = Workload::pending("default", name, ResourceList::cpu_mem(cores, gib));
    workload.node_name = Some(node.to_string());
    workload
}

fn plain_node(name: &str, cores: i64, gib: i64) -> Node {
    Node {
        name: name.to_string(),
        labels: BTreeMap::new(),
        taints: Vec::new(),
        capacity: ResourceList::cpu_mem(cores, gib),
        allocatable: ResourceList::cpu_mem(cores, gib),
        unschedulable: false,
    }
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_scales_one_node() {
    let planner = make_planner(settings());
    let request = make_request(
        vec![make_pool(
            "general",
            0,
            vec![make_template("m5-xlarge", "m5.xlarge", 4, 8)],
            &["eu-west-1a"],
        )],
        pending(3, 1, 2),
    );

    let messages = run_plan(&planner, request).await;
    let plan = terminal_plan(&messages);

    assert_eq!(
        plan.items,
        vec![ScaleItem {
            placement: placement("general", "m5-xlarge", "m5.xlarge", "eu-west-1a"),
            current_replicas: 0,
            delta: 1,
        }]
    );
    assert!(plan.unsatisfied_workload_names.is_empty());
    assert_eq!(messages[0].labels.get("origin").map(String::as_str), Some("test"));
    assert_eq!(planner.launcher().available_slots(), 4);
}

#[tokio::test]
async fn undersized_candidates_yield_no_scaling_advice() {
    let planner = make_planner(settings());
    let request = make_request(
        vec![
            make_pool("tiny", 0, vec![make_template("t3-small", "t3.small", 1, 2)], &["eu-west-1a"]),
            make_pool("small", 1, vec![make_template("m5-large", "m5.large", 2, 4)], &["eu-west-1b"]),
        ],
        pending(2, 4, 1),
    );

    let messages = run_plan(&planner, request).await;
    assert!(matches!(terminal_error(&messages), SimulationError::NoScalingAdvice));
    assert_eq!(planner.launcher().available_slots(), 4);
}

#[tokio::test]
async fn cancellation_mid_pass_yields_one_error_result() {
    let mut settings = settings();
    settings.simulation_timeout = Duration::from_secs(60);
    let planner = make_planner_with(settings, Arc::new(IdleScheduler));
    let request = make_request(
        vec![make_pool(
            "general",
            0,
            vec![
                make_template("m5-large", "m5.large", 2, 4),
                make_template("m5-xlarge", "m5.xlarge", 4, 8),
            ],
            &["eu-west-1a", "eu-west-1b"],
        )],
        pending(3, 1, 1),
    );

    for _ in 0..3 {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancelToken::new();
        let started = tokio::time::Instant::now();
        tokio::join!(planner.plan(request.clone(), &cancel, &tx), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel("operator interrupt");
        });
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(tx);

        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        assert_eq!(messages.len(), 1);
        match terminal_error(&messages) {
            SimulationError::Cancelled(cause) => assert_eq!(cause, "operator interrupt"),
            other => panic!("expected cancellation, got {other}"),
        }
        assert_eq!(planner.launcher().available_slots(), 4);
        assert_eq!(planner.launcher().running_schedulers(), 0);
    }
}

#[tokio::test]
async fn fixed_seed_gives_identical_plans() {
    let pools = vec![make_pool(
        "general",
        0,
        vec![
            make_template("a", "m5.xlarge", 4, 8),
            make_template("b", "m5.xlarge", 4, 8),
        ],
        &["eu-west-1a", "eu-west-1b"],
    )];

    let first = run_plan(&make_planner(settings()), make_request(pools.clone(), pending(3, 1, 1))).await;
    let second = run_plan(&make_planner(settings()), make_request(pools, pending(3, 1, 1))).await;

    let first = terminal_plan(&first);
    assert_eq!(first, terminal_plan(&second));
    assert_eq!(first.total_delta(), 1);
}

#[tokio::test]
async fn small_nodes_take_several_passes() {
    let planner = make_planner(settings());
    let request = make_request(
        vec![make_pool(
            "general",
            0,
            vec![make_template("m5-large", "m5.large", 2, 4)],
            &["eu-west-1a"],
        )],
        pending(5, 1, 1),
    );

    let messages = run_plan(&planner, request).await;
    let plan = terminal_plan(&messages);
    assert_eq!(plan.items.len(), 1);
    assert_eq!(plan.items[0].delta, 3);
    assert!(plan.unsatisfied_workload_names.is_empty());
}

#[tokio::test]
async fn leftovers_that_fit_nowhere_are_reported() {
    let planner = make_planner(settings());
    let mut workloads = pending(2, 1, 1);
    workloads.push(Workload::pending("batch", "giant", ResourceList::cpu_mem(64, 1)));
    let request = make_request(
        vec![make_pool(
            "general",
            0,
            vec![make_template("m5-xlarge", "m5.xlarge", 4, 8)],
            &["eu-west-1a"],
        )],
        workloads,
    );

    let messages = run_plan(&planner, request).await;
    let plan = terminal_plan(&messages);
    assert_eq!(plan.total_delta(), 1);
    assert_eq!(plan.unsatisfied_workload_names, vec!["batch/giant"]);
}

#[tokio::test]
async fn incremental_mode_emits_one_partial_per_productive_group() {
    let planner = make_planner(settings());
    let mut capped = make_pool("capped", 0, vec![make_template("m5-large", "m5.large", 2, 4)], &["eu-west-1a"]);
    capped.max_nodes = Some(1);
    let overflow = make_pool(
        "overflow",
        1,
        vec![make_template("m5-2xlarge", "m5.2xlarge", 8, 16)],
        &["eu-west-1a"],
    );
    let mut request = make_request(vec![capped, overflow], pending(4, 1, 1));
    request.advice_generation_mode = AdviceGenerationMode::Incremental;

    let messages = run_plan(&planner, request).await;
    assert_eq!(messages.len(), 3);

    let partials: Vec<&ScaleOutPlan> = messages
        .iter()
        .filter(|m| !m.terminal)
        .map(|m| m.outcome.as_ref().expect("partial plans are never errors"))
        .collect();
    assert_eq!(partials[0].items.len(), 1);
    assert_eq!(partials[0].items[0].placement.node_pool, "capped");
    assert_eq!(partials[1].items.len(), 1);
    assert_eq!(partials[1].items[0].placement.node_pool, "overflow");

    let plan = terminal_plan(&messages);
    assert_eq!(plan.items.len(), 2);
    assert_eq!(plan.total_delta(), 2);
    assert!(plan.unsatisfied_workload_names.is_empty());
}

#[tokio::test]
async fn pool_quota_counts_existing_nodes() {
    let planner = make_planner(settings());
    let mut full = make_pool("full", 0, vec![make_template("m5-xlarge", "m5.xlarge", 4, 8)], &["eu-west-1a"]);
    full.max_nodes = Some(1);
    let fallback = make_pool("fallback", 1, vec![make_template("m5-large", "m5.large", 2, 4)], &["eu-west-1a"]);
    let mut request = make_request(vec![full, fallback], pending(1, 1, 1));

    // An existing, cordoned node already fills the quota of `full`.
    request.snapshot.nodes.push(Node {
        name: "existing".to_string(),
        labels: BTreeMap::from([
            (labels::NODE_POOL.to_string(), "full".to_string()),
            (labels::NODE_TEMPLATE.to_string(), "m5-xlarge".to_string()),
            (labels::ZONE.to_string(), "eu-west-1a".to_string()),
        ]),
        taints: Vec::new(),
        capacity: ResourceList::cpu_mem(4, 8),
        allocatable: ResourceList::cpu_mem(4, 8),
        unschedulable: true,
    });

    let messages = run_plan(&planner, request).await;
    let plan = terminal_plan(&messages);
    assert_eq!(plan.items.len(), 1);
    assert_eq!(plan.items[0].placement.node_pool, "fallback");
}

#[tokio::test]
async fn nothing_pending_gives_an_empty_plan() {
    let planner = make_planner(settings());
    let request = make_request(
        vec![make_pool("general", 0, vec![make_template("m5-large", "m5.large", 2, 4)], &["eu-west-1a"])],
        Vec::new(),
    );

    let messages = run_plan(&planner, request).await;
    assert_eq!(terminal_plan(&messages), &ScaleOutPlan::default());
}

#[tokio::test]
async fn single_simulation_strategy_is_not_implemented() {
    let planner = make_planner(settings());
    let mut request = make_request(
        vec![make_pool("general", 0, vec![make_template("m5-large", "m5.large", 2, 4)], &["eu-west-1a"])],
        pending(1, 1, 1),
    );
    request.simulation_strategy = SimulationStrategy::SingleSimulationPerGroup;

    let messages = run_plan(&planner, request).await;
    assert!(matches!(terminal_error(&messages), SimulationError::Unimplemented(_)));
}

#[tokio::test]
async fn least_waste_prefers_the_tighter_node() {
    let planner = make_planner(settings());
    let mut request = make_request(
        vec![make_pool(
            "general",
            0,
            vec![
                make_template("m5-2xlarge", "m5.2xlarge", 8, 16),
                make_template("m5-large", "m5.large", 2, 4),
            ],
            &["eu-west-1a"],
        )],
        pending(2, 1, 2),
    );
    request.scoring_strategy = ScoringStrategy::LeastWaste;

    let messages = run_plan(&planner, request).await;
    let plan = terminal_plan(&messages);
    assert_eq!(plan.items.len(), 1);
    assert_eq!(plan.items[0].placement.node_template, "m5-large");
}

#[tokio::test]
async fn diagnostic_verbosity_writes_a_trace_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings();
    settings.trace_dir = dir.path().to_path_buf();
    let planner = make_planner(settings);
    let mut request = make_request(
        vec![make_pool("general", 0, vec![make_template("m5-xlarge", "m5.xlarge", 4, 8)], &["eu-west-1a"])],
        pending(2, 1, 1),
    );
    request.diagnostic_verbosity = 1;

    let messages = run_plan(&planner, request).await;
    terminal_plan(&messages);

    let path: &PathBuf = messages
        .last()
        .and_then(|m| m.trace_log_path.as_ref())
        .expect("trace log path attached");
    assert_eq!(path, &dir.path().join("req-1-corr-1.log"));
    let content = std::fs::read_to_string(path).unwrap();
    assert!(content.contains("pass winner recorded"));
    assert!(content.contains("req-1"));
}

#[tokio::test]
async fn work_that_fits_existing_nodes_needs_no_new_node() {
    let planner = make_planner(settings());
    let mut request = make_request(
        vec![make_pool("general", 0, vec![make_template("m5-large", "m5.large", 2, 4)], &["eu-west-1a"])],
        pending(1, 1, 1),
    );
    request.snapshot.nodes.push(plain_node("a-existing", 2, 4));
    request.snapshot.workloads.push(bound_workload("resident", "a-existing", 1, 1));

    let messages = run_plan(&planner, request).await;
    let plan = terminal_plan(&messages);
    assert!(plan.items.is_empty());
    assert!(plan.unsatisfied_workload_names.is_empty());
}

#[tokio::test]
async fn a_timed_out_candidate_does_not_stop_its_siblings() {
    let mut settings = settings();
    settings.simulation_timeout = Duration::from_millis(300);
    let planner = make_planner_with(settings, Arc::new(SlowTemplateScheduler));
    let request = make_request(
        vec![make_pool(
            "general",
            0,
            vec![
                make_template("slow", "m5.xlarge", 4, 8),
                make_template("fast", "m5.large", 2, 4),
            ],
            &["eu-west-1a"],
        )],
        pending(2, 1, 1),
    );

    let messages = run_plan(&planner, request).await;
    let plan = terminal_plan(&messages);
    assert_eq!(
        plan.items,
        vec![ScaleItem {
            placement: placement("general", "fast", "m5.large", "eu-west-1a"),
            current_replicas: 0,
            delta: 1,
        }]
    );
    assert!(plan.unsatisfied_workload_names.is_empty());
    assert_eq!(planner.launcher().available_slots(), 4);
}

#[tokio::test]
async fn group_ends_after_two_passes_without_progress() {
    let settings = settings();
    let slots = settings.max_parallel;
    let launcher = Arc::new(SchedulerLauncher::new(
        settings.max_parallel,
        Arc::new(NoProgressScheduler),
    ));
    let mut request = make_request(
        vec![make_pool("general", 0, vec![make_template("m5-large", "m5.large", 2, 4)], &["eu-west-1a"])],
        pending(1, 1, 1),
    );
    request.snapshot.nodes.push(plain_node("existing", 4, 8));
    request.snapshot.workloads.push(bound_workload("placed", "existing", 1, 1));

    let simulator = MultiSimulationsPerGroup::new(
        Arc::new(request),
        Arc::clone(&launcher),
        pricing(),
        Arc::new(WeightTable::default()),
        settings,
    )
    .unwrap();
    let (tx, _rx) = mpsc::channel(16);
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        simulator.simulate(&CancelToken::new(), &tx),
    )
    .await
    .expect("simulation finished in time");

    assert!(matches!(outcome, Err(SimulationError::NoScalingAdvice)));
    assert_eq!(simulator.passes(), 2);
    assert_eq!(launcher.available_slots(), slots);
    assert_eq!(launcher.running_schedulers(), 0);
}
