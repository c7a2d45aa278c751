//! Dependency scheduler - the single owner of every task graph.
//!
//! ```text
//!  submit ──► TaskGraph (Kahn frontier) ──► advance ──► registry.select
//!                  ▲                                        │
//!                  │                              issue + redeem token
//!                  │                                        │
//!             on_completed ◄── ValidationGate ◄── arm / sandbox job
//!                  │
//!          retry / block dependents / settle
//! ```
//!
//! Executions and validations run as spawned jobs that report back over a
//! channel; graph state is only ever mutated here, between awaits, so no
//! subtask state is shared with an arm or the sandbox.
//!
//! # Invariants
//! - A subtask is dispatched only when every dependency is Completed
//! - In-flight dispatches never exceed `max_concurrent_dispatches` in total
//!   nor an arm's own `max_concurrent`
//! - Every dispatch carries a freshly minted token scoped to the step
//! - The graph is persisted after every state change

mod dispatch;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::arms::register_manifest;
use crate::capability::CapabilitySet;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::memory::Recall;
use crate::registry::{
    Arm, ArmCapability, ArmHealth, ArmManifest, CapabilityRegistry, HealthUpdate, RegistryError,
};
use crate::sandbox::{ExecutionError, SandboxExecutor};
use crate::store::{open_store, AuditEvent, TaskStore};
use crate::task::{
    Decomposer, ExecutionResult, Plan, TaskContract, TaskGraph, TaskId, TaskOutcome, TaskStatus,
    ValidationResult,
};
use crate::token::TokenIssuer;
use crate::validation::{Judge, ValidationGate};

/// How long `run` sleeps when nothing else is scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Per-task scheduling state that is not persisted.
struct TaskRuntime {
    graph: TaskGraph,
    deadline: Instant,
    cancel: CancellationToken,
    /// Earliest dispatch time of steps waiting out a retry backoff
    not_before: HashMap<u32, Instant>,
    settled: bool,
}

/// A dispatched execution awaiting its result.
struct ActiveExecution {
    arm_id: String,
    attempt: u32,
    token_id: String,
    granted: CapabilitySet,
    cancel: CancellationToken,
    started: Instant,
}

/// Reports sent back by spawned jobs.
enum Event {
    Executed {
        task_id: TaskId,
        step: u32,
        attempt: u32,
        outcome: Result<ExecutionResult, ExecutionError>,
    },
    Validated {
        task_id: TaskId,
        step: u32,
        attempt: u32,
        verdict: ValidationResult,
    },
}

pub struct Scheduler {
    config: Config,
    registry: CapabilityRegistry,
    issuer: TokenIssuer,
    executor: Arc<SandboxExecutor>,
    gate: ValidationGate,
    store: Arc<dyn TaskStore>,
    recall: Option<Arc<dyn Recall>>,
    tasks: HashMap<TaskId, TaskRuntime>,
    executions: HashMap<(TaskId, u32), ActiveExecution>,
    /// Attempt number of each step currently at the validation gate
    validations: HashMap<(TaskId, u32), u32>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Scheduler {
    pub fn new(config: Config, store: Arc<dyn TaskStore>) -> Self {
        let issuer = TokenIssuer::new(&config.token_secret, config.token_ttl, config.token_max_uses);
        let executor = SandboxExecutor::new(config.sandbox.clone(), issuer.verifier());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            registry: CapabilityRegistry::new(config.health_failure_threshold),
            gate: ValidationGate::new(config.min_validation_confidence),
            issuer,
            executor: Arc::new(executor),
            store,
            recall: None,
            tasks: HashMap::new(),
            executions: HashMap::new(),
            validations: HashMap::new(),
            events_tx,
            events_rx,
            config,
        }
    }

    /// Open the configured store and register the arms of the configured
    /// manifest.
    pub async fn from_config(config: Config) -> Result<Self, OrchestratorError> {
        let store = open_store(&config).await?;
        let manifest = match &config.arm_manifest {
            Some(path) => Some(ArmManifest::load(path).await?),
            None => None,
        };
        let mut scheduler = Self::new(config, store);
        if let Some(manifest) = manifest {
            let count = register_manifest(&mut scheduler.registry, &manifest)?;
            info!(count, "Registered arms from manifest");
        }
        Ok(scheduler)
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.gate = self.gate.with_judge(judge);
        self
    }

    pub fn with_recall(mut self, recall: Arc<dyn Recall>) -> Self {
        self.recall = Some(recall);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn register_arm(
        &mut self,
        capability: ArmCapability,
        handle: Arc<dyn Arm>,
    ) -> Result<(), RegistryError> {
        self.registry.register(capability, handle)
    }

    pub fn deregister_arm(&mut self, arm_id: &str) -> Option<ArmCapability> {
        self.registry.deregister(arm_id)
    }

    /// Live graph of a task held by this scheduler.
    pub fn graph(&self, task_id: TaskId) -> Option<&TaskGraph> {
        self.tasks.get(&task_id).map(|rt| &rt.graph)
    }

    pub fn outcome(&self, task_id: TaskId) -> Option<TaskOutcome> {
        self.graph(task_id).map(TaskGraph::outcome)
    }

    /// Status of a task, from memory or the store.
    pub async fn task_status(&self, task_id: TaskId) -> Result<TaskStatus, OrchestratorError> {
        if let Some(graph) = self.graph(task_id) {
            return Ok(graph.status());
        }
        self.store
            .load_task_graph(task_id)
            .await?
            .map(|graph| graph.status())
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    pub async fn audit_trail(&self, task_id: TaskId) -> Result<Vec<AuditEvent>, OrchestratorError> {
        Ok(self.store.list_audit(task_id).await?)
    }

    // Ingestion

    /// Validate `plan` and take ownership of the resulting graph.
    ///
    /// Nothing is persisted; see [`Scheduler::submit`]. Ingesting a task id
    /// that is already held is a no-op.
    ///
    /// # Errors
    /// `PlanInvalid` for any plan defect; no graph is created.
    pub fn ingest(&mut self, contract: TaskContract, plan: Plan) -> Result<TaskId, OrchestratorError> {
        let task_id = contract.task_id;
        if self.tasks.contains_key(&task_id) {
            return Ok(task_id);
        }
        let steps = plan.steps.len();
        let graph = TaskGraph::ingest(
            contract,
            plan,
            self.config.max_plan_steps,
            self.config.default_limits(),
        )
        .map_err(|e| {
            warn!(%task_id, error = %e, "Rejected plan");
            e
        })?;
        self.install(graph);
        info!(%task_id, steps, "Ingested task");
        Ok(task_id)
    }

    fn install(&mut self, graph: TaskGraph) {
        let remaining = graph.contract().time_remaining(Utc::now());
        let settled = graph.is_settled();
        self.tasks.insert(
            graph.task_id(),
            TaskRuntime {
                graph,
                deadline: Instant::now() + remaining,
                cancel: CancellationToken::new(),
                not_before: HashMap::new(),
                settled,
            },
        );
    }

    /// Ingest and persist a task.
    ///
    /// Resubmitting a task id never re-executes it: a settled task returns
    /// its recorded outcome and an unsettled stored one is recovered.
    ///
    /// # Errors
    /// - `DependencyNotMet` if a task in `depends_on` has not completed
    /// - `PlanInvalid` for a rejected plan
    pub async fn submit(
        &mut self,
        contract: TaskContract,
        plan: Plan,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let task_id = contract.task_id;
        if let Some(outcome) = self.outcome(task_id) {
            debug!(%task_id, status = outcome.status.label(), "Task already held");
            return Ok(outcome);
        }
        if let Some(stored) = self.store.load_task_graph(task_id).await? {
            if stored.is_settled() {
                info!(%task_id, status = stored.status().label(), "Task already settled; returning stored outcome");
                return Ok(stored.outcome());
            }
            self.recover(task_id).await?;
            return self.outcome(task_id).ok_or(OrchestratorError::TaskNotFound(task_id));
        }

        for dependency in &contract.depends_on {
            let status = match self.graph(*dependency) {
                Some(graph) => Some(graph.status()),
                None => self
                    .store
                    .load_task_graph(*dependency)
                    .await?
                    .map(|graph| graph.status()),
            };
            if !status.is_some_and(|s| s.is_completed()) {
                return Err(OrchestratorError::DependencyNotMet {
                    task: task_id,
                    dependency: *dependency,
                });
            }
        }

        let goal = contract.goal.clone();
        self.ingest(contract, plan)?;
        self.audit(AuditEvent::new(task_id, "ingested").with_detail(serde_json::json!({ "goal": goal })))
            .await?;
        self.persist(task_id).await?;
        self.outcome(task_id).ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    /// Submit and run to settlement.
    pub async fn execute(
        &mut self,
        contract: TaskContract,
        plan: Plan,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let outcome = self.submit(contract, plan).await?;
        if outcome.status.is_terminal() {
            return Ok(outcome);
        }
        self.run(outcome.task_id).await
    }

    /// Ask `decomposer` for a plan, then execute it.
    pub async fn plan_and_execute(
        &mut self,
        contract: TaskContract,
        decomposer: &dyn Decomposer,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let plan = decomposer.decompose(&contract).await.map_err(|e| {
            warn!(task_id = %contract.task_id, error = %e, "Decomposer failed");
            OrchestratorError::Decomposition(e.to_string())
        })?;
        self.execute(contract, plan).await
    }

    // Driving

    /// Dispatch ready work across all tasks, highest priority first.
    ///
    /// Returns the number of dispatches started.
    pub async fn advance(&mut self) -> Result<usize, OrchestratorError> {
        self.expire_overdue().await?;

        let mut order: Vec<_> = self
            .tasks
            .iter()
            .filter(|(_, rt)| !rt.graph.is_settled())
            .map(|(id, rt)| {
                let contract = rt.graph.contract();
                (Reverse(contract.priority), contract.created_at, *id)
            })
            .collect();
        order.sort();

        let mut started = 0;
        for (_, _, task_id) in order {
            if self.executions.len() >= self.config.max_concurrent_dispatches {
                break;
            }
            started += self.dispatch_ready(task_id).await?;
        }
        Ok(started)
    }

    /// Drive `task_id` until it settles.
    ///
    /// Other held tasks progress along the way.
    ///
    /// # Errors
    /// `Stalled` when nothing is in flight and no ready step can be
    /// dispatched, e.g. when every capable arm was deregistered.
    pub async fn run(&mut self, task_id: TaskId) -> Result<TaskOutcome, OrchestratorError> {
        if !self.tasks.contains_key(&task_id) {
            return Err(OrchestratorError::TaskNotFound(task_id));
        }
        loop {
            self.advance().await?;
            match self.tasks.get(&task_id) {
                Some(rt) if rt.graph.is_settled() => return Ok(rt.graph.outcome()),
                Some(rt) => {
                    let waiting_retry = !rt.not_before.is_empty();
                    if self.executions.is_empty() && self.validations.is_empty() && !waiting_retry {
                        error!(%task_id, "Task stalled with nothing in flight");
                        return Err(OrchestratorError::Stalled(task_id));
                    }
                }
                None => return Err(OrchestratorError::TaskNotFound(task_id)),
            }

            let wake = self.next_wake().unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                _ = tokio::time::sleep_until(wake) => None,
            };
            if let Some(event) = event {
                self.handle_event(event).await?;
            }
        }
    }

    /// Earliest deadline or retry hold among unsettled tasks.
    fn next_wake(&self) -> Option<Instant> {
        self.tasks
            .values()
            .filter(|rt| !rt.graph.is_settled())
            .flat_map(|rt| std::iter::once(rt.deadline).chain(rt.not_before.values().copied()))
            .min()
    }

    /// Cancel a task. In-flight executions are signalled, their tokens
    /// revoked, and every unfinished step becomes Blocked-Cancelled.
    pub async fn cancel(&mut self, task_id: TaskId) -> Result<TaskOutcome, OrchestratorError> {
        let rt = self
            .tasks
            .get_mut(&task_id)
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;
        if rt.graph.is_settled() {
            return Ok(rt.graph.outcome());
        }
        rt.cancel.cancel();
        let in_flight = rt.graph.cancel()?;
        rt.not_before.clear();
        self.stop_in_flight(task_id);
        info!(%task_id, ?in_flight, "Cancelled task");
        self.audit(
            AuditEvent::new(task_id, "cancelled")
                .with_detail(serde_json::json!({ "in_flight": in_flight })),
        )
        .await?;
        self.settle_if_done(task_id).await?;
        self.persist(task_id).await?;
        self.outcome(task_id).ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    /// Probe every registered arm and feed the results to the registry.
    ///
    /// Arms past the failure threshold are deregistered.
    pub async fn check_arm_health(&mut self) -> Vec<(String, ArmHealth, HealthUpdate)> {
        let probes = self.registry.handles().into_iter().map(|(arm_id, arm)| async move {
            let health = arm.health().await;
            (arm_id, health)
        });
        let results = futures::future::join_all(probes).await;

        let mut updates = Vec::with_capacity(results.len());
        for (arm_id, health) in results {
            match self.registry.record_health(&arm_id, health) {
                Ok(update) => updates.push((arm_id, health, update)),
                Err(e) => debug!(%arm_id, error = %e, "Dropped health result"),
            }
        }
        updates
    }

    /// Load a persisted task and re-queue the steps that were in flight or
    /// waiting on a retry when it was last saved.
    ///
    /// Returns the re-queued steps. The deadline is the contract's, so a
    /// task recovered after its deadline expires on the next advance.
    pub async fn recover(&mut self, task_id: TaskId) -> Result<Vec<u32>, OrchestratorError> {
        if self.tasks.contains_key(&task_id) {
            return Ok(Vec::new());
        }
        let mut graph = self
            .store
            .load_task_graph(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;
        let requeued = if graph.is_settled() {
            Vec::new()
        } else {
            graph.recover_interrupted()?
        };
        self.install(graph);
        info!(%task_id, ?requeued, "Recovered task");
        self.audit(
            AuditEvent::new(task_id, "recovered")
                .with_detail(serde_json::json!({ "requeued": requeued })),
        )
        .await?;
        self.persist(task_id).await?;
        Ok(requeued)
    }

    /// Recover every unsettled task in the store.
    pub async fn recover_all(&mut self) -> Result<Vec<TaskId>, OrchestratorError> {
        let mut recovered = Vec::new();
        for task_id in self.store.list_task_ids().await? {
            if self.tasks.contains_key(&task_id) {
                continue;
            }
            let unsettled = self
                .store
                .load_task_graph(task_id)
                .await?
                .is_some_and(|graph| !graph.is_settled());
            if unsettled {
                self.recover(task_id).await?;
                recovered.push(task_id);
            }
        }
        Ok(recovered)
    }

    // Persistence helpers

    async fn persist(&self, task_id: TaskId) -> Result<(), OrchestratorError> {
        if let Some(rt) = self.tasks.get(&task_id) {
            self.store.save_task_graph(&rt.graph).await?;
        }
        Ok(())
    }

    async fn audit(&self, event: AuditEvent) -> Result<(), OrchestratorError> {
        self.store.append_audit(event).await?;
        Ok(())
    }
}
