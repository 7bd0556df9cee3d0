//! Machine executor: drives one execution instance through its state graph.
//!
//! Lifecycle: `Initializing -> Running -> {Final, Failed}`.
//!
//! Each step enters a state, checkpoints, dispatches the state's work
//! (action, agent call through an [`ExecutionStrategy`], child machines, or
//! fire-and-forget launches), maps the output into the context, and picks the
//! next state from the first matching transition. Failures that can be routed
//! (work, timeout, template) consult the error hooks and then `on_error`.
//!
//! Child machines run on the same executor type with the same backends. A
//! child's execution id is `{parent}.{step}.{index}`, so re-dispatching a
//! state after resume re-attaches to the child instead of starting a second
//! one. Parents wait on children through the result channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use machina_types::error::StoreError;
use machina_types::machine::{
    CheckpointEvent, FanOutMode, MachineRef, StateDefinition, WorkflowDefinition,
};
use machina_types::snapshot::{MachineSnapshot, PendingLaunch};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::definition::{DefinitionError, MachineRegistry, initial_state, validate_definition};
use super::expression::{ConditionEvaluator, ExpressionError};
use super::hooks::{ErrorInfo, HookChain, MachineHooks};
use super::strategy::ExecutionStrategy;
use super::template::{JinjaRenderer, TemplateError, TemplateRenderer};
use crate::invoke::{BoxActionRunner, BoxInvoker, WorkError};
use crate::store::{
    BoxCheckpointStore, BoxExecutionLock, BoxResultChannel, CheckpointManager, ExecutionLockGuard,
    ReadOptions, ReadOutcome, result_uri,
};

/// Step budget used when neither the definition nor the builder sets one.
pub const DEFAULT_MAX_STEPS: u64 = 1000;

/// Default variable name bound to each `foreach` item.
const DEFAULT_ITEM_VAR: &str = "item";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("expression error in {expression:?}: {source}")]
    Expression {
        expression: String,
        source: ExpressionError,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("work failed: {0}")]
    Work(#[from] WorkError),

    #[error("execution {0} is already running")]
    LockContention(String),

    #[error("{what} timed out after {seconds}s")]
    Timeout { what: String, seconds: f64 },

    #[error("step budget of {max_steps} exceeded")]
    StepBudgetExceeded { max_steps: u64 },

    #[error("no transition matched from state '{state}'")]
    NoTransition { state: String },

    #[error("no snapshot found for execution {0}")]
    NoSnapshot(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl MachineError {
    /// Error-type name used for `on_error` routing and `last_error_type`.
    pub fn error_type(&self) -> &str {
        match self {
            MachineError::Work(err) => &err.kind,
            MachineError::Timeout { .. } => "TimeoutExceeded",
            MachineError::Template(_) => "TemplateError",
            MachineError::Configuration(_)
            | MachineError::Definition(_)
            | MachineError::Expression { .. }
            | MachineError::NoTransition { .. } => "ConfigurationError",
            MachineError::LockContention(_) => "LockContention",
            MachineError::StepBudgetExceeded { .. } => "StepBudgetExceeded",
            MachineError::NoSnapshot(_) => "NoSnapshot",
            MachineError::Store(_) => "StoreError",
        }
    }

    /// Whether `on_error` routing and error hooks may intercept this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MachineError::Work(_) | MachineError::Timeout { .. } | MachineError::Template(_)
        )
    }

    /// Message recorded as `last_error`.
    pub fn error_message(&self) -> String {
        match self {
            MachineError::Work(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collaborators shared by an executor and every child it spawns.
struct Services {
    checkpoints: CheckpointManager,
    channel: BoxResultChannel,
    lock: BoxExecutionLock,
    invoker: BoxInvoker,
    actions: BoxActionRunner,
    renderer: Arc<dyn TemplateRenderer>,
    hooks: HookChain,
    evaluator: ConditionEvaluator,
    default_max_steps: u64,
    /// Child executions with a live task in this process.
    attached: DashSet<String>,
}

pub struct MachineExecutorBuilder {
    definition: WorkflowDefinition,
    checkpoints: BoxCheckpointStore,
    channel: BoxResultChannel,
    lock: BoxExecutionLock,
    invoker: BoxInvoker,
    actions: BoxActionRunner,
    renderer: Arc<dyn TemplateRenderer>,
    hooks: HookChain,
    default_max_steps: u64,
}

impl MachineExecutorBuilder {
    fn new(definition: WorkflowDefinition) -> Self {
        Self {
            definition,
            checkpoints: BoxCheckpointStore::default(),
            channel: BoxResultChannel::default(),
            lock: BoxExecutionLock::default(),
            invoker: BoxInvoker::default(),
            actions: BoxActionRunner::default(),
            renderer: Arc::new(JinjaRenderer::new()),
            hooks: HookChain::new(),
            default_max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn checkpoint_store(mut self, store: BoxCheckpointStore) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn result_channel(mut self, channel: BoxResultChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn execution_lock(mut self, lock: BoxExecutionLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn invoker(mut self, invoker: BoxInvoker) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn action_runner(mut self, actions: BoxActionRunner) -> Self {
        self.actions = actions;
        self
    }

    pub fn renderer<R: TemplateRenderer + 'static>(mut self, renderer: R) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    /// Append a lifecycle hook. Hooks run in the order they are added.
    pub fn hook<H: MachineHooks + 'static>(mut self, hook: H) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Step budget for definitions that leave `settings.max_steps` unset.
    pub fn default_max_steps(mut self, max_steps: u64) -> Self {
        self.default_max_steps = max_steps;
        self
    }

    /// Validate the definition and build the executor.
    pub fn build(self) -> Result<MachineExecutor, MachineError> {
        let registry = validate_definition(&self.definition)?;
        Ok(MachineExecutor {
            definition: Arc::new(self.definition),
            registry: Arc::new(registry),
            services: Arc::new(Services {
                checkpoints: CheckpointManager::new(self.checkpoints),
                channel: self.channel,
                lock: self.lock,
                invoker: self.invoker,
                actions: self.actions,
                renderer: self.renderer,
                hooks: self.hooks,
                evaluator: ConditionEvaluator::new(),
                default_max_steps: self.default_max_steps,
                attached: DashSet::new(),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Mutable state of one execution instance.
struct RunState {
    execution_id: String,
    parent_execution_id: Option<String>,
    state: String,
    step: u64,
    context: ExecutionContext,
    pending: Vec<PendingLaunch>,
}

impl RunState {
    fn snapshot(
        &self,
        definition: &WorkflowDefinition,
        event: CheckpointEvent,
        output: Option<Value>,
    ) -> MachineSnapshot {
        MachineSnapshot {
            execution_id: self.execution_id.clone(),
            machine_name: definition.name.clone(),
            machine_version: definition.version.clone(),
            current_state: self.state.clone(),
            step: self.step,
            event,
            context: self.context.as_map().clone(),
            output,
            parent_execution_id: self.parent_execution_id.clone(),
            pending_launches: self.pending.clone(),
            created_at: Utc::now(),
        }
    }

    fn mark_launched(&mut self, launches: &[PendingLaunch]) {
        for pending in &mut self.pending {
            if launches.iter().any(|l| l.execution_id == pending.execution_id) {
                pending.launched = true;
            }
        }
    }

    fn clear_pending(&mut self, launches: &[PendingLaunch]) {
        self.pending
            .retain(|p| !launches.iter().any(|l| l.execution_id == p.execution_id));
    }
}

/// Deterministic child id so re-dispatch after resume finds the same child.
pub fn child_execution_id(parent: &str, step: u64, index: usize) -> String {
    format!("{parent}.{step}.{index}")
}

// ---------------------------------------------------------------------------
// MachineExecutor
// ---------------------------------------------------------------------------

/// Drives workflow definitions. Cheap to clone; clones share backends.
#[derive(Clone)]
pub struct MachineExecutor {
    definition: Arc<WorkflowDefinition>,
    registry: Arc<MachineRegistry>,
    services: Arc<Services>,
}

impl MachineExecutor {
    pub fn builder(definition: WorkflowDefinition) -> MachineExecutorBuilder {
        MachineExecutorBuilder::new(definition)
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.services.checkpoints
    }

    pub fn result_channel(&self) -> &BoxResultChannel {
        &self.services.channel
    }

    /// Where this machine publishes the result of `execution_id`.
    pub fn result_uri(&self, execution_id: &str) -> String {
        result_uri(&self.definition.settings.result_scheme, execution_id)
    }

    /// Start a new execution with a fresh (UUIDv7) execution id.
    pub async fn run(&self, input: Value) -> Result<Value, MachineError> {
        let execution_id = Uuid::now_v7().to_string();
        self.run_with_id(&execution_id, input).await
    }

    /// Start a new execution under a caller-chosen id.
    pub async fn run_with_id(&self, execution_id: &str, input: Value) -> Result<Value, MachineError> {
        self.run_inner(execution_id, input, None).await
    }

    /// Continue an execution from its latest checkpoint.
    pub async fn resume(&self, execution_id: &str) -> Result<Value, MachineError> {
        let span = tracing::info_span!(
            "machine.resume",
            execution_id = %execution_id,
            machine = %self.definition.name,
        );
        async {
            let guard = self.acquire(execution_id).await?;
            let result = self.resume_locked(execution_id).await;
            release(guard).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        execution_id: &str,
        input: Value,
        parent_execution_id: Option<String>,
    ) -> Result<Value, MachineError> {
        let span = tracing::info_span!(
            "machine.run",
            execution_id = %execution_id,
            machine = %self.definition.name,
        );
        async {
            let guard = self.acquire(execution_id).await?;
            let result = self.start(execution_id, input, parent_execution_id).await;
            release(guard).await;
            result
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// The returned guard releases the lock even if the caller drops the
    /// run or resume future before it completes.
    async fn acquire(&self, execution_id: &str) -> Result<ExecutionLockGuard, MachineError> {
        match self.services.lock.try_lock(execution_id).await? {
            Some(guard) => Ok(guard),
            None => {
                tracing::info!(execution_id, "execution lock held elsewhere");
                Err(MachineError::LockContention(execution_id.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Start / resume
    // -----------------------------------------------------------------------

    async fn start(
        &self,
        execution_id: &str,
        input: Value,
        parent_execution_id: Option<String>,
    ) -> Result<Value, MachineError> {
        let template = Value::Object(self.definition.context.clone());
        let rendered = self
            .services
            .renderer
            .render(&template, &json!({ "input": input }))?;
        let context = self
            .services
            .hooks
            .machine_start(&self.definition.name, ExecutionContext::from_value(rendered).into_map());

        let mut run = RunState {
            execution_id: execution_id.to_string(),
            parent_execution_id,
            state: initial_state(&self.definition)?.to_string(),
            step: 0,
            context: ExecutionContext::from_map(context),
            pending: Vec::new(),
        };

        tracing::info!(
            execution_id,
            parent = run.parent_execution_id.as_deref().unwrap_or(""),
            initial_state = %run.state,
            "machine started"
        );

        self.checkpoint(&run, CheckpointEvent::MachineStart, None).await?;
        self.drive_and_record(&mut run).await
    }

    async fn resume_locked(&self, execution_id: &str) -> Result<Value, MachineError> {
        let snapshot = self
            .services
            .checkpoints
            .latest(execution_id)
            .await?
            .ok_or_else(|| MachineError::NoSnapshot(execution_id.to_string()))?;

        if snapshot.machine_name != self.definition.name {
            return Err(MachineError::Configuration(format!(
                "snapshot for {execution_id} belongs to machine '{}', not '{}'",
                snapshot.machine_name, self.definition.name
            )));
        }

        if snapshot.is_complete() {
            tracing::info!(execution_id, step = snapshot.step, "execution already complete");
            return Ok(snapshot.output.unwrap_or(Value::Null));
        }

        // Re-enter the snapshot's state under the same step number so that
        // child ids derived from the step match the original dispatch.
        let step = match snapshot.event {
            CheckpointEvent::MachineStart => snapshot.step,
            _ => snapshot.step.saturating_sub(1),
        };

        let mut run = RunState {
            execution_id: snapshot.execution_id,
            parent_execution_id: snapshot.parent_execution_id,
            state: snapshot.current_state,
            step,
            context: ExecutionContext::from_map(snapshot.context),
            pending: snapshot.pending_launches,
        };

        tracing::info!(
            execution_id,
            state = %run.state,
            step = snapshot.step,
            pending = run.pending.len(),
            "resuming machine"
        );

        self.reattach(&mut run).await?;
        self.drive_and_record(&mut run).await
    }

    /// Re-check every unconfirmed launch and re-issue the ones without a result.
    async fn reattach(&self, run: &mut RunState) -> Result<(), MachineError> {
        let mut still_pending = Vec::with_capacity(run.pending.len());
        for mut launch in std::mem::take(&mut run.pending) {
            if self.child_confirmed(&launch).await? {
                tracing::debug!(child = %launch.execution_id, "pending launch already complete");
                continue;
            }
            self.spawn_child(&launch, &run.execution_id).await?;
            launch.launched = true;
            still_pending.push(launch);
        }
        run.pending = still_pending;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    async fn drive_and_record(&self, run: &mut RunState) -> Result<Value, MachineError> {
        match self.drive(run).await {
            Ok(output) => {
                tracing::info!(
                    execution_id = %run.execution_id,
                    steps = run.step,
                    "machine finished"
                );
                Ok(output)
            }
            Err(err) => {
                tracing::warn!(
                    execution_id = %run.execution_id,
                    state = %run.state,
                    step = run.step,
                    error = %err,
                    "machine failed"
                );
                self.record_failure(run).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, run: &mut RunState) -> Result<Value, MachineError> {
        let max_steps = self
            .definition
            .settings
            .max_steps
            .unwrap_or(self.services.default_max_steps);

        loop {
            run.step += 1;
            if run.step > max_steps {
                return Err(MachineError::StepBudgetExceeded { max_steps });
            }

            let name = run.state.clone();
            let state = self.definition.state(&name).ok_or_else(|| {
                MachineError::Configuration(format!("unknown state '{name}'"))
            })?;

            let context = std::mem::take(&mut run.context).into_map();
            run.context = ExecutionContext::from_map(self.services.hooks.state_enter(&name, context));

            self.prune_pending(run).await?;
            self.checkpoint(run, CheckpointEvent::Execute, None).await?;
            tracing::debug!(execution_id = %run.execution_id, state = %name, step = run.step, "entered state");

            if state.is_final() {
                return self.finish(run, state).await;
            }

            let outcome = match self.dispatch(run, state).await {
                Ok((input, output)) => {
                    let output =
                        self.services
                            .hooks
                            .state_exit(&name, run.context.as_map(), output);
                    self.map_output(run, state, &input, &output)
                        .map(|()| (input, output))
                }
                Err(err) => Err(err),
            };

            let next = match outcome {
                Ok((input, output)) => self.select_transition(run, &name, state, &input, &output)?,
                Err(err) if err.is_recoverable() => self.recover(run, &name, state, err)?,
                Err(err) => return Err(err),
            };

            let next = self
                .services
                .hooks
                .transition(&name, next, run.context.as_map());
            if !self.definition.states.contains_key(&next) {
                return Err(MachineError::Configuration(format!(
                    "transition from '{name}' targets unknown state '{next}'"
                )));
            }

            tracing::debug!(execution_id = %run.execution_id, from = %name, to = %next, "transition");
            run.state = next;
        }
    }

    async fn finish(
        &self,
        run: &mut RunState,
        state: &StateDefinition,
    ) -> Result<Value, MachineError> {
        let output = match &state.output {
            Some(template) => self
                .services
                .renderer
                .render(template, &run.context.scope())?,
            None => run.context.to_value(),
        };
        let output = self
            .services
            .hooks
            .machine_end(&self.definition.name, run.context.as_map(), output);

        let uri = self.result_uri(&run.execution_id);
        self.services.channel.write(&uri, &output).await?;
        self.checkpoint(run, CheckpointEvent::MachineEnd, Some(&output))
            .await?;
        Ok(output)
    }

    fn map_output(
        &self,
        run: &mut RunState,
        state: &StateDefinition,
        input: &Value,
        output: &Value,
    ) -> Result<(), MachineError> {
        let Some(mapping) = &state.output_to_context else {
            return Ok(());
        };
        let scope = run.context.scope_with(input, output);
        let mut updates = Map::with_capacity(mapping.len());
        for (key, template) in mapping {
            updates.insert(key.clone(), self.services.renderer.render(template, &scope)?);
        }
        run.context.merge(updates);
        Ok(())
    }

    fn select_transition(
        &self,
        run: &RunState,
        name: &str,
        state: &StateDefinition,
        input: &Value,
        output: &Value,
    ) -> Result<String, MachineError> {
        let scope = run.context.scope_with(input, output);
        for transition in &state.transitions {
            let matched = match &transition.condition {
                None => true,
                Some(condition) => self
                    .services
                    .evaluator
                    .evaluate_bool(condition, &scope)
                    .map_err(|source| MachineError::Expression {
                        expression: condition.clone(),
                        source,
                    })?,
            };
            if matched {
                return Ok(transition.to.clone());
            }
        }
        Err(MachineError::NoTransition {
            state: name.to_string(),
        })
    }

    /// Record the error in the context and find a recovery state, or give up.
    fn recover(
        &self,
        run: &mut RunState,
        name: &str,
        state: &StateDefinition,
        err: MachineError,
    ) -> Result<String, MachineError> {
        let message = err.error_message();
        run.context.record_error(err.error_type(), &message);

        let info = ErrorInfo {
            state: name,
            error_type: err.error_type(),
            message: &message,
        };
        let recovery = self
            .services
            .hooks
            .error(info, run.context.as_map(), None)
            .or_else(|| {
                state
                    .on_error
                    .as_ref()
                    .and_then(|routes| routes.route(err.error_type()))
                    .map(str::to_string)
            });

        match recovery {
            Some(target) => {
                tracing::warn!(
                    execution_id = %run.execution_id,
                    state = name,
                    error_type = err.error_type(),
                    error = %message,
                    recovery = %target,
                    "state failed, routing to recovery state"
                );
                Ok(target)
            }
            None => Err(err),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run the state's work. Returns `(input, output)` for output mapping and
    /// transition evaluation.
    async fn dispatch(
        &self,
        run: &mut RunState,
        state: &StateDefinition,
    ) -> Result<(Value, Value), MachineError> {
        let scope = run.context.scope();

        if let Some(action) = &state.action {
            let input = self.render_input(state, &scope)?;
            let actions = &self.services.actions;
            let context = run.context.as_map();
            let patch = with_timeout(state.timeout, "action", async {
                actions.run(action, context).await.map_err(MachineError::from)
            })
            .await?;
            run.context.merge(patch.clone());
            return Ok((input, Value::Object(patch)));
        }

        if let Some(agent) = &state.agent {
            let input = self.render_input(state, &scope)?;
            let strategy = ExecutionStrategy::from_config(state.execution.as_ref());
            let invoker = &self.services.invoker;
            let output = with_timeout(state.timeout, "agent", async {
                strategy
                    .execute(|| invoker.invoke(agent, &input))
                    .await
                    .map_err(MachineError::from)
            })
            .await?;
            return Ok((input, output));
        }

        if let Some(machine) = &state.machine {
            return self.dispatch_machines(run, state, machine, &scope).await;
        }

        if let Some(launch) = &state.launch {
            let input = self.render_input(state, &scope)?;
            let specs = launch
                .names()
                .into_iter()
                .map(|name| (name.to_string(), input.clone()))
                .collect();
            let launches = self.record_launches(run, specs).await?;
            for launch in &launches {
                self.spawn_child(launch, &run.execution_id).await?;
            }
            run.mark_launched(&launches);
            tracing::debug!(
                execution_id = %run.execution_id,
                launched = launches.len(),
                "launched children without waiting"
            );
            return Ok((input, Value::Null));
        }

        let input = self.render_input(state, &scope)?;
        Ok((input, Value::Null))
    }

    async fn dispatch_machines(
        &self,
        run: &mut RunState,
        state: &StateDefinition,
        machine: &MachineRef,
        scope: &Value,
    ) -> Result<(Value, Value), MachineError> {
        let mut specs = Vec::new();
        let mut keys = Vec::new();

        let (input, single) = match &state.foreach {
            Some(foreach) => {
                let items = self
                    .services
                    .renderer
                    .render(&Value::String(foreach.clone()), scope)?;
                let Value::Array(items) = items else {
                    return Err(MachineError::Template(TemplateError {
                        template: foreach.clone(),
                        message: "foreach must render to a list".to_string(),
                    }));
                };
                let child = machine.names().first().copied().unwrap_or_default().to_string();
                let var = state.item_var.as_deref().unwrap_or(DEFAULT_ITEM_VAR);
                let mut inputs = Vec::with_capacity(items.len());
                for item in items {
                    let vars = with_item(scope, var, item);
                    let child_input = self.render_input(state, &vars)?;
                    if let Some(key) = &state.key {
                        let rendered = self
                            .services
                            .renderer
                            .render(&Value::String(key.clone()), &vars)?;
                        keys.push(key_string(rendered));
                    }
                    inputs.push(child_input.clone());
                    specs.push((child.clone(), child_input));
                }
                (Value::Array(inputs), false)
            }
            None => {
                let input = self.render_input(state, scope)?;
                for name in machine.names() {
                    specs.push((name.to_string(), input.clone()));
                }
                (input, !machine.is_many())
            }
        };

        let launches = self.record_launches(run, specs).await?;
        for launch in &launches {
            self.spawn_child(launch, &run.execution_id).await?;
        }
        run.mark_launched(&launches);

        let mode = state.mode.unwrap_or_default();
        tracing::debug!(
            execution_id = %run.execution_id,
            children = launches.len(),
            ?mode,
            "waiting on child machines"
        );

        let result = with_timeout(state.timeout, "child machine", async {
            if single {
                return self.await_child(&launches[0]).await;
            }
            match mode {
                FanOutMode::Settled => self.await_settled(&launches, &keys).await,
                FanOutMode::Any => self.await_any(&launches).await,
            }
        })
        .await;

        run.clear_pending(&launches);
        Ok((input, result?))
    }

    fn render_input(&self, state: &StateDefinition, vars: &Value) -> Result<Value, MachineError> {
        match &state.input {
            Some(template) => Ok(self.services.renderer.render(template, vars)?),
            None => Ok(Value::Object(Map::new())),
        }
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// Add launches for the current step to the ledger and persist it before
    /// any child starts.
    async fn record_launches(
        &self,
        run: &mut RunState,
        specs: Vec<(String, Value)>,
    ) -> Result<Vec<PendingLaunch>, MachineError> {
        let launches: Vec<PendingLaunch> = specs
            .into_iter()
            .enumerate()
            .map(|(index, (machine, input))| {
                PendingLaunch::new(
                    child_execution_id(&run.execution_id, run.step, index),
                    machine,
                    input,
                )
            })
            .collect();

        for launch in &launches {
            if !run
                .pending
                .iter()
                .any(|p| p.execution_id == launch.execution_id)
            {
                run.pending.push(launch.clone());
            }
        }
        self.checkpoint(run, CheckpointEvent::Execute, None).await?;
        Ok(launches)
    }

    fn child_definition(&self, machine: &str) -> Result<Arc<WorkflowDefinition>, MachineError> {
        self.registry
            .get(machine)
            .ok_or_else(|| MachineError::Configuration(format!("unknown machine '{machine}'")))
    }

    fn child_result_uri(&self, launch: &PendingLaunch) -> Result<String, MachineError> {
        let definition = self.child_definition(&launch.machine)?;
        Ok(result_uri(
            &definition.settings.result_scheme,
            &launch.execution_id,
        ))
    }

    /// Whether the child published a successful result. A published failure
    /// does not confirm the launch: re-dispatch retries the child.
    async fn child_confirmed(&self, launch: &PendingLaunch) -> Result<bool, MachineError> {
        let uri = self.child_result_uri(launch)?;
        let outcome = self
            .services
            .channel
            .read(&uri, ReadOptions::non_blocking())
            .await?;
        Ok(matches!(outcome, ReadOutcome::Ready(ref value) if !is_error_wrapper(value)))
    }

    /// Start a child task unless the child already succeeded or is running in
    /// this process. A stale failure wrapper is discarded so the child runs
    /// again. A child with checkpoints is resumed, otherwise run.
    async fn spawn_child(&self, launch: &PendingLaunch, parent: &str) -> Result<(), MachineError> {
        let definition = self.child_definition(&launch.machine)?;
        let uri = result_uri(&definition.settings.result_scheme, &launch.execution_id);

        match self
            .services
            .channel
            .read(&uri, ReadOptions::non_blocking())
            .await?
        {
            ReadOutcome::Ready(value) if !is_error_wrapper(&value) => {
                tracing::debug!(child = %launch.execution_id, "child result already available");
                return Ok(());
            }
            ReadOutcome::Ready(_) => {
                tracing::info!(child = %launch.execution_id, "re-issuing previously failed child");
                self.services.channel.delete(&uri).await?;
            }
            ReadOutcome::Absent | ReadOutcome::TimedOut => {}
        }
        let resume = self
            .services
            .checkpoints
            .has_checkpoints(&launch.execution_id)
            .await?;
        if !self.services.attached.insert(launch.execution_id.clone()) {
            tracing::debug!(child = %launch.execution_id, "child already attached");
            return Ok(());
        }

        tracing::debug!(
            parent,
            child = %launch.execution_id,
            machine = %launch.machine,
            resume,
            "spawning child machine"
        );

        let child = MachineExecutor {
            definition,
            registry: Arc::clone(&self.registry),
            services: Arc::clone(&self.services),
        };
        tokio::spawn(child.child_task(launch.clone(), parent.to_string(), resume, uri));
        Ok(())
    }

    /// Body of a spawned child. Failures are published to the child's result
    /// URI as `{ "_error", "_error_type" }` so a waiting parent sees them.
    fn child_task(
        self,
        launch: PendingLaunch,
        parent: String,
        resume: bool,
        uri: String,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let id = launch.execution_id;
            let outcome = if resume {
                self.resume(&id).await
            } else {
                self.run_inner(&id, launch.input, Some(parent)).await
            };

            match outcome {
                Ok(_) => {}
                Err(MachineError::LockContention(_)) => {
                    tracing::debug!(child = %id, "child is driven by another holder");
                }
                Err(err) => {
                    let wrapper = json!({
                        "_error": err.error_message(),
                        "_error_type": err.error_type(),
                    });
                    if let Err(e) = self.services.channel.write(&uri, &wrapper).await {
                        tracing::warn!(child = %id, error = %e, "failed to publish child failure");
                    }
                }
            }

            self.services.attached.remove(&id);
        })
    }

    async fn await_child(&self, launch: &PendingLaunch) -> Result<Value, MachineError> {
        let uri = self.child_result_uri(launch)?;
        match self
            .services
            .channel
            .read(&uri, ReadOptions::blocking(None))
            .await?
        {
            ReadOutcome::Ready(value) => child_outcome(value),
            ReadOutcome::TimedOut | ReadOutcome::Absent => Err(MachineError::Work(WorkError::new(
                "ChildLost",
                format!("no result for child {}", launch.execution_id),
            ))),
        }
    }

    /// Wait for every child. The first failure in launch order fails the
    /// whole fan-out.
    async fn await_settled(
        &self,
        launches: &[PendingLaunch],
        keys: &[String],
    ) -> Result<Value, MachineError> {
        let outcomes =
            futures_util::future::join_all(launches.iter().map(|l| self.await_child(l))).await;
        let mut values = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            values.push(outcome?);
        }

        if keys.len() == values.len() && !keys.is_empty() {
            let map: Map<String, Value> = keys.iter().cloned().zip(values).collect();
            return Ok(Value::Object(map));
        }
        Ok(Value::Array(values))
    }

    /// First child to succeed wins; the rest keep running unobserved. When
    /// every child fails, the failure of the earliest launch is returned.
    async fn await_any(&self, launches: &[PendingLaunch]) -> Result<Value, MachineError> {
        let mut waits: FuturesUnordered<_> = launches
            .iter()
            .enumerate()
            .map(|(index, launch)| async move { (index, self.await_child(launch).await) })
            .collect();

        let mut first_error: Option<(usize, MachineError)> = None;
        while let Some((index, outcome)) = waits.next().await {
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if first_error.as_ref().is_none_or(|(seen, _)| index < *seen) {
                        first_error = Some((index, err));
                    }
                }
            }
        }
        match first_error {
            Some((_, err)) => Err(err),
            None => Ok(Value::Null),
        }
    }

    /// Drop fire-and-forget launches whose results have been published.
    async fn prune_pending(&self, run: &mut RunState) -> Result<(), MachineError> {
        if run.pending.is_empty() {
            return Ok(());
        }
        let mut kept = Vec::with_capacity(run.pending.len());
        for launch in std::mem::take(&mut run.pending) {
            if self.child_confirmed(&launch).await? {
                tracing::debug!(child = %launch.execution_id, "launch confirmed complete");
            } else {
                kept.push(launch);
            }
        }
        run.pending = kept;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpointing
    // -----------------------------------------------------------------------

    async fn checkpoint(
        &self,
        run: &RunState,
        event: CheckpointEvent,
        output: Option<&Value>,
    ) -> Result<(), MachineError> {
        if !self.definition.checkpoints_on(event) {
            return Ok(());
        }
        let snapshot = run.snapshot(&self.definition, event, output.cloned());
        self.services.checkpoints.save(&snapshot).await?;
        Ok(())
    }

    /// Best-effort failure snapshot when checkpointing is enabled at all.
    async fn record_failure(&self, run: &RunState) {
        if self.definition.settings.checkpoint_events.is_empty() {
            return;
        }
        let snapshot = run.snapshot(&self.definition, CheckpointEvent::Error, None);
        if let Err(e) = self.services.checkpoints.save(&snapshot).await {
            tracing::warn!(
                execution_id = %run.execution_id,
                error = %e,
                "failed to write failure checkpoint"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn release(guard: ExecutionLockGuard) {
    let execution_id = guard.key().to_string();
    if let Err(e) = guard.release().await {
        tracing::warn!(execution_id, error = %e, "failed to release execution lock");
    }
}

async fn with_timeout<T, F>(timeout: Option<f64>, what: &str, fut: F) -> Result<T, MachineError>
where
    F: std::future::Future<Output = Result<T, MachineError>>,
{
    match timeout {
        Some(seconds) => {
            let limit = Duration::try_from_secs_f64(seconds).map_err(|e| {
                MachineError::Configuration(format!("invalid {what} timeout {seconds}: {e}"))
            })?;
            tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| MachineError::Timeout {
                    what: what.to_string(),
                    seconds,
                })?
        }
        None => fut.await,
    }
}

fn is_error_wrapper(value: &Value) -> bool {
    value.get("_error").is_some()
}

/// Unwrap a child's published result, turning error wrappers into failures.
fn child_outcome(value: Value) -> Result<Value, MachineError> {
    if let Value::Object(map) = &value {
        if let Some(error) = map.get("_error") {
            let kind = map
                .get("_error_type")
                .and_then(Value::as_str)
                .unwrap_or("ChildFailed");
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(MachineError::Work(WorkError::new(kind, message)));
        }
    }
    Ok(value)
}

fn with_item(scope: &Value, var: &str, item: Value) -> Value {
    let mut vars = scope.clone();
    if let Value::Object(map) = &mut vars {
        map.insert(var.to_string(), item);
    }
    vars
}

fn key_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use dashmap::DashMap;

    use crate::invoke::{ActionRunner, UnitOfWorkInvoker};
    use crate::machine::definition::parse_workflow_yaml;
    use crate::machine::hooks::HookError;
    use crate::store::{MemoryCheckpointStore, MemoryExecutionLock};

    // -----------------------------------------------------------------------
    // Test collaborators
    // -----------------------------------------------------------------------

    /// Invoker driven by a closure, counting calls per reference. The
    /// reference `sleep` waits ten seconds before answering.
    struct TestInvoker<F> {
        handler: F,
        calls: Arc<DashMap<String, usize>>,
    }

    impl<F> UnitOfWorkInvoker for TestInvoker<F>
    where
        F: Fn(&str, &Value, usize) -> Result<Value, WorkError> + Send + Sync,
    {
        async fn invoke(&self, reference: &str, input: &Value) -> Result<Value, WorkError> {
            let call = {
                let mut entry = self.calls.entry(reference.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            if reference == "sleep" {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            (self.handler)(reference, input, call)
        }
    }

    fn invoker<F>(handler: F) -> (BoxInvoker, Arc<DashMap<String, usize>>)
    where
        F: Fn(&str, &Value, usize) -> Result<Value, WorkError> + Send + Sync + 'static,
    {
        let calls = Arc::new(DashMap::new());
        let invoker = BoxInvoker::new(TestInvoker {
            handler,
            calls: Arc::clone(&calls),
        });
        (invoker, calls)
    }

    fn calls(counts: &DashMap<String, usize>, reference: &str) -> usize {
        counts.get(reference).map(|c| *c).unwrap_or(0)
    }

    fn builder(yaml: &str) -> MachineExecutorBuilder {
        machina_observe::init_test_tracing();
        MachineExecutor::builder(parse_workflow_yaml(yaml).unwrap())
    }

    // -----------------------------------------------------------------------
    // Scenario A: passthrough
    // -----------------------------------------------------------------------

    const PASSTHROUGH: &str = r#"
name: passthrough
context:
  greeting: "{{ input.greeting }}"
states:
  start:
    type: initial
    transitions:
      - to: done
  done:
    type: final
    output: "{{ context.greeting }}"
"#;

    #[tokio::test]
    async fn test_two_state_passthrough_returns_context_value() {
        let executor = builder(PASSTHROUGH).build().unwrap();
        let output = executor.run(json!({ "greeting": "hello" })).await.unwrap();
        assert_eq!(output, json!("hello"));
    }

    #[tokio::test]
    async fn test_final_without_output_returns_context() {
        let yaml = r#"
name: bare
context: { a: 1, b: "{{ input.b }}" }
states:
  start: { type: initial, transitions: [{ to: done }] }
  done: { type: final }
"#;
        let output = builder(yaml).build().unwrap().run(json!({ "b": "x" })).await.unwrap();
        assert_eq!(output, json!({ "a": 1, "b": "x" }));
    }

    #[tokio::test]
    async fn test_result_is_published_and_checkpoints_written() {
        let store = BoxCheckpointStore::new(MemoryCheckpointStore::new());
        let executor = builder(PASSTHROUGH)
            .checkpoint_store(store.clone())
            .build()
            .unwrap();
        executor
            .run_with_id("exec-a", json!({ "greeting": "hi" }))
            .await
            .unwrap();

        let published = executor
            .result_channel()
            .read(&executor.result_uri("exec-a"), ReadOptions::non_blocking())
            .await
            .unwrap();
        assert_eq!(published, ReadOutcome::Ready(json!("hi")));

        let keys = store.list("exec-a/").await.unwrap();
        assert_eq!(
            keys,
            vec!["exec-a/step_000000", "exec-a/step_000001", "exec-a/step_000002"]
        );
        let latest = executor.checkpoints().latest("exec-a").await.unwrap().unwrap();
        assert_eq!(latest.event, CheckpointEvent::MachineEnd);
        assert!(latest.is_complete());
    }

    #[tokio::test]
    async fn test_empty_checkpoint_events_disable_checkpointing() {
        let yaml = format!("{PASSTHROUGH}settings:\n  checkpoint_events: []\n");
        let store = BoxCheckpointStore::new(MemoryCheckpointStore::new());
        let executor = builder(&yaml).checkpoint_store(store.clone()).build().unwrap();
        executor.run_with_id("quiet", json!({})).await.unwrap();
        assert!(store.list("quiet/").await.unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Scenario B: loop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_loop_runs_exactly_three_times() {
        let yaml = r#"
name: looping
context: { round: 0 }
states:
  start:
    type: initial
    transitions: [{ to: work }]
  work:
    agent: tick
    output_to_context:
      round: "{{ context.round + 1 }}"
    transitions:
      - condition: "context.round < 3"
        to: work
      - to: done
  done:
    type: final
    output: "{{ context.round }}"
"#;
        let (invoker, counts) = invoker(|_, _, call| Ok(json!(call)));
        let executor = builder(yaml).invoker(invoker).build().unwrap();
        let output = executor.run(json!({})).await.unwrap();
        assert_eq!(output, json!(3));
        assert_eq!(calls(&counts, "tick"), 3);
    }

    #[tokio::test]
    async fn test_output_mapping_sees_output_and_input() {
        let yaml = r#"
name: mapping
context: { topic: "{{ input.topic }}" }
states:
  start:
    type: initial
    agent: research
    input: { q: "{{ context.topic }}" }
    output_to_context:
      answer: "{{ output.text }}"
      asked: "{{ input.q }}"
    transitions:
      - condition: "output.text == 'rust!'"
        to: done
  done:
    type: final
"#;
        let (invoker, _) = invoker(|_, input, _| {
            let q = input["q"].as_str().unwrap_or_default();
            Ok(json!({ "text": format!("{q}!") }))
        });
        let output = builder(yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({ "topic": "rust" }))
            .await
            .unwrap();
        assert_eq!(output["answer"], json!("rust!"));
        assert_eq!(output["asked"], json!("rust"));
    }

    // -----------------------------------------------------------------------
    // Scenario C: error routing
    // -----------------------------------------------------------------------

    const ALWAYS_FAILS: &str = r#"
name: failing
states:
  start:
    type: initial
    agent: broken
    on_error:
      default: recover
    transitions: [{ to: done }]
  recover:
    type: final
    output:
      type: "{{ context.last_error_type }}"
      message: "{{ context.last_error }}"
  done:
    type: final
"#;

    #[tokio::test]
    async fn test_on_error_default_routes_to_recovery() {
        let (invoker, _) = invoker(|_, _, _| Err(WorkError::new("Boom", "kaput")));
        let output = builder(ALWAYS_FAILS)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap();
        assert_eq!(output, json!({ "type": "Boom", "message": "kaput" }));
    }

    #[tokio::test]
    async fn test_on_error_by_type_without_match_propagates() {
        let yaml = r#"
name: typed
states:
  start:
    type: initial
    agent: broken
    on_error: { RateLimit: wait }
    transitions: [{ to: done }]
  wait: { type: final }
  done: { type: final }
"#;
        let (invoker, _) = invoker(|_, _, _| Err(WorkError::new("ValueError", "bad")));
        let err = builder(yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "ValueError");
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_error_hook_overrides_routing() {
        struct ToDone;
        impl MachineHooks for ToDone {
            fn on_error(
                &self,
                _error: ErrorInfo<'_>,
                _context: &Map<String, Value>,
                _recovery: Option<String>,
            ) -> Result<Option<String>, HookError> {
                Ok(Some("done".to_string()))
            }
        }

        let (invoker, _) = invoker(|_, _, _| Err(WorkError::new("Boom", "x")));
        let output = builder(ALWAYS_FAILS)
            .invoker(invoker)
            .hook(ToDone)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap();
        assert_eq!(output["last_error_type"], json!("Boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_timeout_routes_as_timeout_exceeded() {
        let yaml = r#"
name: slow
states:
  start:
    type: initial
    agent: sleep
    timeout: 0.5
    on_error: { TimeoutExceeded: slow_path }
    transitions: [{ to: done }]
  slow_path:
    type: final
    output: "{{ context.last_error_type }}"
  done: { type: final }
"#;
        let (invoker, _) = invoker(|_, _, _| Ok(json!("late")));
        let output = builder(yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap();
        assert_eq!(output, json!("TimeoutExceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_strategy_wraps_agent() {
        let yaml = r#"
name: retrying
states:
  start:
    type: initial
    agent: flaky
    execution: { type: retry, backoffs: [1, 1, 1], jitter: 0 }
    transitions: [{ to: done }]
  done:
    type: final
    output: "{{ context }}"
"#;
        let (invoker, counts) = invoker(|_, _, call| {
            if call < 3 {
                Err(WorkError::new("Flaky", "again"))
            } else {
                Ok(json!("ok"))
            }
        });
        builder(yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap();
        assert_eq!(calls(&counts, "flaky"), 3);
    }

    // -----------------------------------------------------------------------
    // Fatal conditions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_step_budget_exceeded_is_fatal() {
        let yaml = r#"
name: forever
states:
  start:
    type: initial
    transitions: [{ to: spin }]
  spin:
    transitions: [{ to: spin }]
  done: { type: final }
settings:
  max_steps: 5
"#;
        let store = BoxCheckpointStore::new(MemoryCheckpointStore::new());
        let executor = builder(yaml).checkpoint_store(store).build().unwrap();
        let err = executor.run_with_id("spin-1", json!({})).await.unwrap_err();
        assert!(matches!(err, MachineError::StepBudgetExceeded { max_steps: 5 }));
        assert!(!err.is_recoverable());

        let latest = executor.checkpoints().latest("spin-1").await.unwrap().unwrap();
        assert_eq!(latest.event, CheckpointEvent::Error);
    }

    #[tokio::test]
    async fn test_builder_default_max_steps_applies() {
        let yaml = r#"
name: forever
states:
  start:
    type: initial
    transitions: [{ to: start }]
"#;
        let err = builder(yaml)
            .default_max_steps(3)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::StepBudgetExceeded { max_steps: 3 }));
    }

    #[tokio::test]
    async fn test_no_matching_transition_is_fatal() {
        let yaml = r#"
name: stuck
context: { n: 1 }
states:
  start:
    type: initial
    transitions:
      - condition: "context.n > 5"
        to: done
  done: { type: final }
"#;
        let err = builder(yaml).build().unwrap().run(json!({})).await.unwrap_err();
        assert!(matches!(err, MachineError::NoTransition { ref state } if state == "start"));
        assert_eq!(err.error_type(), "ConfigurationError");
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected_at_build() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(
            "name: x\nstates:\n  a: { type: initial, transitions: [{ to: ghost }] }\n",
        )
        .unwrap();
        let err = MachineExecutor::builder(def).build().err().unwrap();
        assert!(matches!(err, MachineError::Definition(_)));
    }

    // -----------------------------------------------------------------------
    // Lock
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_lock_contention_fails_fast() {
        let lock = BoxExecutionLock::new(MemoryExecutionLock::new());
        let executor = builder(PASSTHROUGH)
            .execution_lock(lock.clone())
            .build()
            .unwrap();

        assert!(lock.acquire("busy").await.unwrap());
        let err = executor.run_with_id("busy", json!({})).await.unwrap_err();
        assert!(matches!(err, MachineError::LockContention(ref id) if id == "busy"));

        lock.release("busy").await.unwrap();
        executor
            .run_with_id("busy", json!({ "greeting": "now" }))
            .await
            .unwrap();
        // Released after success as well.
        assert!(lock.acquire("busy").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_released_after_failure() {
        let lock = BoxExecutionLock::new(MemoryExecutionLock::new());
        let yaml = ALWAYS_FAILS.replace("    on_error:\n      default: recover\n", "");
        let executor = builder(&yaml).execution_lock(lock.clone()).build().unwrap();
        executor.run_with_id("f1", json!({})).await.unwrap_err();
        assert!(lock.acquire("f1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_released_when_run_is_cancelled() {
        let yaml = r#"
name: cancellable
states:
  start:
    type: initial
    agent: sleep
    transitions: [{ to: done }]
  done: { type: final }
"#;
        let lock = BoxExecutionLock::new(MemoryExecutionLock::new());
        let (invoker, counts) = invoker(|_, _, _| Ok(json!(null)));
        let executor = builder(yaml)
            .invoker(invoker)
            .execution_lock(lock.clone())
            .build()
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_millis(2),
            executor.run_with_id("c1", json!({})),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(calls(&counts, "sleep"), 1);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(lock.acquire("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_is_an_error_not_a_panic() {
        let err = with_timeout(Some(1.0e30), "agent", async { Ok(json!(1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::Configuration(_)));

        let ok = with_timeout(Some(1.0), "agent", async { Ok(json!(2)) }).await;
        assert_eq!(ok.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_rejected_at_build() {
        let yaml = r#"
name: huge
states:
  start: { type: initial, agent: x, timeout: 1.0e30, transitions: [{ to: done }] }
  done: { type: final }
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        let err = MachineExecutor::builder(def).build().err().unwrap();
        assert!(matches!(err, MachineError::Definition(_)));
    }

    // -----------------------------------------------------------------------
    // Actions and hooks
    // -----------------------------------------------------------------------

    struct Counter;

    impl ActionRunner for Counter {
        async fn run(
            &self,
            action: &str,
            context: &Map<String, Value>,
        ) -> Result<Map<String, Value>, WorkError> {
            let n = context.get("n").and_then(Value::as_i64).unwrap_or(0);
            let mut patch = Map::new();
            patch.insert("n".to_string(), json!(n + 1));
            patch.insert("last_action".to_string(), json!(action));
            Ok(patch)
        }
    }

    #[tokio::test]
    async fn test_action_patch_merges_into_context() {
        let yaml = r#"
name: actions
context: { n: 10 }
states:
  start:
    type: initial
    action: bump
    transitions:
      - condition: "output.n == 11"
        to: done
  done: { type: final }
"#;
        let output = builder(yaml)
            .action_runner(BoxActionRunner::new(Counter))
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap();
        assert_eq!(output, json!({ "n": 11, "last_action": "bump" }));
    }

    struct Audit;

    impl MachineHooks for Audit {
        fn on_state_enter(
            &self,
            state: &str,
            mut context: Map<String, Value>,
        ) -> Result<Map<String, Value>, HookError> {
            let mut trail = context
                .get("trail")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            trail.push(json!(state));
            context.insert("trail".to_string(), Value::Array(trail));
            Ok(context)
        }

        fn on_transition(
            &self,
            _from: &str,
            to: String,
            _context: &Map<String, Value>,
        ) -> Result<String, HookError> {
            Ok(if to == "skipped" { "done".to_string() } else { to })
        }

        fn on_machine_end(
            &self,
            _machine: &str,
            context: &Map<String, Value>,
            _output: Value,
        ) -> Result<Value, HookError> {
            Ok(context.get("trail").cloned().unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_hooks_rewrite_context_target_and_output() {
        let yaml = r#"
name: hooked
states:
  start: { type: initial, transitions: [{ to: skipped }] }
  skipped: { transitions: [{ to: done }] }
  done: { type: final }
"#;
        let output = builder(yaml)
            .hook(Audit)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap();
        assert_eq!(output, json!(["start", "done"]));
    }

    // -----------------------------------------------------------------------
    // Child machines
    // -----------------------------------------------------------------------

    const FAN_OUT: &str = r#"
name: parent
context: { items: "{{ input.items }}" }
states:
  start:
    type: initial
    machine: [ok_child, bad_child, ok_child]
    transitions: [{ to: done }]
  done:
    type: final
machines:
  ok_child:
    name: ok_child
    states:
      run:
        type: initial
        agent: good
        input: "{{ context }}"
        output_to_context: { result: "{{ output }}" }
        transitions: [{ to: end }]
      end:
        type: final
        output: "{{ context.result }}"
  bad_child:
    name: bad_child
    states:
      run:
        type: initial
        agent: bad
        transitions: [{ to: end }]
      end: { type: final }
"#;

    fn child_invoker() -> (BoxInvoker, Arc<DashMap<String, usize>>) {
        invoker(|reference, input, call| match reference {
            "bad" => Err(WorkError::new("ValueError", "child blew up")),
            _ => Ok(json!({ "call": call, "input": input })),
        })
    }

    #[tokio::test]
    async fn test_settled_fan_out_fails_when_one_child_fails() {
        let (invoker, counts) = child_invoker();
        let err = builder(FAN_OUT)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({ "items": [] }))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "ValueError");
        assert_eq!(err.error_message(), "child blew up");
        assert_eq!(calls(&counts, "good"), 2);
    }

    #[tokio::test]
    async fn test_settled_fan_out_returns_positional_results() {
        let yaml = FAN_OUT.replace("[ok_child, bad_child, ok_child]", "[ok_child, ok_child]")
            .replace("transitions: [{ to: done }]\n  done:\n    type: final\n", "output_to_context: { results: \"{{ output }}\" }\n    transitions: [{ to: done }]\n  done:\n    type: final\n    output: \"{{ context.results | length }}\"\n");
        let (invoker, _) = child_invoker();
        let output = builder(&yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({ "items": [] }))
            .await
            .unwrap();
        assert_eq!(output, json!(2));
    }

    #[tokio::test]
    async fn test_single_child_machine_returns_child_output() {
        let yaml = r#"
name: parent
states:
  start:
    type: initial
    machine: child
    input: { value: 7 }
    output_to_context: { got: "{{ output }}" }
    transitions: [{ to: done }]
  done:
    type: final
    output: "{{ context.got }}"
machines:
  child:
    name: child
    context: { doubled: "{{ input.value * 2 }}" }
    states:
      run: { type: initial, transitions: [{ to: end }] }
      end:
        type: final
        output: "{{ context.doubled }}"
"#;
        let store = BoxCheckpointStore::new(MemoryCheckpointStore::new());
        let executor = builder(yaml).checkpoint_store(store).build().unwrap();
        let output = executor.run_with_id("p", json!({})).await.unwrap();
        assert_eq!(output, json!(14));

        let child = executor.checkpoints().latest("p.1.0").await.unwrap().unwrap();
        assert_eq!(child.parent_execution_id.as_deref(), Some("p"));
        assert_eq!(child.machine_name, "child");

        let parent = executor.checkpoints().latest("p").await.unwrap().unwrap();
        assert!(parent.pending_launches.is_empty());
    }

    #[tokio::test]
    async fn test_foreach_with_key_returns_map() {
        let yaml = r#"
name: parent
context: { users: "{{ input.users }}" }
states:
  start:
    type: initial
    machine: greet
    foreach: "{{ context.users }}"
    as: user
    key: "{{ user.id }}"
    input: { name: "{{ user.name }}" }
    output_to_context: { greetings: "{{ output }}" }
    transitions: [{ to: done }]
  done:
    type: final
    output: "{{ context.greetings }}"
machines:
  greet:
    name: greet
    context: { line: "hi {{ input.name }}" }
    states:
      run: { type: initial, transitions: [{ to: end }] }
      end:
        type: final
        output: "{{ context.line }}"
"#;
        let output = builder(yaml)
            .build()
            .unwrap()
            .run(json!({ "users": [{ "id": "u1", "name": "ada" }, { "id": "u2", "name": "bob" }] }))
            .await
            .unwrap();
        assert_eq!(output, json!({ "u1": "hi ada", "u2": "hi bob" }));
    }

    #[tokio::test]
    async fn test_foreach_without_key_returns_list() {
        let yaml = r#"
name: parent
states:
  start:
    type: initial
    machine: echo
    foreach: "{{ [1, 2, 3] }}"
    input: { n: "{{ item }}" }
    output_to_context: { all: "{{ output }}" }
    transitions: [{ to: done }]
  done:
    type: final
    output: "{{ context.all }}"
machines:
  echo:
    name: echo
    context: { n: "{{ input.n }}" }
    states:
      run: { type: initial, transitions: [{ to: end }] }
      end: { type: final, output: "{{ context.n }}" }
"#;
        let output = builder(yaml).build().unwrap().run(json!({})).await.unwrap();
        assert_eq!(output, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_any_mode_returns_first_success() {
        let yaml = FAN_OUT
            .replace("[ok_child, bad_child, ok_child]", "[bad_child, ok_child]")
            .replace(
                "    transitions: [{ to: done }]\n  done:\n    type: final\n",
                "    mode: any\n    output_to_context: { winner: \"{{ output }}\" }\n    transitions: [{ to: done }]\n  done:\n    type: final\n    output: \"{{ context.winner.call }}\"\n",
            );
        let (invoker, _) = child_invoker();
        let output = builder(&yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({ "items": [] }))
            .await
            .unwrap();
        assert_eq!(output, json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_mode_all_failed_returns_earliest_launch_error() {
        let yaml = r#"
name: parent
states:
  start:
    type: initial
    machine: [fast_fail, slow_fail]
    mode: any
    transitions: [{ to: done }]
  done: { type: final }
machines:
  fast_fail:
    name: fast_fail
    states:
      run: { type: initial, agent: bad, transitions: [{ to: end }] }
      end: { type: final }
  slow_fail:
    name: slow_fail
    states:
      run: { type: initial, agent: sleep, transitions: [{ to: end }] }
      end: { type: final }
"#;
        let (invoker, counts) = invoker(|reference, _, _| match reference {
            "bad" => Err(WorkError::new("ValueError", "fails at once")),
            _ => Err(WorkError::new("SlowFailure", "fails after a wait")),
        });
        let err = builder(yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "ValueError");
        assert_eq!(calls(&counts, "sleep"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_wait_timeout_is_routable() {
        let yaml = r#"
name: parent
states:
  start:
    type: initial
    machine: slow
    timeout: 1
    on_error: { TimeoutExceeded: gave_up }
    transitions: [{ to: done }]
  gave_up:
    type: final
    output: "{{ context.last_error_type }}"
  done: { type: final }
machines:
  slow:
    name: slow
    states:
      run: { type: initial, agent: sleep, transitions: [{ to: end }] }
      end: { type: final }
"#;
        let (invoker, _) = child_invoker();
        let output = builder(yaml)
            .invoker(invoker)
            .build()
            .unwrap()
            .run(json!({}))
            .await
            .unwrap();
        assert_eq!(output, json!("TimeoutExceeded"));
    }

    const LAUNCHER: &str = r#"
name: launcher
states:
  start:
    type: initial
    launch: worker
    input: { job: 5 }
    transitions: [{ to: done }]
  done:
    type: final
    output: "launched"
machines:
  worker:
    name: worker
    states:
      run:
        type: initial
        agent: good
        input: "{{ context }}"
        output_to_context: { out: "{{ output }}" }
        transitions: [{ to: end }]
      end:
        type: final
        output: "{{ context.out.call }}"
"#;

    #[tokio::test]
    async fn test_launch_does_not_wait_and_child_publishes_result() {
        let (invoker, counts) = child_invoker();
        let executor = builder(LAUNCHER).invoker(invoker).build().unwrap();
        let output = executor.run_with_id("l1", json!({})).await.unwrap();
        assert_eq!(output, json!("launched"));

        let child = executor
            .result_channel()
            .read(
                "machina://l1.1.0/result",
                ReadOptions::blocking(Some(Duration::from_secs(5))),
            )
            .await
            .unwrap();
        assert_eq!(child, ReadOutcome::Ready(json!(1)));
        assert_eq!(calls(&counts, "good"), 1);
    }

    #[tokio::test]
    async fn test_child_self_reference_resolves() {
        let yaml = r#"
name: countdown
context: { n: "{{ input.n }}" }
states:
  start:
    type: initial
    transitions:
      - condition: "context.n > 0"
        to: recurse
      - to: done
  recurse:
    machine: countdown
    input: { n: "{{ context.n - 1 }}" }
    output_to_context: { inner: "{{ output }}" }
    transitions: [{ to: done }]
  done:
    type: final
    output: "{{ (context.inner or 0) + 1 }}"
"#;
        let output = builder(yaml).build().unwrap().run(json!({ "n": 3 })).await.unwrap();
        assert_eq!(output, json!(4));
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_resume_continues_from_failure_without_input() {
        let yaml = r#"
name: resumable
context: { topic: "{{ input.topic }}" }
states:
  start:
    type: initial
    transitions: [{ to: work }]
  work:
    agent: flaky
    output_to_context: { answer: "{{ output }}" }
    transitions: [{ to: done }]
  done:
    type: final
    output: "{{ context.topic }}-{{ context.answer }}"
"#;
        let (invoker, counts) = invoker(|_, _, call| {
            if call == 1 {
                Err(WorkError::new("Transient", "first call fails"))
            } else {
                Ok(json!("ok"))
            }
        });
        let store = BoxCheckpointStore::new(MemoryCheckpointStore::new());
        let executor = builder(yaml)
            .invoker(invoker)
            .checkpoint_store(store)
            .build()
            .unwrap();

        let err = executor
            .run_with_id("r1", json!({ "topic": "rust" }))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "Transient");

        let snapshot = executor.checkpoints().latest("r1").await.unwrap().unwrap();
        assert_eq!(snapshot.current_state, "work");
        assert_eq!(snapshot.event, CheckpointEvent::Error);

        let output = executor.resume("r1").await.unwrap();
        assert_eq!(output, json!("rust-ok"));
        assert_eq!(calls(&counts, "flaky"), 2);
    }

    #[tokio::test]
    async fn test_resume_reruns_child_that_failed() {
        let yaml = r#"
name: parent
states:
  start:
    type: initial
    machine: child
    output_to_context: { answer: "{{ output }}" }
    transitions: [{ to: done }]
  done:
    type: final
    output: "{{ context.answer }}"
machines:
  child:
    name: child
    states:
      work:
        type: initial
        agent: flaky
        output_to_context: { value: "{{ output }}" }
        transitions: [{ to: end }]
      end:
        type: final
        output: "{{ context.value }}"
"#;
        let (invoker, counts) = invoker(|_, _, call| {
            if call == 1 {
                Err(WorkError::new("Transient", "child blip"))
            } else {
                Ok(json!("recovered"))
            }
        });
        let executor = builder(yaml).invoker(invoker).build().unwrap();

        let err = executor.run_with_id("p", json!({})).await.unwrap_err();
        assert_eq!(err.error_type(), "Transient");
        assert_eq!(calls(&counts, "flaky"), 1);

        assert_eq!(executor.resume("p").await.unwrap(), json!("recovered"));
        assert_eq!(calls(&counts, "flaky"), 2);
        let child = executor
            .result_channel()
            .read("machina://p.1.0/result", ReadOptions::non_blocking())
            .await
            .unwrap();
        assert_eq!(child, ReadOutcome::Ready(json!("recovered")));
    }

    #[tokio::test]
    async fn test_resume_completed_execution_returns_stored_output() {
        let (invoker, counts) = invoker(|_, _, _| Ok(json!("never")));
        let executor = builder(PASSTHROUGH).invoker(invoker).build().unwrap();
        executor
            .run_with_id("done-1", json!({ "greeting": "bye" }))
            .await
            .unwrap();
        assert_eq!(executor.resume("done-1").await.unwrap(), json!("bye"));
        assert!(counts.is_empty());
    }

    #[tokio::test]
    async fn test_resume_without_snapshot_fails() {
        let executor = builder(PASSTHROUGH).build().unwrap();
        let err = executor.resume("ghost").await.unwrap_err();
        assert!(matches!(err, MachineError::NoSnapshot(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_resume_reissues_pending_launch_once() {
        let (invoker, counts) = child_invoker();
        let executor = builder(LAUNCHER).invoker(invoker).build().unwrap();

        let snapshot = MachineSnapshot {
            execution_id: "p".to_string(),
            machine_name: "launcher".to_string(),
            machine_version: "0.1.0".to_string(),
            current_state: "start".to_string(),
            step: 1,
            event: CheckpointEvent::Execute,
            context: Map::new(),
            output: None,
            parent_execution_id: None,
            pending_launches: vec![PendingLaunch {
                execution_id: "p.1.0".to_string(),
                machine: "worker".to_string(),
                input: json!({ "job": 5 }),
                launched: true,
            }],
            created_at: Utc::now(),
        };
        executor.checkpoints().save(&snapshot).await.unwrap();

        assert_eq!(executor.resume("p").await.unwrap(), json!("launched"));

        let child = executor
            .result_channel()
            .read(
                "machina://p.1.0/result",
                ReadOptions::blocking(Some(Duration::from_secs(5))),
            )
            .await
            .unwrap();
        assert!(matches!(child, ReadOutcome::Ready(_)));
        assert_eq!(calls(&counts, "good"), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_launch_with_published_result() {
        let (invoker, counts) = child_invoker();
        let executor = builder(LAUNCHER).invoker(invoker).build().unwrap();
        executor
            .result_channel()
            .write("machina://q.1.0/result", &json!("already"))
            .await
            .unwrap();

        let snapshot = MachineSnapshot {
            execution_id: "q".to_string(),
            machine_name: "launcher".to_string(),
            machine_version: "0.1.0".to_string(),
            current_state: "done".to_string(),
            step: 2,
            event: CheckpointEvent::Execute,
            context: Map::new(),
            output: None,
            parent_execution_id: None,
            pending_launches: vec![PendingLaunch::new(
                "q.1.0".to_string(),
                "worker".to_string(),
                json!({}),
            )],
            created_at: Utc::now(),
        };
        executor.checkpoints().save(&snapshot).await.unwrap();

        assert_eq!(executor.resume("q").await.unwrap(), json!("launched"));
        assert_eq!(calls(&counts, "good"), 0);

        let end = executor.checkpoints().latest("q").await.unwrap().unwrap();
        assert!(end.pending_launches.is_empty());
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_error_types_and_recoverability() {
        let timeout = MachineError::Timeout {
            what: "agent".to_string(),
            seconds: 1.0,
        };
        assert_eq!(timeout.error_type(), "TimeoutExceeded");
        assert!(timeout.is_recoverable());

        let lock = MachineError::LockContention("x".to_string());
        assert_eq!(lock.error_type(), "LockContention");
        assert!(!lock.is_recoverable());

        let work = MachineError::Work(WorkError::new("RateLimit", "slow down"));
        assert_eq!(work.error_type(), "RateLimit");
        assert_eq!(work.error_message(), "slow down");
    }

    #[test]
    fn test_child_outcome_unwraps_error_wrapper() {
        let err = child_outcome(json!({ "_error": "bad", "_error_type": "ValueError" })).unwrap_err();
        assert_eq!(err.error_type(), "ValueError");
        assert_eq!(child_outcome(json!({ "ok": 1 })).unwrap(), json!({ "ok": 1 }));
    }

    #[test]
    fn test_child_execution_id_format() {
        assert_eq!(child_execution_id("abc", 4, 2), "abc.4.2");
    }
}
