//! The unit a node execution runs as.
//!
//! A node job walks its stages in order: pre duties, body, post duties. Each
//! stage first gates on the resources it declares (load, coordinate
//! dependencies, wait out `Busy`) and suspends by registering its activation
//! whenever one is not ready. The same job resumes at the stage it left.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::administration::{DutyContext, DutyDef, DutyState};
use crate::core::engine::{Launch, RuntimeInner};
use crate::core::failure::{Failure, FailureOrigin};
use crate::core::resource::{
    ResourceContainer, ResourceKey, ResourceRegistry, ResourceResolver, ScopeChain, ScopeKind,
};
use crate::core::scope::ThreadScope;
use crate::core::unit::{Activation, Affinity, Job, JobContext, JobStatus};
use crate::core::worker_pool::PoolError;

use super::{NodeDef, NodeId, WorkContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pre(usize),
    Body,
    Post(usize),
}

pub(crate) struct NodeJob {
    engine: Arc<RuntimeInner>,
    thread: Arc<ThreadScope>,
    node: NodeId,
    parameter: Value,
    handling: Option<Failure>,
    chain: Vec<NodeId>,
    affinity: Option<Affinity>,
    invocation: Option<ResourceRegistry>,
    stage: Stage,
    started: bool,
    gated: HashMap<ResourceKey, Arc<ResourceContainer>>,
    failed_resources: HashMap<ResourceKey, Arc<ResourceContainer>>,
    duty_state: DutyState,
    output: Option<Value>,
    branches: Vec<(NodeId, Value)>,
}

impl NodeJob {
    pub(crate) fn new(engine: Arc<RuntimeInner>, thread: Arc<ThreadScope>, launch: Launch) -> Self {
        Self {
            engine,
            thread,
            node: launch.node,
            parameter: launch.parameter,
            handling: launch.failure,
            chain: launch.chain,
            affinity: launch.affinity,
            invocation: None,
            stage: Stage::Pre(0),
            started: false,
            gated: HashMap::new(),
            failed_resources: launch.failed_resources,
            duty_state: DutyState::new(),
            output: None,
            branches: Vec::new(),
        }
    }

    /// Make every resource in `keys` (and whatever they coordinate with)
    /// ready. `Ok(false)` means the activation was registered and the job
    /// must suspend.
    fn gate(&mut self, keys: &[ResourceKey], activation: &Activation) -> Result<bool, Failure> {
        let resolver = ScopeChain {
            invocation: self.invocation.as_ref(),
            thread: Some(self.thread.registry()),
            process: self.thread.process().registry(),
        };

        let mut worklist: Vec<ResourceKey> = keys.to_vec();
        let mut visited: HashSet<ResourceKey> = HashSet::new();
        while let Some(key) = worklist.pop() {
            if !visited.insert(key) {
                continue;
            }
            let container = resolver.resolve(key)?;
            if !container.load(activation)? {
                return Ok(false);
            }
            for dep in container.coordinate(&resolver)? {
                worklist.push(dep.key());
            }
            if !container.is_ready(activation) {
                return Ok(false);
            }
            self.thread
                .oversight()
                .lock()
                .activate_governing(self.engine.graph.governing(key), &container)?;
            self.gated.insert(key, container);
        }
        Ok(true)
    }

    fn run_duty(&mut self, duty: &DutyDef, node: &NodeDef) -> Result<(), Failure> {
        let mut cx = DutyContext {
            duty,
            node: &node.name,
            parameter: &self.parameter,
            output: self.output.as_ref(),
            resources: &self.gated,
            oversight: self.thread.oversight(),
            state: &mut self.duty_state,
        };
        duty.duty.execute(&mut cx).map_err(|failure| {
            failure.originating(FailureOrigin::Administration {
                duty: duty.name.to_string(),
                node: node.name.to_string(),
            })
        })
    }

    fn run_body(&mut self, engine: &Arc<RuntimeInner>, node: &NodeDef) -> Result<Value, Failure> {
        let mut cx = WorkContext {
            engine,
            thread: &self.thread,
            node,
            parameter: &self.parameter,
            failure: self.handling.as_ref(),
            resources: &self.gated,
            failed_resources: &self.failed_resources,
            chain: &self.chain,
            affinity: self.affinity.as_ref(),
            branches: Vec::new(),
        };
        let result = node.work.execute(&mut cx);
        self.branches = cx.branches;
        result
    }

    fn fail_with(&mut self, failure: Failure) -> JobStatus {
        let engine = Arc::clone(&self.engine);
        let node = engine.graph.node(self.node);
        let mut failure = failure.originating(FailureOrigin::Unit {
            node: node.name.to_string(),
        });
        if let Some(handled) = self.handling.take() {
            failure = failure.raised_by_handler(node.name.to_string(), handled);
        }
        debug!(flow = %self.thread.id(), node = %node.name, error = %failure, "node failed");

        let mut held = HashMap::new();
        if let Some(registry) = self.invocation.take() {
            for container in registry.containers() {
                held.insert(container.key(), container);
            }
            self.thread.retain(registry);
        }
        held.extend(self.gated.drain());
        self.failed_resources.clear();
        engine.escalate(
            &self.thread,
            failure,
            Some(self.node),
            std::mem::take(&mut self.chain),
            self.affinity.clone(),
            held,
        );
        self.thread.exit(&engine);
        JobStatus::Complete
    }

    fn complete(&mut self, node: &NodeDef) -> JobStatus {
        let engine = Arc::clone(&self.engine);
        self.gated.clear();
        self.failed_resources.clear();
        if let Some(registry) = self.invocation.take() {
            registry.release_all_when_idle();
        }

        let output = self.output.take().unwrap_or(Value::Null);
        let continuations = node
            .next
            .iter()
            .map(|next| (*next, output.clone()))
            .chain(std::mem::take(&mut self.branches));
        for (next, parameter) in continuations {
            self.thread.enter();
            engine.schedule(
                &self.thread,
                Launch {
                    node: next,
                    parameter,
                    failure: None,
                    chain: Vec::new(),
                    affinity: self.affinity.clone(),
                    failed_resources: HashMap::new(),
                },
            );
        }
        debug!(flow = %self.thread.id(), node = %node.name, "node completed");
        self.thread.exit(&engine);
        JobStatus::Complete
    }

    fn cancel(&mut self) {
        self.thread.mark_cancelled();
        self.gated.clear();
        if let Some(registry) = self.invocation.take() {
            registry.release_all_when_idle();
        }
        let engine = Arc::clone(&self.engine);
        self.thread.exit(&engine);
    }
}

impl Job for NodeJob {
    fn run(&mut self, cx: &mut JobContext) -> JobStatus {
        if let Some(affinity) = cx.affinity() {
            self.affinity = Some(affinity.clone());
        }
        if self.thread.process().is_cancelled() {
            debug!(flow = %self.thread.id(), "process scope cancelled; skipping node");
            self.cancel();
            return JobStatus::Complete;
        }

        let engine = Arc::clone(&self.engine);
        let node = engine.graph.node(self.node);
        if !self.started {
            self.started = true;
            self.invocation = Some(ResourceRegistry::new(
                ScopeKind::Invocation,
                Arc::clone(&engine.graph.resources),
            ));
            let mut oversight = self.thread.oversight().lock();
            for id in &node.governed_by {
                oversight.bring_into_force(*id);
            }
        }

        loop {
            match self.stage {
                Stage::Pre(i) => {
                    let Some(&id) = node.pre.get(i) else {
                        self.stage = Stage::Body;
                        continue;
                    };
                    let duty = engine.graph.duty(id);
                    match self.gate(&duty.requires, cx.activation()) {
                        Ok(true) => {}
                        Ok(false) => return JobStatus::Suspended,
                        Err(failure) => return self.fail_with(failure),
                    }
                    if let Err(failure) = self.run_duty(duty, node) {
                        return self.fail_with(failure);
                    }
                    self.stage = Stage::Pre(i + 1);
                }
                Stage::Body => {
                    match self.gate(&node.requires, cx.activation()) {
                        Ok(true) => {}
                        Ok(false) => return JobStatus::Suspended,
                        Err(failure) => return self.fail_with(failure),
                    }
                    match self.run_body(&engine, node) {
                        Ok(output) => self.output = Some(output),
                        Err(failure) => return self.fail_with(failure),
                    }
                    self.stage = Stage::Post(0);
                }
                Stage::Post(i) => {
                    let Some(&id) = node.post.get(i) else {
                        return self.complete(node);
                    };
                    let duty = engine.graph.duty(id);
                    match self.gate(&duty.requires, cx.activation()) {
                        Ok(true) => {}
                        Ok(false) => return JobStatus::Suspended,
                        Err(failure) => return self.fail_with(failure),
                    }
                    if let Err(failure) = self.run_duty(duty, node) {
                        return self.fail_with(failure);
                    }
                    self.stage = Stage::Post(i + 1);
                }
            }
        }
    }

    fn fail(mut self: Box<Self>, _cx: &mut JobContext, failure: Failure) {
        self.fail_with(failure);
    }

    fn abandon(mut self: Box<Self>, error: &PoolError) {
        warn!(flow = %self.thread.id(), error = %error, "node job abandoned; cancelling flow");
        self.cancel();
    }
}
