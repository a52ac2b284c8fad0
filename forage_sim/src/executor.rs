//! Runs a [`TaskPlan`] on a bounded worker pool.
//!
//! The coordinator owns all scheduling state. Workers only run task closures
//! and report back over a channel, so output registration and dependent
//! release happen on one thread in a well-defined order.

use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crossbeam_channel::unbounded;
use forage_proto::Fingerprint;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    artifact_cache::ArtifactCache,
    taskgraph::{GraphError, NodeId, TaskError, TaskInputs, TaskPlan},
};

/// Run-level cancellation flag shared with whoever may stop the run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Pool size; 0 uses the available parallelism.
    pub workers: usize,
    pub fail_fast: bool,
    pub cancel: CancellationToken,
}

impl ExecutorOptions {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done { cached: bool },
    Failed { error: String },
    Blocked { by: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub name: String,
    pub op: String,
    pub fingerprint: Fingerprint,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// (task, error) for every node that failed itself.
    pub failed: Vec<(String, String)>,
    /// Nodes that never ran because an upstream node failed.
    pub blocked: Vec<String>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.failed.len())?;
        if let Some((task, error)) = self.failed.first() {
            write!(f, ", first {task}: {error}")?;
        }
        if !self.blocked.is_empty() {
            write!(f, "; {} dependent task(s) blocked", self.blocked.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcomes: Vec<NodeOutcome>,
    pub cancelled: bool,
}

impl RunReport {
    fn count(&self, op: &str, predicate: impl Fn(&NodeStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.op == op && predicate(&outcome.status))
            .count()
    }

    /// Nodes of `op` whose closure actually ran to success.
    pub fn executed(&self, op: &str) -> usize {
        self.count(op, |status| *status == NodeStatus::Done { cached: false })
    }

    pub fn cache_hits(&self, op: &str) -> usize {
        self.count(op, |status| *status == NodeStatus::Done { cached: true })
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, NodeStatus::Failed { .. }))
    }

    pub fn blocked(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, NodeStatus::Blocked { .. }))
    }

    pub fn status_of(&self, name: &str) -> Option<&NodeStatus> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.name == name)
            .map(|outcome| &outcome.status)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| matches!(outcome.status, NodeStatus::Done { .. }))
    }

    pub fn into_result(self) -> Result<RunReport, GraphError> {
        let failed: Vec<(String, String)> = self
            .failures()
            .map(|outcome| match &outcome.status {
                NodeStatus::Failed { error } => (outcome.name.clone(), error.clone()),
                _ => (outcome.name.clone(), String::new()),
            })
            .collect();
        if failed.is_empty() {
            return Ok(self);
        }
        let blocked = self.blocked().map(|outcome| outcome.name.clone()).collect();
        Err(GraphError::TaskFailure(TaskFailure { failed, blocked }))
    }
}

type Completion<A> = (NodeId, std::thread::Result<Result<Vec<A>, TaskError>>);

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Executes `plan` against `cache`.
///
/// Node failures are recorded in the report; only cache I/O problems and pool
/// construction abort with an error.
pub fn execute<A>(
    plan: &TaskPlan<A>,
    cache: &ArtifactCache<A>,
    options: &ExecutorOptions,
) -> Result<RunReport, GraphError>
where
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    for (fingerprint, artifact) in &plan.seeds {
        if let Some(artifact) = artifact {
            cache.insert_transient(*fingerprint, artifact.clone());
        }
    }

    let workers = options.worker_count();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("forage-worker-{index}"))
        .build()
        .map_err(|err| GraphError::Pool(err.to_string()))?;

    let nodes = &plan.nodes;
    let mut status: Vec<NodeStatus> = vec![NodeStatus::Pending; nodes.len()];
    let mut waiting: Vec<usize> = nodes.iter().map(|node| node.producers.len()).collect();
    let mut ready: VecDeque<NodeId> = (0..nodes.len()).filter(|id| waiting[*id] == 0).collect();
    for &id in &ready {
        status[id] = NodeStatus::Ready;
    }

    let (tx, rx) = unbounded::<Completion<A>>();
    let mut in_flight = 0usize;
    let mut halted = false;
    let mut cancelled = false;
    let mut fatal: Option<GraphError> = None;

    let release = |id: NodeId,
                   status: &mut Vec<NodeStatus>,
                   waiting: &mut Vec<usize>,
                   ready: &mut VecDeque<NodeId>| {
        for &dependent in &plan.dependents[id] {
            waiting[dependent] -= 1;
            if waiting[dependent] == 0 && status[dependent] == NodeStatus::Pending {
                status[dependent] = NodeStatus::Ready;
                ready.push_back(dependent);
            }
        }
    };

    let block_downstream = |root: NodeId, status: &mut Vec<NodeStatus>| {
        let mut frontier: BTreeSet<NodeId> = plan.dependents[root].iter().copied().collect();
        while let Some(id) = frontier.pop_first() {
            if matches!(status[id], NodeStatus::Pending | NodeStatus::Ready) {
                status[id] = NodeStatus::Blocked {
                    by: nodes[root].name.clone(),
                };
                frontier.extend(plan.dependents[id].iter().copied());
            }
        }
    };

    loop {
        while !halted && in_flight < workers {
            let Some(id) = ready.pop_front() else {
                break;
            };
            if status[id] != NodeStatus::Ready {
                continue;
            }
            if options.cancel.is_cancelled() {
                ready.push_front(id);
                halted = true;
                cancelled = true;
                tracing::info!(target: "forage::taskgraph", "taskgraph.cancelled");
                break;
            }
            let node = &nodes[id];

            if node.outputs.iter().all(|(_, fp)| cache.contains(fp)) {
                tracing::trace!(
                    target: "forage::taskgraph",
                    task = %node.name,
                    fingerprint = %node.fingerprint.short(),
                    "task.cached"
                );
                status[id] = NodeStatus::Done { cached: true };
                release(id, &mut status, &mut waiting, &mut ready);
                continue;
            }

            let mut inputs = Vec::with_capacity(node.inputs.len());
            let mut missing = None;
            for (key, fingerprint) in &node.inputs {
                match cache.get(fingerprint) {
                    Ok(Some(artifact)) => inputs.push((key.clone(), artifact)),
                    Ok(None) => {
                        missing = Some(TaskError::MissingInput(key.clone()));
                        break;
                    }
                    Err(err) => {
                        fatal = Some(GraphError::Cache(err));
                        break;
                    }
                }
            }
            if fatal.is_some() {
                halted = true;
                ready.push_front(id);
                break;
            }
            if let Some(error) = missing {
                tracing::warn!(
                    target: "forage::taskgraph",
                    task = %node.name,
                    %error,
                    "task.failed"
                );
                status[id] = NodeStatus::Failed {
                    error: error.to_string(),
                };
                block_downstream(id, &mut status);
                halted |= options.fail_fast;
                continue;
            }

            status[id] = NodeStatus::Running;
            in_flight += 1;
            let run = node.run.clone();
            let tx = tx.clone();
            pool.spawn(move || {
                let inputs = TaskInputs::new(inputs);
                let result = catch_unwind(AssertUnwindSafe(|| run(&inputs)));
                // The coordinator outlives every worker it waits on.
                let _ = tx.send((id, result));
            });
        }

        if in_flight == 0 {
            break;
        }
        let Ok((id, result)) = rx.recv() else {
            break;
        };
        in_flight -= 1;
        let node = &nodes[id];

        let outcome = match result {
            Ok(Ok(outputs)) if outputs.len() == node.outputs.len() => {
                let registered = node
                    .outputs
                    .iter()
                    .zip(outputs)
                    .map(|((_, fp), artifact)| (*fp, Arc::new(artifact)))
                    .collect();
                match cache.insert_all(registered) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        fatal.get_or_insert(GraphError::Cache(err));
                        halted = true;
                        Err(TaskError::Cache("output registration failed".to_string()))
                    }
                }
            }
            Ok(Ok(outputs)) => Err(TaskError::OutputArity {
                declared: node.outputs.len(),
                actual: outputs.len(),
            }),
            Ok(Err(error)) => Err(error),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };

        match outcome {
            Ok(()) => {
                tracing::trace!(
                    target: "forage::taskgraph",
                    task = %node.name,
                    fingerprint = %node.fingerprint.short(),
                    "task.done"
                );
                status[id] = NodeStatus::Done { cached: false };
                release(id, &mut status, &mut waiting, &mut ready);
            }
            Err(error) => {
                tracing::warn!(
                    target: "forage::taskgraph",
                    task = %node.name,
                    %error,
                    "task.failed"
                );
                status[id] = NodeStatus::Failed {
                    error: error.to_string(),
                };
                block_downstream(id, &mut status);
                halted |= options.fail_fast;
            }
        }
    }

    if let Some(err) = fatal {
        return Err(err);
    }

    for entry in status.iter_mut() {
        if matches!(entry, NodeStatus::Pending | NodeStatus::Ready) {
            *entry = NodeStatus::Cancelled;
        }
    }
    let outcomes = nodes
        .iter()
        .zip(status)
        .map(|(node, status)| NodeOutcome {
            name: node.name.clone(),
            op: node.op.clone(),
            fingerprint: node.fingerprint,
            status,
        })
        .collect();
    Ok(RunReport {
        outcomes,
        cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskgraph::{ArtifactKey, TaskGraph, TaskSpec};
    use std::sync::atomic::AtomicUsize;

    fn add_one(name: &str, input: &str, output: &str, calls: Arc<AtomicUsize>) -> TaskSpec<f64> {
        let key = ArtifactKey::from(input);
        TaskSpec::new(name, "add")
            .input(input)
            .output(output)
            .run(move |inputs: &TaskInputs<f64>| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![inputs.get(&key)? + 1.0])
            })
    }

    fn failing(name: &str, input: &str, output: &str) -> TaskSpec<f64> {
        TaskSpec::new(name, "fail")
            .input(input)
            .output(output)
            .run(|_: &TaskInputs<f64>| Err(TaskError::Failed("negative precipitation".into())))
    }

    fn chain(calls: &Arc<AtomicUsize>) -> TaskGraph<f64> {
        let mut graph = TaskGraph::new();
        graph.seed("x0", Fingerprint::of_bytes(b"x0"), Some(0.0));
        graph.add_task(add_one("a", "x0", "x1", calls.clone()));
        graph.add_task(add_one("b", "x1", "x2", calls.clone()));
        graph.add_task(add_one("c", "x2", "x3", calls.clone()));
        graph
    }

    #[test]
    fn second_execution_is_fully_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ArtifactCache::in_memory();
        let options = ExecutorOptions {
            workers: 2,
            ..ExecutorOptions::default()
        };

        let plan = chain(&calls).plan().expect("plan");
        let report = execute(&plan, &cache, &options).expect("execute");
        assert_eq!(report.executed("add"), 3);
        let x3 = plan.fingerprint_of(&"x3".into()).expect("x3");
        assert_eq!(*cache.get(&x3).expect("get").expect("present"), 3.0);

        let replan = chain(&calls).plan().expect("plan");
        let second = execute(&replan, &cache, &options).expect("execute");
        assert_eq!(second.executed("add"), 0);
        assert_eq!(second.cache_hits("add"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failure_blocks_only_dependents() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new();
        graph.seed("x0", Fingerprint::of_bytes(b"x0"), Some(0.0));
        graph.add_task(failing("bad", "x0", "y1"));
        graph.add_task(add_one("after_bad", "y1", "y2", calls.clone()));
        graph.add_task(add_one("independent", "x0", "z1", calls.clone()));
        let plan = graph.plan().expect("plan");
        let cache = ArtifactCache::in_memory();
        let report = execute(&plan, &cache, &ExecutorOptions::default()).expect("execute");

        assert!(matches!(report.status_of("bad"), Some(NodeStatus::Failed { .. })));
        assert_eq!(
            report.status_of("after_bad"),
            Some(&NodeStatus::Blocked { by: "bad".into() })
        );
        assert_eq!(
            report.status_of("independent"),
            Some(&NodeStatus::Done { cached: false })
        );
        match report.into_result() {
            Err(GraphError::TaskFailure(failure)) => {
                assert_eq!(failure.failed.len(), 1);
                assert_eq!(failure.blocked, vec!["after_bad".to_string()]);
            }
            other => panic!("expected a task failure, got {other:?}"),
        }
    }

    #[test]
    fn fail_fast_cancels_undispatched_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new();
        graph.seed("x0", Fingerprint::of_bytes(b"x0"), Some(0.0));
        graph.add_task(failing("bad", "x0", "y1"));
        for i in 0..4 {
            graph.add_task(add_one(&format!("n{i}"), "x0", &format!("z{i}"), calls.clone()));
        }
        let plan = graph.plan().expect("plan");
        let options = ExecutorOptions {
            workers: 1,
            fail_fast: true,
            ..ExecutorOptions::default()
        };
        let report = execute(&plan, &ArtifactCache::in_memory(), &options).expect("execute");
        assert_eq!(report.executed("add"), 0);
        assert_eq!(report.status_of("n3"), Some(&NodeStatus::Cancelled));
    }

    #[test]
    fn cancelled_token_dispatches_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let plan = chain(&calls).plan().expect("plan");
        let options = ExecutorOptions::default();
        options.cancel.cancel();
        let report = execute(&plan, &ArtifactCache::in_memory(), &options).expect("execute");
        assert!(report.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(report
            .outcomes
            .iter()
            .all(|outcome| outcome.status == NodeStatus::Cancelled));
    }

    #[test]
    fn panicking_task_is_a_failure() {
        let mut graph = TaskGraph::new();
        graph.seed("x0", Fingerprint::of_bytes(b"x0"), Some(0.0));
        graph.add_task(
            TaskSpec::new("boom", "panic")
                .input("x0")
                .output("x1")
                .run(|_: &TaskInputs<f64>| panic!("tile exploded")),
        );
        let plan = graph.plan().expect("plan");
        let report = execute(&plan, &ArtifactCache::in_memory(), &ExecutorOptions::default())
            .expect("execute");
        match report.status_of("boom") {
            Some(NodeStatus::Failed { error }) => assert!(error.contains("tile exploded"), "{error}"),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn wrong_output_count_is_a_failure() {
        let mut graph = TaskGraph::new();
        graph.seed("x0", Fingerprint::of_bytes(b"x0"), Some(0.0));
        graph.add_task(
            TaskSpec::new("short", "arity")
                .input("x0")
                .output("x1")
                .output("x2")
                .run(|_: &TaskInputs<f64>| Ok(vec![1.0])),
        );
        let plan = graph.plan().expect("plan");
        let report = execute(&plan, &ArtifactCache::in_memory(), &ExecutorOptions::default())
            .expect("execute");
        assert!(matches!(report.status_of("short"), Some(NodeStatus::Failed { .. })));
    }
}
