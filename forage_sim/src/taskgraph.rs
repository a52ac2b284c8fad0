//! Fingerprinted task dependency graph.
//!
//! A graph is assembled from [`TaskSpec`]s and seeded external artifacts,
//! then [`TaskGraph::plan`] validates it, orders it topologically and derives
//! every fingerprint before anything runs. Execution lives in
//! [`crate::executor`].

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use forage_proto::{Fingerprint, FingerprintBuilder};
use serde::Serialize;
use thiserror::Error;

use crate::{artifact_cache::CacheError, executor::TaskFailure};

/// Name of an artifact within one graph generation, e.g. `state/t3/c0r1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ArtifactKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ArtifactKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub type NodeId = usize;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("task produced {actual} outputs, declared {declared}")]
    OutputArity { declared: usize, actual: usize },
    #[error("input {0} is not available")]
    MissingInput(ArtifactKey),
    #[error("input {key} is not a {expected} artifact")]
    InputType { key: ArtifactKey, expected: &'static str },
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("cache unavailable: {0}")]
    Cache(String),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("task {task} reads undeclared artifact {key}")]
    UnknownArtifact { task: String, key: ArtifactKey },
    #[error("artifact {key} is produced more than once")]
    DuplicateOutput { key: ArtifactKey },
    #[error("task {task} has an unencodable parameter: {reason}")]
    Param { task: String, reason: String },
    #[error(transparent)]
    TaskFailure(#[from] TaskFailure),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

/// Resolved inputs handed to a task closure.
pub struct TaskInputs<A> {
    values: Vec<(ArtifactKey, Arc<A>)>,
}

impl<A> TaskInputs<A> {
    pub(crate) fn new(values: Vec<(ArtifactKey, Arc<A>)>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &ArtifactKey) -> Result<&A, TaskError> {
        self.values
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_ref())
            .ok_or_else(|| TaskError::MissingInput(key.clone()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub type TaskFn<A> = Arc<dyn Fn(&TaskInputs<A>) -> Result<Vec<A>, TaskError> + Send + Sync>;

/// Declaration of one node. Outputs must be returned in declaration order.
pub struct TaskSpec<A> {
    name: String,
    op: String,
    inputs: Vec<ArtifactKey>,
    outputs: Vec<ArtifactKey>,
    params: Vec<(String, Vec<u8>)>,
    param_error: Option<String>,
    run: Option<TaskFn<A>>,
}

impl<A> TaskSpec<A> {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: Vec::new(),
            param_error: None,
            run: None,
        }
    }

    pub fn input(mut self, key: impl Into<ArtifactKey>) -> Self {
        self.inputs.push(key.into());
        self
    }

    pub fn output(mut self, key: impl Into<ArtifactKey>) -> Self {
        self.outputs.push(key.into());
        self
    }

    /// Adds a named parameter; its bincode encoding enters the fingerprint.
    pub fn param<T: Serialize>(mut self, name: &str, value: &T) -> Self {
        match bincode::serialize(value) {
            Ok(bytes) => self.params.push((name.to_string(), bytes)),
            Err(err) => {
                self.param_error.get_or_insert_with(|| format!("{name}: {err}"));
            }
        }
        self
    }

    pub fn run<F>(mut self, run: F) -> Self
    where
        F: Fn(&TaskInputs<A>) -> Result<Vec<A>, TaskError> + Send + Sync + 'static,
    {
        self.run = Some(Arc::new(run));
        self
    }
}

struct Seed<A> {
    key: ArtifactKey,
    fingerprint: Fingerprint,
    artifact: Option<Arc<A>>,
}

pub struct TaskGraph<A> {
    seeds: Vec<Seed<A>>,
    tasks: Vec<TaskSpec<A>>,
}

impl<A> Default for TaskGraph<A> {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

/// One validated node with its derived fingerprints.
pub struct PlannedNode<A> {
    pub name: String,
    pub op: String,
    pub fingerprint: Fingerprint,
    pub inputs: Vec<(ArtifactKey, Fingerprint)>,
    pub outputs: Vec<(ArtifactKey, Fingerprint)>,
    pub(crate) producers: Vec<NodeId>,
    pub(crate) run: TaskFn<A>,
}

/// A validated graph in topological order.
pub struct TaskPlan<A> {
    pub(crate) nodes: Vec<PlannedNode<A>>,
    pub(crate) dependents: Vec<Vec<NodeId>>,
    pub(crate) seeds: Vec<(Fingerprint, Option<Arc<A>>)>,
    fingerprints: HashMap<ArtifactKey, Fingerprint>,
}

impl<A> TaskPlan<A> {
    pub fn nodes(&self) -> &[PlannedNode<A>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn fingerprint_of(&self, key: &ArtifactKey) -> Option<Fingerprint> {
        self.fingerprints.get(key).copied()
    }

    pub fn node(&self, name: &str) -> Option<&PlannedNode<A>> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

impl<A: Send + Sync + 'static> TaskGraph<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an external artifact. Without a value it must already be
    /// present in the cache when a consumer runs.
    pub fn seed(&mut self, key: impl Into<ArtifactKey>, fingerprint: Fingerprint, artifact: Option<A>) {
        self.seeds.push(Seed {
            key: key.into(),
            fingerprint,
            artifact: artifact.map(Arc::new),
        });
    }

    pub fn add_task(&mut self, task: TaskSpec<A>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn plan(self) -> Result<TaskPlan<A>, GraphError> {
        let Self { seeds, tasks } = self;

        let mut fingerprints: HashMap<ArtifactKey, Fingerprint> = HashMap::new();
        for seed in &seeds {
            if fingerprints.insert(seed.key.clone(), seed.fingerprint).is_some() {
                return Err(GraphError::DuplicateOutput {
                    key: seed.key.clone(),
                });
            }
        }

        let mut producer_of: HashMap<&ArtifactKey, NodeId> = HashMap::new();
        for (id, task) in tasks.iter().enumerate() {
            if let Some(reason) = &task.param_error {
                return Err(GraphError::Param {
                    task: task.name.clone(),
                    reason: reason.clone(),
                });
            }
            for key in &task.outputs {
                if fingerprints.contains_key(key) || producer_of.insert(key, id).is_some() {
                    return Err(GraphError::DuplicateOutput { key: key.clone() });
                }
            }
        }

        let mut producers: Vec<Vec<NodeId>> = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let mut deps = Vec::new();
            for key in &task.inputs {
                match producer_of.get(key) {
                    Some(&producer) => {
                        if !deps.contains(&producer) {
                            deps.push(producer);
                        }
                    }
                    None if fingerprints.contains_key(key) => {}
                    None => {
                        return Err(GraphError::UnknownArtifact {
                            task: task.name.clone(),
                            key: key.clone(),
                        })
                    }
                }
            }
            producers.push(deps);
        }
        drop(producer_of);

        let order = topological_order(&tasks, &producers)?;

        // Fingerprints flow in topological order.
        let mut slots: Vec<Option<TaskSpec<A>>> = tasks.into_iter().map(Some).collect();
        let mut new_id = vec![0usize; slots.len()];
        for (position, &old) in order.iter().enumerate() {
            new_id[old] = position;
        }
        let mut nodes = Vec::with_capacity(order.len());
        for &old in &order {
            let Some(task) = slots[old].take() else {
                continue;
            };
            let inputs: Vec<(ArtifactKey, Fingerprint)> = task
                .inputs
                .iter()
                .map(|key| (key.clone(), fingerprints[key]))
                .collect();
            let mut builder = FingerprintBuilder::new("task");
            builder.str("op", &task.op);
            for (name, bytes) in &task.params {
                builder.bytes(name, bytes);
            }
            for (_, fingerprint) in &inputs {
                builder.fingerprint("input", fingerprint);
            }
            let fingerprint = builder.finish();
            let outputs: Vec<(ArtifactKey, Fingerprint)> = task
                .outputs
                .iter()
                .map(|key| {
                    let mut builder = FingerprintBuilder::new("artifact");
                    builder.fingerprint("task", &fingerprint).str("key", key.as_str());
                    (key.clone(), builder.finish())
                })
                .collect();
            for (key, output) in &outputs {
                fingerprints.insert(key.clone(), *output);
            }
            let run: TaskFn<A> = match task.run {
                Some(run) => run,
                None => {
                    let name = task.name.clone();
                    Arc::new(move |_: &TaskInputs<A>| {
                        Err(TaskError::Failed(format!("task {name} has no body")))
                    })
                }
            };
            nodes.push(PlannedNode {
                name: task.name,
                op: task.op,
                fingerprint,
                inputs,
                outputs,
                producers: producers[old].iter().map(|p| new_id[*p]).collect(),
                run,
            });
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        for (id, node) in nodes.iter().enumerate() {
            for &producer in &node.producers {
                dependents[producer].push(id);
            }
        }
        let seeds = seeds
            .into_iter()
            .map(|seed| (seed.fingerprint, seed.artifact))
            .collect();

        tracing::debug!(
            target: "forage::taskgraph",
            nodes = nodes.len(),
            "taskgraph.planned"
        );
        Ok(TaskPlan {
            nodes,
            dependents,
            seeds,
            fingerprints,
        })
    }
}

/// Kahn's algorithm; ties resolve to declaration order.
fn topological_order<A>(tasks: &[TaskSpec<A>], producers: &[Vec<NodeId>]) -> Result<Vec<NodeId>, GraphError> {
    let mut indegree: Vec<usize> = producers.iter().map(Vec::len).collect();
    let mut consumers: Vec<Vec<NodeId>> = vec![Vec::new(); tasks.len()];
    for (id, deps) in producers.iter().enumerate() {
        for &dep in deps {
            consumers[dep].push(id);
        }
    }
    let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse(id))
        .collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for &consumer in &consumers[id] {
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }
    if order.len() == tasks.len() {
        return Ok(order);
    }

    // Every leftover node still has a leftover producer, so walking producers
    // from any leftover node must revisit one.
    let placed: HashSet<NodeId> = order.iter().copied().collect();
    let start = (0..tasks.len())
        .find(|id| !placed.contains(id))
        .unwrap_or_default();
    let mut seen: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut walk = Vec::new();
    let mut current = start;
    while !seen.contains_key(&current) {
        seen.insert(current, walk.len());
        walk.push(current);
        match producers[current].iter().find(|dep| !placed.contains(dep)) {
            Some(&next) => current = next,
            None => break,
        }
    }
    let begin = seen.get(&current).copied().unwrap_or_default();
    let mut cycle: Vec<String> = walk[begin..]
        .iter()
        .rev()
        .map(|id| tasks[*id].name.clone())
        .collect();
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    Err(GraphError::CyclicDependency { cycle })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough(name: &str, input: &str, output: &str) -> TaskSpec<f64> {
        let key = ArtifactKey::from(input);
        TaskSpec::new(name, "pass")
            .input(input)
            .output(output)
            .run(move |inputs: &TaskInputs<f64>| Ok(vec![*inputs.get(&key)?]))
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let mut graph = TaskGraph::new();
        graph.seed("raw", Fingerprint::of_bytes(b"raw"), Some(1.0));
        graph.add_task(passthrough("late", "mid", "out"));
        graph.add_task(passthrough("early", "raw", "mid"));
        let plan = graph.plan().expect("plan");
        let names: Vec<&str> = plan.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
        assert!(plan.fingerprint_of(&"out".into()).is_some());
    }

    #[test]
    fn cycle_is_named() {
        let mut graph: TaskGraph<f64> = TaskGraph::new();
        graph.add_task(passthrough("a", "z", "x"));
        graph.add_task(passthrough("b", "x", "y"));
        graph.add_task(passthrough("c", "y", "z"));
        match graph.plan() {
            Err(GraphError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.len(), 4);
                assert_eq!(cycle.first(), cycle.last());
                for name in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|n| n == name), "{cycle:?}");
                }
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("cycle must be rejected"),
        }
    }

    #[test]
    fn undeclared_input_is_rejected() {
        let mut graph: TaskGraph<f64> = TaskGraph::new();
        graph.add_task(passthrough("a", "ghost", "x"));
        assert!(matches!(graph.plan(), Err(GraphError::UnknownArtifact { .. })));
    }

    #[test]
    fn duplicate_output_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.seed("raw", Fingerprint::of_bytes(b"raw"), Some(1.0));
        graph.add_task(passthrough("a", "raw", "x"));
        graph.add_task(passthrough("b", "raw", "x"));
        assert!(matches!(graph.plan(), Err(GraphError::DuplicateOutput { .. })));
    }

    #[test]
    fn fingerprints_follow_params_and_inputs() {
        let build = |seed: &[u8], rate: f64| {
            let mut graph = TaskGraph::new();
            graph.seed("raw", Fingerprint::of_bytes(seed), Some(1.0));
            graph.add_task(passthrough("a", "raw", "x").param("rate", &rate));
            graph.add_task(passthrough("b", "x", "y"));
            let plan = graph.plan().expect("plan");
            (
                plan.fingerprint_of(&"x".into()).expect("x"),
                plan.fingerprint_of(&"y".into()).expect("y"),
            )
        };
        let base = build(b"raw", 1.0);
        assert_eq!(base, build(b"raw", 1.0));
        let changed_param = build(b"raw", 2.0);
        assert_ne!(base.0, changed_param.0);
        assert_ne!(base.1, changed_param.1);
        assert_ne!(base.1, build(b"other", 1.0).1);
    }
}
