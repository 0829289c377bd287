//! Resource declarations and their dependency DAG.
//!
//! A [`ResourceGraph`] owns a `Vec` of [`ResourceDeclaration`]s addressed by
//! [`NodeId`] index, plus an adjacency list of dependency edges. Edges read
//! "`from` depends on `to`": the orchestration engine must not start `from`
//! until `to` is created.
//!
//! Ordering uses Kahn's algorithm with a min-heap on insertion index, so the
//! order is stable: when two nodes are independent, the one declared first
//! comes first. A graph that cannot be fully ordered yields a
//! [`CycleError`] naming the nodes left on the cycle.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// What the engine does with the physical resource when its declaration is
/// removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    Retain,
}

impl RemovalPolicy {
    fn deletion_policy(&self) -> &'static str {
        match self {
            RemovalPolicy::Destroy => "Delete",
            RemovalPolicy::Retain => "Retain",
        }
    }
}

/// An inert descriptor of a desired cloud resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub logical_id: String,
    pub resource_type: String,
    pub properties: Value,
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

impl ResourceDeclaration {
    pub fn new(logical_id: impl Into<String>, resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            logical_id: logical_id.into(),
            resource_type: resource_type.into(),
            properties,
            removal_policy: RemovalPolicy::Destroy,
        }
    }

    pub fn retain(mut self) -> Self {
        self.removal_policy = RemovalPolicy::Retain;
        self
    }
}

/// Index of a declaration inside its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

/// `from` depends on `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyEdge {
    pub from: NodeId,
    pub to: NodeId,
}

/// A named template output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackOutput {
    pub name: String,
    pub value: Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate logical id '{0}'")]
    DuplicateLogicalId(String),
    #[error("'{0}' cannot depend on itself")]
    SelfDependency(String),
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("unknown logical id '{0}'")]
    UnknownLogicalId(String),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

/// The graph could not be ordered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circular dependency between: {}", .members.join(", "))]
pub struct CycleError {
    /// Logical ids of every node that could not be ordered.
    pub members: Vec<String>,
}

/// Explicit DAG of resource declarations.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceDeclaration>,
    /// `deps[i]`: nodes that `i` depends on, sorted and deduplicated.
    deps: Vec<BTreeSet<NodeId>>,
    by_id: HashMap<String, NodeId>,
    outputs: Vec<StackOutput>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, decl: ResourceDeclaration) -> Result<NodeId, GraphError> {
        if self.by_id.contains_key(&decl.logical_id) {
            return Err(GraphError::DuplicateLogicalId(decl.logical_id));
        }
        let id = NodeId(self.nodes.len());
        self.by_id.insert(decl.logical_id.clone(), id);
        self.nodes.push(decl);
        self.deps.push(BTreeSet::new());
        Ok(id)
    }

    /// Record that `from` depends on `to`. Adding an existing edge is a no-op.
    pub fn depend(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.check(from)?;
        self.check(to)?;
        if from == to {
            return Err(GraphError::SelfDependency(self.nodes[from.0].logical_id.clone()));
        }
        self.deps[from.0].insert(to);
        Ok(())
    }

    /// [`depend`](Self::depend) by logical id.
    pub fn depend_on(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let from = self.require(from)?;
        let to = self.require(to)?;
        self.depend(from, to)
    }

    pub fn add_output(&mut self, name: impl Into<String>, value: Value, description: Option<&str>) {
        self.outputs.push(StackOutput {
            name: name.into(),
            value,
            description: description.map(str::to_string),
        });
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, logical_id: &str) -> Option<NodeId> {
        self.by_id.get(logical_id).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<&ResourceDeclaration> {
        self.nodes.get(id.0)
    }

    pub fn declarations(&self) -> &[ResourceDeclaration] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[StackOutput] {
        &self.outputs
    }

    /// Direct dependencies of `id`, in index order.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.deps
            .get(id.0)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Nodes that directly depend on `id`, in index order.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.deps
            .iter()
            .enumerate()
            .filter(|(_, d)| d.contains(&id))
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.deps
            .iter()
            .enumerate()
            .flat_map(|(i, d)| {
                d.iter().map(move |&to| DependencyEdge {
                    from: NodeId(i),
                    to,
                })
            })
            .collect()
    }

    /// Whether `from` reaches `to` through one or more edges.
    pub fn depends_transitively(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.dependencies(from);
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if !std::mem::replace(&mut seen[n.0], true) {
                stack.extend(self.dependencies(n));
            }
        }
        false
    }

    /// Stable topological order: dependencies before dependents.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, CycleError> {
        let n = self.nodes.len();
        // dependents adjacency + remaining-dependency counts
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut pending: Vec<usize> = vec![0; n];
        for (i, d) in self.deps.iter().enumerate() {
            pending[i] = d.len();
            for to in d {
                adj[to.0].push(i);
            }
        }

        let mut heap: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| pending[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = heap.pop() {
            order.push(NodeId(i));
            for &next in &adj[i] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    heap.push(Reverse(next));
                }
            }
        }

        if order.len() != n {
            let members = (0..n)
                .filter(|&i| pending[i] > 0)
                .map(|i| self.nodes[i].logical_id.clone())
                .collect();
            return Err(CycleError { members });
        }
        Ok(order)
    }

    /// Group nodes into waves: every node sits one wave after its deepest
    /// dependency. Nodes within a wave are independent of each other.
    pub fn phases(&self) -> Result<Vec<Vec<NodeId>>, CycleError> {
        let order = self.topo_order()?;
        let mut depth = vec![0usize; self.nodes.len()];
        for id in &order {
            depth[id.0] = self.deps[id.0]
                .iter()
                .map(|d| depth[d.0] + 1)
                .max()
                .unwrap_or(0);
        }
        let waves = depth.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut phases = vec![Vec::new(); waves];
        for id in order {
            phases[depth[id.0]].push(id);
        }
        Ok(phases)
    }

    /// Render a CloudFormation-shaped template. Fails on a cycle.
    pub fn render_template(&self, description: &str) -> Result<Value, CycleError> {
        self.topo_order()?;

        let mut resources = Map::new();
        for (i, decl) in self.nodes.iter().enumerate() {
            let mut body = Map::new();
            body.insert("Type".into(), json!(decl.resource_type));
            if !decl.properties.is_null() {
                body.insert("Properties".into(), decl.properties.clone());
            }
            if !self.deps[i].is_empty() {
                let depends: Vec<&str> = self.deps[i]
                    .iter()
                    .map(|d| self.nodes[d.0].logical_id.as_str())
                    .collect();
                body.insert("DependsOn".into(), json!(depends));
            }
            let policy = decl.removal_policy.deletion_policy();
            body.insert("DeletionPolicy".into(), json!(policy));
            body.insert("UpdateReplacePolicy".into(), json!(policy));
            resources.insert(decl.logical_id.clone(), Value::Object(body));
        }

        let mut template = Map::new();
        template.insert("Description".into(), json!(description));
        template.insert("Resources".into(), Value::Object(resources));
        if !self.outputs.is_empty() {
            let mut outputs = Map::new();
            for out in &self.outputs {
                let mut body = Map::new();
                body.insert("Value".into(), out.value.clone());
                if let Some(d) = &out.description {
                    body.insert("Description".into(), json!(d));
                }
                outputs.insert(out.name.clone(), Value::Object(body));
            }
            template.insert("Outputs".into(), Value::Object(outputs));
        }
        Ok(Value::Object(template))
    }

    fn check(&self, id: NodeId) -> Result<(), GraphError> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(id))
        }
    }

    fn require(&self, logical_id: &str) -> Result<NodeId, GraphError> {
        self.find(logical_id)
            .ok_or_else(|| GraphError::UnknownLogicalId(logical_id.to_string()))
    }
}

/// Intrinsic `{"Ref": id}`.
pub fn reference(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

/// Intrinsic `{"Fn::GetAtt": [id, attr]}`.
pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

/// Intrinsic `{"Fn::Sub": template}`.
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}
