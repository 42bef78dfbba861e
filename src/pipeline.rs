use crate::Stage;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// An invalid pipeline, caught by [`PipelineBuilder::build`] before any
/// stage runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("duplicate stage name: {0}")]
    DuplicateStage(&'static str),
    #[error("unknown stage: {0}")]
    UnknownStage(&'static str),
    #[error("pipeline has no nodes")]
    EmptyPipeline,
    #[error("loop bound must be at least 1, got {0}")]
    InvalidLoopBound(usize),
    #[error("branch on '{0}' has no arms")]
    EmptyBranch(String),
    #[error("fan-out has no branches")]
    EmptyFanOut,
    #[error("stage '{0}' is used by more than one fan-out branch")]
    SharedFanOutStage(&'static str),
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One node of a pipeline tree. Stages are referenced by name, so the same
/// stage may appear in several places.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Run a registered stage, optionally under a deadline.
    Stage {
        name: &'static str,
        deadline: Option<Duration>,
    },
    /// Run the children in order.
    Sequence(Vec<Node>),
    /// Repeat `body` until a stage terminates or `max_iterations` passes ran.
    Loop {
        body: Vec<Node>,
        max_iterations: usize,
    },
    /// Run the first arm whose literal equals the blackboard value under
    /// `discriminant`, else `default`.
    Branch {
        discriminant: String,
        arms: Vec<(Value, Vec<Node>)>,
        default: Vec<Node>,
    },
    /// Run branches concurrently on copies of the blackboard.
    FanOut(Vec<FanOutBranch>),
}

impl Node {
    pub fn stage(name: &'static str) -> Self {
        Node::Stage {
            name,
            deadline: None,
        }
    }

    pub fn stage_with_deadline(name: &'static str, deadline: Duration) -> Self {
        Node::Stage {
            name,
            deadline: Some(deadline),
        }
    }

    pub fn sequence(nodes: Vec<Node>) -> Self {
        Node::Sequence(nodes)
    }

    pub fn repeat(max_iterations: usize, body: Vec<Node>) -> Self {
        Node::Loop {
            body,
            max_iterations,
        }
    }

    pub fn branch(
        discriminant: impl Into<String>,
        arms: Vec<(Value, Vec<Node>)>,
        default: Vec<Node>,
    ) -> Self {
        Node::Branch {
            discriminant: discriminant.into(),
            arms,
            default,
        }
    }

    /// A branch with a single arm and a no-op default.
    pub fn when(discriminant: impl Into<String>, value: impl Into<Value>, then: Vec<Node>) -> Self {
        Self::branch(discriminant, vec![(value.into(), then)], vec![])
    }

    pub fn fan_out(branches: Vec<FanOutBranch>) -> Self {
        Node::FanOut(branches)
    }
}

/// One branch of a [`Node::FanOut`]: the nodes to run and the keys to copy
/// back into the shared blackboard once every branch has finished.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutBranch {
    pub nodes: Vec<Node>,
    pub merge: Vec<String>,
}

impl FanOutBranch {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            merge: vec![],
        }
    }

    pub fn merge<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.merge.extend(keys.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// Plan (validated, flattened tree the walker executes)
// ---------------------------------------------------------------------------

pub(crate) type NodeId = usize;

pub(crate) enum Op {
    Stage {
        name: &'static str,
        deadline: Option<Duration>,
    },
    Sequence(Vec<NodeId>),
    Loop {
        body: NodeId,
        max_iterations: usize,
    },
    Branch {
        discriminant: String,
        arms: Vec<(Value, NodeId)>,
        default: NodeId,
    },
    FanOut(Vec<Lane>),
}

pub(crate) struct Lane {
    pub(crate) root: NodeId,
    pub(crate) merge: Vec<String>,
    pub(crate) stages: BTreeSet<&'static str>,
}

pub(crate) struct Plan {
    ops: Vec<Op>,
    root: NodeId,
}

impl Plan {
    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn op(&self, id: NodeId) -> &Op {
        &self.ops[id]
    }

    /// Children of a sequence node; empty for anything else.
    pub(crate) fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.ops[id] {
            Op::Sequence(children) => children.as_slice(),
            _ => &[],
        }
    }
}

pub(crate) type Registry = HashMap<&'static str, Box<dyn Stage>>;

struct Compiler<'a> {
    ops: Vec<Op>,
    known: &'a Registry,
}

impl Compiler<'_> {
    fn push(&mut self, op: Op) -> NodeId {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn sequence(
        &mut self,
        nodes: Vec<Node>,
        used: &mut BTreeSet<&'static str>,
    ) -> Result<NodeId, PipelineError> {
        let children = nodes
            .into_iter()
            .map(|node| self.node(node, used))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.push(Op::Sequence(children)))
    }

    fn node(
        &mut self,
        node: Node,
        used: &mut BTreeSet<&'static str>,
    ) -> Result<NodeId, PipelineError> {
        match node {
            Node::Stage { name, deadline } => {
                if !self.known.contains_key(name) {
                    return Err(PipelineError::UnknownStage(name));
                }
                used.insert(name);
                Ok(self.push(Op::Stage { name, deadline }))
            }
            Node::Sequence(nodes) => self.sequence(nodes, used),
            Node::Loop {
                body,
                max_iterations,
            } => {
                if max_iterations < 1 {
                    return Err(PipelineError::InvalidLoopBound(max_iterations));
                }
                let body = self.sequence(body, used)?;
                Ok(self.push(Op::Loop {
                    body,
                    max_iterations,
                }))
            }
            Node::Branch {
                discriminant,
                arms,
                default,
            } => {
                if arms.is_empty() {
                    return Err(PipelineError::EmptyBranch(discriminant));
                }
                let mut compiled = Vec::with_capacity(arms.len());
                for (value, nodes) in arms {
                    compiled.push((value, self.sequence(nodes, used)?));
                }
                let default = self.sequence(default, used)?;
                Ok(self.push(Op::Branch {
                    discriminant,
                    arms: compiled,
                    default,
                }))
            }
            Node::FanOut(branches) => {
                if branches.is_empty() {
                    return Err(PipelineError::EmptyFanOut);
                }
                let mut claimed: BTreeSet<&'static str> = BTreeSet::new();
                let mut lanes = Vec::with_capacity(branches.len());
                for branch in branches {
                    let mut stages = BTreeSet::new();
                    let root = self.sequence(branch.nodes, &mut stages)?;
                    if let Some(&shared) = stages.iter().find(|name| claimed.contains(*name)) {
                        return Err(PipelineError::SharedFanOutStage(shared));
                    }
                    claimed.extend(stages.iter().copied());
                    lanes.push(Lane {
                        root,
                        merge: branch.merge,
                        stages,
                    });
                }
                used.extend(claimed);
                Ok(self.push(Op::FanOut(lanes)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

pub struct PipelineBuilder {
    name: &'static str,
    stages: Registry,
    nodes: Vec<Node>,
    duplicate: Option<&'static str>,
}

impl PipelineBuilder {
    pub fn register<S: Stage>(mut self, stage: S) -> Self {
        let name = stage.name();
        if self.stages.contains_key(name) {
            self.duplicate = Some(name);
        }
        self.stages.insert(name, Box::new(stage));
        self
    }

    /// Append a node to the top-level sequence.
    pub fn then(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append a registered stage to the top-level sequence.
    pub fn stage(self, name: &'static str) -> Self {
        self.then(Node::stage(name))
    }

    pub fn stage_with_deadline(self, name: &'static str, deadline: Duration) -> Self {
        self.then(Node::stage_with_deadline(name, deadline))
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        if let Some(name) = self.duplicate {
            return Err(PipelineError::DuplicateStage(name));
        }
        if self.nodes.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }

        let mut compiler = Compiler {
            ops: Vec::new(),
            known: &self.stages,
        };
        let root = compiler.sequence(self.nodes, &mut BTreeSet::new())?;
        let plan = Plan {
            ops: compiler.ops,
            root,
        };

        Ok(Pipeline {
            name: self.name,
            plan,
            stages: self.stages,
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline (validated, only constructed via build())
// ---------------------------------------------------------------------------

pub struct Pipeline {
    name: &'static str,
    pub(crate) plan: Plan,
    pub(crate) stages: Registry,
}

impl Pipeline {
    pub fn builder(name: &'static str) -> PipelineBuilder {
        PipelineBuilder {
            name,
            stages: HashMap::new(),
            nodes: Vec::new(),
            duplicate: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Names of the registered stages, sorted.
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.stages.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
