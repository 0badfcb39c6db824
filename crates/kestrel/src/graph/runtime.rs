// Graph runtime — registered graphs and stored-graph execution
//
// Registration decodes the bytes once, resolves every op, checks references
// and computes the execution order (Kahn's algorithm over data and control
// edges). Runs then only walk the precomputed order:
//
//   bind placeholders → materialize constants → one dispatch per node
//                     → collect declared outputs
//
// Every run starts from the registered definition; nothing a run produces is
// kept on the graph. A failing node stops the run; the caller gets the
// failure status and the node outputs produced so far.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;

use kestrel_core::{DType, Error, RandomGenerator, Result};

use crate::engine::Engine;
use crate::exec::context::{ExecutionContext, Operand};
use crate::exec::ops::{Op, OpFamily};
use crate::graph::flat::{
    FlatGraph, FlatVariable, GraphDecoder, JsonGraphDecoder, VarRef, VariableKind,
};

/// A graph variable with its decoded dtype and extents.
#[derive(Debug, Clone)]
pub(crate) struct GraphVariableDecl {
    pub id: i64,
    pub name: String,
    pub kind: VariableKind,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<i64>>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledNode {
    pub id: i64,
    pub name: String,
    pub op: Op,
    pub inputs: Vec<VarRef>,
    pub t_args: Vec<f64>,
    pub i_args: Vec<i64>,
    pub b_args: Vec<bool>,
    pub d_args: Vec<DType>,
    pub dimensions: Vec<i64>,
}

/// A decoded, validated graph held for repeated execution.
#[derive(Debug)]
pub struct RegisteredGraph {
    id: i64,
    pub(crate) variables: Vec<GraphVariableDecl>,
    pub(crate) order: Vec<CompiledNode>,
    outputs: Vec<VarRef>,
}

impl RegisteredGraph {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Names of the placeholders a run must supply, in declaration order.
    pub fn placeholders(&self) -> Vec<(i64, &str)> {
        self.variables
            .iter()
            .filter(|v| v.kind == VariableKind::Placeholder)
            .map(|v| (v.id, v.name.as_str()))
            .collect()
    }

    /// Node names in execution order.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn outputs(&self) -> &[VarRef] {
        &self.outputs
    }

    fn compile(id: i64, flat: FlatGraph) -> Result<RegisteredGraph> {
        let mut seen = HashSet::new();
        let ids = flat
            .variables
            .iter()
            .map(|v| v.id)
            .chain(flat.nodes.iter().map(|n| n.id));
        for vid in ids {
            if !seen.insert(vid) {
                return Err(Error::execution(format!(
                    "graph {id}: id {vid} declared more than once"
                )));
            }
        }

        let variables = flat
            .variables
            .iter()
            .map(|v| decode_variable(id, v))
            .collect::<Result<Vec<_>>>()?;
        let variable_ids: HashSet<i64> = variables.iter().map(|v| v.id).collect();
        let node_ids: HashSet<i64> = flat.nodes.iter().map(|n| n.id).collect();
        for v in &flat.variables {
            if let Some(bad) = v
                .control_deps
                .iter()
                .find(|d| !node_ids.contains(d) && !variable_ids.contains(d))
            {
                return Err(Error::execution(format!(
                    "graph {id}: variable {} has control dependency on unknown id {bad}",
                    v.name
                )));
            }
        }
        let gates = variable_gates(&flat.variables, &node_ids);

        let mut compiled = HashMap::with_capacity(flat.nodes.len());
        for node in &flat.nodes {
            let family = OpFamily::from_name(&node.family).ok_or_else(|| Error::UnknownOp {
                family: node.family.clone(),
                code: node.op,
            })?;
            let op = Op::from_code(family, node.op)?;
            for r in &node.inputs {
                let known = variable_ids.contains(&r.id()) || node_ids.contains(&r.id());
                if !known || r.index() != 0 {
                    return Err(Error::execution(format!(
                        "graph {id}: node {} reads unknown value [{}, {}]",
                        node.name,
                        r.id(),
                        r.index()
                    )));
                }
            }
            let d_args = node
                .d_args
                .iter()
                .map(|s| DType::from_str(s))
                .collect::<Result<Vec<_>>>()?;
            compiled.insert(
                node.id,
                CompiledNode {
                    id: node.id,
                    name: node.name.clone(),
                    op,
                    inputs: node.inputs.clone(),
                    t_args: node.t_args.clone(),
                    i_args: node.i_args.clone(),
                    b_args: node.b_args.clone(),
                    d_args,
                    dimensions: node.dimensions.clone(),
                },
            );
        }

        // Kahn over node→node edges, data and control alike. Ties keep
        // declaration order.
        let mut indegree: HashMap<i64, usize> = flat.nodes.iter().map(|n| (n.id, 0)).collect();
        let mut consumers: HashMap<i64, Vec<i64>> = HashMap::new();
        for node in &flat.nodes {
            let gated: Vec<i64> = node
                .inputs
                .iter()
                .map(VarRef::id)
                .chain(node.control_deps.iter().copied())
                .filter_map(|d| gates.get(&d))
                .flatten()
                .copied()
                .collect();
            let deps: HashSet<i64> = node
                .inputs
                .iter()
                .map(VarRef::id)
                .chain(node.control_deps.iter().copied())
                .filter(|d| node_ids.contains(d))
                .chain(gated)
                .collect();
            for dep in deps {
                consumers.entry(dep).or_default().push(node.id);
                *indegree.entry(node.id).or_default() += 1;
            }
            if let Some(bad) = node
                .control_deps
                .iter()
                .find(|d| !node_ids.contains(d) && !variable_ids.contains(d))
            {
                return Err(Error::execution(format!(
                    "graph {id}: node {} has control dependency on unknown id {bad}",
                    node.name
                )));
            }
        }
        let mut ready: VecDeque<i64> = flat
            .nodes
            .iter()
            .filter(|n| indegree[&n.id] == 0)
            .map(|n| n.id)
            .collect();
        let mut order = Vec::with_capacity(flat.nodes.len());
        while let Some(nid) = ready.pop_front() {
            if let Some(next) = consumers.get(&nid) {
                for c in next {
                    if let Some(d) = indegree.get_mut(c) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push_back(*c);
                        }
                    }
                }
            }
            if let Some(node) = compiled.remove(&nid) {
                order.push(node);
            }
        }
        if order.len() != flat.nodes.len() {
            return Err(Error::execution(format!(
                "graph {id}: dependency cycle among {} nodes",
                flat.nodes.len() - order.len()
            )));
        }

        let outputs = if flat.outputs.is_empty() {
            order.iter().map(|n| VarRef(n.id, 0)).collect()
        } else {
            for r in &flat.outputs {
                let known = variable_ids.contains(&r.id()) || node_ids.contains(&r.id());
                if !known || r.index() != 0 {
                    return Err(Error::execution(format!(
                        "graph {id}: declared output [{}, {}] does not exist",
                        r.id(),
                        r.index()
                    )));
                }
            }
            flat.outputs
        };

        Ok(RegisteredGraph {
            id,
            variables,
            order,
            outputs,
        })
    }
}

/// Node ids each variable waits on, following control dependencies through
/// other variables.
fn variable_gates(variables: &[FlatVariable], node_ids: &HashSet<i64>) -> HashMap<i64, Vec<i64>> {
    let direct: HashMap<i64, &[i64]> = variables
        .iter()
        .map(|v| (v.id, v.control_deps.as_slice()))
        .collect();
    let mut gates = HashMap::new();
    for v in variables {
        let mut seen = HashSet::new();
        let mut stack = v.control_deps.clone();
        let mut nodes = Vec::new();
        while let Some(d) = stack.pop() {
            if !seen.insert(d) {
                continue;
            }
            if node_ids.contains(&d) {
                nodes.push(d);
            } else if let Some(more) = direct.get(&d) {
                stack.extend_from_slice(more);
            }
        }
        if !nodes.is_empty() {
            gates.insert(v.id, nodes);
        }
    }
    gates
}

fn decode_variable(graph: i64, v: &FlatVariable) -> Result<GraphVariableDecl> {
    let dtype = v.dtype.as_deref().map(DType::from_str).transpose()?;
    if v.kind != VariableKind::Placeholder {
        let (Some(_), Some(shape)) = (dtype, v.shape.as_ref()) else {
            return Err(Error::execution(format!(
                "graph {graph}: constant {} needs a dtype and a shape",
                v.name
            )));
        };
        let len = shape
            .iter()
            .map(|&d| usize::try_from(d))
            .product::<std::result::Result<usize, _>>()
            .map_err(|_| Error::shape(format!("constant {} has a negative extent", v.name)))?;
        if len != v.values.len() {
            return Err(Error::shape(format!(
                "constant {} declares {len} elements but carries {}",
                v.name,
                v.values.len()
            )));
        }
    }
    Ok(GraphVariableDecl {
        id: v.id,
        name: v.name.clone(),
        kind: v.kind,
        dtype,
        shape: v.shape.clone(),
        values: v.values.clone(),
    })
}

/// One value reported by a run.
#[derive(Debug, Clone)]
pub struct GraphValue {
    pub id: i64,
    pub index: usize,
    pub name: String,
    pub operand: Operand,
}

/// Result of a stored-graph run.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    status: i32,
    message: String,
    variables: Vec<GraphValue>,
}

impl VariableSet {
    /// 0 on success, else the failing node's error code.
    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    pub fn size(&self) -> usize {
        self.variables.len()
    }

    pub fn at(&self, i: usize) -> Option<&GraphValue> {
        self.variables.get(i)
    }

    pub fn by_id(&self, id: i64, index: usize) -> Option<&GraphValue> {
        self.variables.iter().find(|v| v.id == id && v.index == index)
    }

    pub fn by_name(&self, name: &str) -> Option<&GraphValue> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphValue> {
        self.variables.iter()
    }
}

/// Registered graphs by id.
#[derive(Debug, Default)]
pub struct GraphRuntime {
    graphs: RwLock<HashMap<i64, Arc<RegisteredGraph>>>,
}

impl GraphRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graphs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.read().is_empty()
    }

    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.graphs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, id: i64) -> Result<Arc<RegisteredGraph>> {
        self.graphs
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::GraphNotFound { id })
    }

    fn insert(&self, graph: RegisteredGraph) -> Result<()> {
        let mut graphs = self.graphs.write();
        if graphs.contains_key(&graph.id) {
            return Err(Error::execution(format!(
                "graph {} is already registered",
                graph.id
            )));
        }
        graphs.insert(graph.id, Arc::new(graph));
        Ok(())
    }

    fn remove(&self, id: i64) -> Result<()> {
        self.graphs
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::GraphNotFound { id })
    }
}

fn dims_match(declared: &[i64], dims: &[usize]) -> bool {
    declared.len() == dims.len()
        && declared
            .iter()
            .zip(dims)
            .all(|(&d, &x)| d < 0 || d as usize == x)
}

impl Engine {
    /// Decode `bytes` as a JSON flat graph and register it under `id`.
    pub fn register_graph(&self, id: i64, bytes: &[u8]) -> Result<()> {
        self.register_graph_with(id, bytes, &JsonGraphDecoder)
    }

    /// Register with an explicit wire decoder.
    #[tracing::instrument(level = "debug", skip(self, bytes, decoder), fields(bytes = bytes.len()))]
    pub fn register_graph_with(
        &self,
        id: i64,
        bytes: &[u8],
        decoder: &dyn GraphDecoder,
    ) -> Result<()> {
        let result = decoder
            .decode(bytes)
            .and_then(|flat| self.register_flat_graph(id, flat));
        self.last_error().track(result)
    }

    /// Register an already-decoded graph.
    pub fn register_flat_graph(&self, id: i64, flat: FlatGraph) -> Result<()> {
        let result = RegisteredGraph::compile(id, flat).and_then(|g| {
            tracing::debug!(
                graph = id,
                nodes = g.order.len(),
                variables = g.variables.len(),
                "registered graph"
            );
            self.graphs.insert(g)
        });
        self.last_error().track(result)
    }

    pub fn unregister_graph(&self, id: i64) -> Result<()> {
        let result = self.graphs.remove(id);
        if result.is_ok() {
            tracing::debug!(graph = id, "unregistered graph");
        }
        self.last_error().track(result)
    }

    pub fn has_graph(&self, id: i64) -> bool {
        self.graphs.get(id).is_ok()
    }

    pub fn graph_ids(&self) -> Vec<i64> {
        self.graphs.ids()
    }

    pub fn registered_graph(&self, id: i64) -> Result<Arc<RegisteredGraph>> {
        self.last_error().track(self.graphs.get(id))
    }

    /// Run graph `id`. `inputs[i]` feeds the placeholder whose variable id is
    /// `input_indices[i]`; every placeholder must be fed exactly once.
    ///
    /// A failing node does not make this return `Err`: the returned set
    /// carries the failure status and the outputs produced before it.
    #[tracing::instrument(level = "debug", skip(self, inputs, input_indices))]
    pub fn execute_stored_graph(
        &self,
        id: i64,
        inputs: &[Operand],
        input_indices: &[i64],
    ) -> Result<VariableSet> {
        let result = self.graphs.get(id).and_then(|graph| {
            if inputs.len() != input_indices.len() {
                return Err(Error::execution(format!(
                    "{} inputs given with {} input indices",
                    inputs.len(),
                    input_indices.len()
                )));
            }
            let fed: HashMap<i64, Operand> = input_indices
                .iter()
                .copied()
                .zip(inputs.iter().cloned())
                .collect();
            if fed.len() != input_indices.len() {
                return Err(Error::execution("a placeholder was fed more than once"));
            }
            self.run_graph(&graph, fed)
        });
        self.last_error().track(result)
    }

    /// Like [`Engine::execute_stored_graph`], feeding placeholders by name.
    pub fn execute_stored_graph_named(
        &self,
        id: i64,
        inputs: &[(&str, Operand)],
    ) -> Result<VariableSet> {
        let result = self.graphs.get(id).and_then(|graph| {
            let mut fed = HashMap::with_capacity(inputs.len());
            for (name, operand) in inputs {
                let decl = graph
                    .variables
                    .iter()
                    .find(|v| v.kind == VariableKind::Placeholder && v.name == *name)
                    .ok_or_else(|| {
                        Error::execution(format!("graph {id} has no placeholder named {name}"))
                    })?;
                if fed.insert(decl.id, operand.clone()).is_some() {
                    return Err(Error::execution(format!("placeholder {name} fed twice")));
                }
            }
            self.run_graph(&graph, fed)
        });
        self.last_error().track(result)
    }

    /// Check the feed, then run. Outer `Err` is a bad request; a node
    /// failure comes back as a set with non-zero status.
    pub(crate) fn run_graph(
        &self,
        graph: &RegisteredGraph,
        mut fed: HashMap<i64, Operand>,
    ) -> Result<VariableSet> {
        let mut values: HashMap<VarRef, (String, Operand)> = HashMap::new();
        for decl in &graph.variables {
            let operand = match decl.kind {
                VariableKind::Placeholder => {
                    let operand = fed.remove(&decl.id).ok_or_else(|| {
                        Error::execution(format!(
                            "graph {}: placeholder {} was not fed",
                            graph.id, decl.name
                        ))
                    })?;
                    if let Some(dtype) = decl.dtype {
                        if operand.dtype() != dtype {
                            return Err(Error::execution(format!(
                                "placeholder {} expects {dtype}, got {}",
                                decl.name,
                                operand.dtype()
                            )));
                        }
                    }
                    if let Some(shape) = &decl.shape {
                        if !dims_match(shape, operand.dims()) {
                            return Err(Error::ShapeMismatch {
                                expected: shape.iter().map(|&d| d.max(0) as usize).collect(),
                                got: operand.dims().to_vec(),
                            });
                        }
                    }
                    operand
                }
                VariableKind::Variable => match fed.remove(&decl.id) {
                    Some(operand) => operand,
                    None => self.materialize(decl)?,
                },
                VariableKind::Constant => self.materialize(decl)?,
            };
            values.insert(VarRef(decl.id, 0), (decl.name.clone(), operand));
        }
        if let Some(extra) = fed.keys().next() {
            return Err(Error::execution(format!(
                "graph {}: id {extra} is not a placeholder or variable",
                graph.id
            )));
        }

        let mut produced: Vec<VarRef> = Vec::with_capacity(graph.order.len());
        for node in &graph.order {
            match self.run_node(node, &values) {
                Ok(out) => {
                    values.insert(VarRef(node.id, 0), (node.name.clone(), out));
                    produced.push(VarRef(node.id, 0));
                }
                Err(e) => {
                    tracing::warn!(
                        graph = graph.id,
                        node = %node.name,
                        error = %e,
                        "graph node failed; remaining nodes skipped"
                    );
                    return Ok(VariableSet {
                        status: e.code(),
                        message: e.to_string(),
                        variables: collect(&produced, &values),
                    });
                }
            }
        }
        Ok(VariableSet {
            status: 0,
            message: String::new(),
            variables: collect(&graph.outputs, &values),
        })
    }

    fn materialize(&self, decl: &GraphVariableDecl) -> Result<Operand> {
        let dtype = decl.dtype.unwrap_or(DType::F32);
        let dims: Vec<usize> = decl
            .shape
            .iter()
            .flatten()
            .map(|&d| d.max(0) as usize)
            .collect();
        let operand = self.allocate_operand(&dims, dtype)?;
        operand.buffer.write_primary(|bytes| {
            for (i, &v) in decl.values.iter().enumerate() {
                dtype.store(bytes, i, v);
            }
        })?;
        Ok(operand)
    }

    fn run_node(
        &self,
        node: &CompiledNode,
        values: &HashMap<VarRef, (String, Operand)>,
    ) -> Result<Operand> {
        let mut ctx = ExecutionContext::for_node(node.id);
        ctx.allow_helpers(self.config().helpers_allowed);
        for (i, r) in node.inputs.iter().enumerate() {
            let (_, operand) = values.get(r).ok_or_else(|| {
                Error::execution(format!(
                    "node {} input [{}, {}] has no value",
                    node.name,
                    r.id(),
                    r.index()
                ))
            })?;
            ctx.set_input(i, operand.clone());
        }
        ctx.set_t_args(node.t_args.clone());
        ctx.set_i_args(node.i_args.clone());
        ctx.set_b_args(node.b_args.clone());
        ctx.set_d_args(node.d_args.clone());
        ctx.set_dimensions(node.dimensions.clone());
        if let Op::Random(_) = node.op {
            ctx.bind_random(RandomGenerator::new(self.config().graph_seed, node.id));
        }
        self.execute(&mut ctx, node.op)?;
        ctx.output(0)
            .cloned()
            .ok_or_else(|| Error::execution(format!("node {} produced no output", node.name)))
    }
}

fn collect(refs: &[VarRef], values: &HashMap<VarRef, (String, Operand)>) -> Vec<GraphValue> {
    refs.iter()
        .filter_map(|r| {
            values.get(r).map(|(name, operand)| GraphValue {
                id: r.id(),
                index: r.index(),
                name: name.clone(),
                operand: operand.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::flat::FlatNode;

    fn node(id: i64, name: &str, inputs: &[i64], control: &[i64]) -> FlatNode {
        FlatNode {
            id,
            name: name.into(),
            family: "transform".into(),
            op: 17,
            inputs: inputs.iter().map(|&i| VarRef(i, 0)).collect(),
            t_args: vec![],
            i_args: vec![],
            b_args: vec![],
            d_args: vec![],
            dimensions: vec![],
            control_deps: control.to_vec(),
        }
    }

    fn placeholder(id: i64) -> FlatVariable {
        FlatVariable {
            id,
            name: format!("p{id}"),
            kind: VariableKind::Placeholder,
            dtype: None,
            shape: None,
            values: vec![],
            control_deps: vec![],
        }
    }

    #[test]
    fn test_order_follows_data_and_control_edges() {
        let flat = FlatGraph {
            variables: vec![placeholder(1)],
            nodes: vec![
                node(4, "c", &[3], &[]),
                node(3, "b", &[1], &[5]),
                node(5, "a", &[1], &[]),
            ],
            outputs: vec![],
        };
        let g = RegisteredGraph::compile(7, flat).unwrap();
        assert_eq!(g.execution_order(), vec!["a", "b", "c"]);
        assert_eq!(g.outputs().len(), 3);
    }

    #[test]
    fn test_cycle_rejected() {
        let flat = FlatGraph {
            variables: vec![placeholder(1)],
            nodes: vec![node(2, "a", &[3], &[]), node(3, "b", &[2], &[])],
            outputs: vec![],
        };
        let err = RegisteredGraph::compile(1, flat).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_reference_and_duplicate_ids() {
        let flat = FlatGraph {
            variables: vec![placeholder(1)],
            nodes: vec![node(2, "a", &[9], &[])],
            outputs: vec![],
        };
        assert!(RegisteredGraph::compile(1, flat).is_err());

        let flat = FlatGraph {
            variables: vec![placeholder(1)],
            nodes: vec![node(1, "a", &[], &[])],
            outputs: vec![],
        };
        assert!(RegisteredGraph::compile(1, flat).is_err());
    }

    #[test]
    fn test_unknown_op_code() {
        let mut bad = node(2, "a", &[1], &[]);
        bad.op = 500;
        let flat = FlatGraph {
            variables: vec![placeholder(1)],
            nodes: vec![bad],
            outputs: vec![],
        };
        assert!(matches!(
            RegisteredGraph::compile(1, flat),
            Err(Error::UnknownOp { code: 500, .. })
        ));
    }

    #[test]
    fn test_dims_match_wildcards() {
        assert!(dims_match(&[-1, 3], &[7, 3]));
        assert!(!dims_match(&[2, 3], &[3, 3]));
        assert!(!dims_match(&[3], &[3, 1]));
    }
}
