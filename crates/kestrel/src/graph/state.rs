// GraphState — caller-owned state for scoped graph execution
//
// Scoped execution strings registered graphs together with control flow:
//
//   Sequence    run steps in order
//   Conditional run a condition graph; its first output picks a branch
//   While       re-run the condition graph before every pass of the body
//
// Graphs inside a scope talk to each other only through the state's named
// variables: placeholders and `variable`-kind slots are fed by name from the
// state, and every value a graph reports is written back under its name.
//
// A state is mutated by each call and must not be shared between concurrent
// calls; `execute_scope` takes it by `&mut`.

use std::collections::HashMap;

use kestrel_core::{Error, Result};

use crate::engine::Engine;
use crate::exec::context::Operand;
use crate::graph::flat::VariableKind;
use crate::graph::runtime::VariableSet;

/// Scopes may name other scopes; this bounds the nesting.
const MAX_SCOPE_DEPTH: usize = 64;

/// One step of a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run a registered graph against the state.
    Graph(i64),
    /// Enter another scope defined on the same state.
    Scope(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Sequence(Vec<Step>),
    Conditional {
        /// Graph whose first output decides: non-zero runs `then_branch`.
        condition: i64,
        then_branch: Vec<Step>,
        else_branch: Vec<Step>,
    },
    While {
        condition: i64,
        body: Vec<Step>,
    },
}

/// Named variables and scope definitions carried across calls.
#[derive(Debug, Default)]
pub struct GraphState {
    variables: HashMap<String, Operand>,
    scopes: HashMap<i64, Scope>,
    iterations: u64,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_variable(&mut self, name: impl Into<String>, operand: Operand) {
        self.variables.insert(name.into(), operand);
    }

    pub fn variable(&self, name: &str) -> Option<&Operand> {
        self.variables.get(name)
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Operand> {
        self.variables.remove(name)
    }

    pub fn variable_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.variables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn define_scope(&mut self, id: i64, scope: Scope) {
        self.scopes.insert(id, scope);
    }

    pub fn scope(&self, id: i64) -> Option<&Scope> {
        self.scopes.get(&id)
    }

    /// Loop passes run by `While` scopes over this state's lifetime.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}

impl Engine {
    pub fn create_graph_state(&self) -> GraphState {
        GraphState::new()
    }

    /// Drop the state. Buffers it held are freed once no operand refers to
    /// them any more.
    pub fn destroy_graph_state(&self, state: GraphState) -> Result<()> {
        tracing::debug!(variables = state.variables.len(), "destroying graph state");
        drop(state);
        Ok(())
    }

    /// Run scope `scope_id` of `state`.
    #[tracing::instrument(level = "debug", skip(self, state))]
    pub fn execute_scope(&self, state: &mut GraphState, scope_id: i64) -> Result<()> {
        let result = self.run_scope(state, scope_id, 0);
        self.last_error().track(result)
    }

    fn run_scope(&self, state: &mut GraphState, scope_id: i64, depth: usize) -> Result<()> {
        if depth >= MAX_SCOPE_DEPTH {
            return Err(Error::execution(format!(
                "scope {scope_id} nested deeper than {MAX_SCOPE_DEPTH}"
            )));
        }
        let scope = state
            .scope(scope_id)
            .cloned()
            .ok_or_else(|| Error::execution(format!("scope {scope_id} is not defined")))?;
        match scope {
            Scope::Sequence(steps) => self.run_steps(state, &steps, depth),
            Scope::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.evaluate_condition(state, condition)? {
                    self.run_steps(state, &then_branch, depth)
                } else {
                    self.run_steps(state, &else_branch, depth)
                }
            }
            Scope::While { condition, body } => {
                let limit = self.config().max_loop_iterations;
                let mut passes = 0usize;
                while self.evaluate_condition(state, condition)? {
                    if passes == limit {
                        return Err(Error::execution(format!(
                            "scope {scope_id} exceeded {limit} loop iterations"
                        )));
                    }
                    self.run_steps(state, &body, depth)?;
                    passes += 1;
                    state.iterations += 1;
                }
                tracing::debug!(scope = scope_id, passes, "loop finished");
                Ok(())
            }
        }
    }

    fn run_steps(&self, state: &mut GraphState, steps: &[Step], depth: usize) -> Result<()> {
        for step in steps {
            match *step {
                Step::Graph(id) => {
                    self.run_in_state(state, id)?;
                }
                Step::Scope(id) => self.run_scope(state, id, depth + 1)?,
            }
        }
        Ok(())
    }

    fn evaluate_condition(&self, state: &mut GraphState, graph: i64) -> Result<bool> {
        let set = self.run_in_state(state, graph)?;
        let first = set
            .at(0)
            .ok_or_else(|| Error::execution(format!("condition graph {graph} has no output")))?;
        let values = first.operand.to_f64_vec()?;
        Ok(values.first().is_some_and(|&v| v != 0.0))
    }

    /// Run graph `id` fed from `state`, then write its outputs back.
    fn run_in_state(&self, state: &mut GraphState, id: i64) -> Result<VariableSet> {
        let graph = self.graphs.get(id)?;
        let mut fed = HashMap::new();
        for decl in &graph.variables {
            let from_state = state.variables.get(&decl.name);
            match (decl.kind, from_state) {
                (VariableKind::Placeholder | VariableKind::Variable, Some(operand)) => {
                    fed.insert(decl.id, operand.clone());
                }
                (VariableKind::Placeholder, None) => {
                    return Err(Error::execution(format!(
                        "graph {id} needs state variable {}",
                        decl.name
                    )));
                }
                _ => {}
            }
        }
        let set = self.run_graph(&graph, fed)?;
        if !set.is_ok() {
            return Err(Error::execution(format!(
                "graph {id} failed inside scope: {}",
                set.message()
            )));
        }
        for v in set.iter() {
            state.variables.insert(v.name.clone(), v.operand.clone());
        }
        Ok(set)
    }
}
