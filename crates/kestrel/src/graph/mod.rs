// Stored graphs: wire model, registration and execution, scoped state.

pub mod flat;
pub mod runtime;
pub mod state;

pub use flat::{
    FlatGraph, FlatNode, FlatVariable, GraphDecoder, JsonGraphDecoder, VarRef, VariableKind,
};
pub use runtime::{GraphRuntime, GraphValue, RegisteredGraph, VariableSet};
pub use state::{GraphState, Scope, Step};
