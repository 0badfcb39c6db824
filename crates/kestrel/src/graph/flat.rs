// Flat graph wire model
//
// The serialized form a graph producer hands to `register_graph`. The
// engine only decodes it; ops are named by (family, code) exactly as the
// per-family entry points name them, variables and nodes share one id space,
// and a node's output is addressed as `[node_id, output_index]`.
//
//   {
//     "variables": [{"id": 1, "name": "x", "kind": "placeholder", "dtype": "f32"}],
//     "nodes": [{"id": 2, "name": "y", "family": "scalar", "op": 0,
//                "inputs": [[1, 0]], "t_args": [1.0]}],
//     "outputs": [[2, 0]]
//   }
//
// Decoding goes through the `GraphDecoder` trait so another wire format can
// be plugged in without touching the runtime.

use serde::{Deserialize, Serialize};

use kestrel_core::{Error, Result};

/// Reference to output `.1` of the variable or node with id `.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarRef(pub i64, pub usize);

impl VarRef {
    pub fn id(&self) -> i64 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// Supplied by the caller on every run.
    Placeholder,
    /// Values embedded in the graph.
    Constant,
    /// Values embedded in the graph; a scoped run may overwrite them through
    /// its graph state.
    Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatVariable {
    pub id: i64,
    pub name: String,
    pub kind: VariableKind,
    /// Dtype name as accepted by `DType::from_str`. Required for constants.
    #[serde(default)]
    pub dtype: Option<String>,
    /// Extents; `-1` accepts any extent for a placeholder. Required for
    /// constants.
    #[serde(default)]
    pub shape: Option<Vec<i64>>,
    /// Row-major contents of a constant.
    #[serde(default)]
    pub values: Vec<f64>,
    /// Ids that must be ready before this variable is. Every node reading
    /// the variable runs after the nodes named here, directly or through
    /// other variables.
    #[serde(default)]
    pub control_deps: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatNode {
    pub id: i64,
    pub name: String,
    /// Op family name, e.g. `pairwise`.
    pub family: String,
    /// Op code within the family.
    pub op: i32,
    #[serde(default)]
    pub inputs: Vec<VarRef>,
    #[serde(default)]
    pub t_args: Vec<f64>,
    #[serde(default)]
    pub i_args: Vec<i64>,
    #[serde(default)]
    pub b_args: Vec<bool>,
    #[serde(default)]
    pub d_args: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<i64>,
    /// Nodes that must run before this one without feeding it data.
    #[serde(default)]
    pub control_deps: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatGraph {
    #[serde(default)]
    pub variables: Vec<FlatVariable>,
    #[serde(default)]
    pub nodes: Vec<FlatNode>,
    /// Results reported by a run. Empty means every node output.
    #[serde(default)]
    pub outputs: Vec<VarRef>,
}

impl FlatGraph {
    /// JSON bytes accepted by [`JsonGraphDecoder`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::msg(format!("cannot encode graph: {e}")))
    }
}

/// Turns serialized graph bytes into the flat model.
pub trait GraphDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<FlatGraph>;
}

/// Decoder for the JSON rendition of [`FlatGraph`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonGraphDecoder;

impl GraphDecoder for JsonGraphDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<FlatGraph> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::execution(format!("malformed graph bytes: {e}")))
    }
}
