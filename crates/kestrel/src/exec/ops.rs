// Op catalogue — families, codes and scalar math
//
// An op is a (family, code) pair. The family fixes the calling contract
// (arity, TAD requirement, shape rule); the code picks the arithmetic within
// the family. Codes are stable integers so graphs and flat callers can name
// ops without knowing Rust types.
//
// Binary arithmetic is shared by every family that combines two values:
// Pairwise, Scalar, ScalarAlongDimension and Broadcast differ only in where
// the second operand comes from.

use std::fmt;

use kestrel_core::{Error, Result};

/// Op family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpFamily {
    Transform,
    Pairwise,
    Scalar,
    ScalarAlongDimension,
    Broadcast,
    Reduce,
    IndexReduce,
    Reduce3,
    SummaryStats,
    Random,
}

impl OpFamily {
    pub const ALL: [OpFamily; 10] = [
        OpFamily::Transform,
        OpFamily::Pairwise,
        OpFamily::Scalar,
        OpFamily::ScalarAlongDimension,
        OpFamily::Broadcast,
        OpFamily::Reduce,
        OpFamily::IndexReduce,
        OpFamily::Reduce3,
        OpFamily::SummaryStats,
        OpFamily::Random,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OpFamily::Transform => "transform",
            OpFamily::Pairwise => "pairwise",
            OpFamily::Scalar => "scalar",
            OpFamily::ScalarAlongDimension => "scalar_along_dimension",
            OpFamily::Broadcast => "broadcast",
            OpFamily::Reduce => "reduce",
            OpFamily::IndexReduce => "index_reduce",
            OpFamily::Reduce3 => "reduce3",
            OpFamily::SummaryStats => "summary_stats",
            OpFamily::Random => "random",
        }
    }

    pub fn from_name(s: &str) -> Option<OpFamily> {
        OpFamily::ALL.iter().copied().find(|f| f.name() == s)
    }
}

impl fmt::Display for OpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declares a code-addressed op enum with its stable names.
macro_rules! op_codes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal => $label:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            pub fn code(&self) -> i32 {
                match self {
                    $($name::$variant => $code),*
                }
            }

            pub fn from_code(code: i32) -> Option<$name> {
                match code {
                    $($code => Some($name::$variant),)*
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),*
                }
            }
        }
    };
}

op_codes! {
    /// Unary elementwise maths.
    TransformOp {
        Abs = 0 => "abs",
        Neg = 1 => "neg",
        Exp = 2 => "exp",
        Log = 3 => "log",
        Sqrt = 4 => "sqrt",
        Square = 5 => "square",
        Sigmoid = 6 => "sigmoid",
        Tanh = 7 => "tanh",
        Relu = 8 => "relu",
        Sign = 9 => "sign",
        Floor = 10 => "floor",
        Ceil = 11 => "ceil",
        Round = 12 => "round",
        Reciprocal = 13 => "reciprocal",
        Sin = 14 => "sin",
        Cos = 15 => "cos",
        OneMinus = 16 => "one_minus",
        Identity = 17 => "identity",
    }
}

op_codes! {
    /// Two-operand maths, shared by the pairwise, scalar and broadcast families.
    BinaryOp {
        Add = 0 => "add",
        Sub = 1 => "sub",
        Mul = 2 => "mul",
        Div = 3 => "div",
        Max = 4 => "max",
        Min = 5 => "min",
        Pow = 6 => "pow",
        ReverseSub = 7 => "rsub",
        ReverseDiv = 8 => "rdiv",
        Copy = 9 => "copy",
        SquaredDifference = 10 => "squared_difference",
        Equals = 11 => "equals",
        GreaterThan = 12 => "greater_than",
        LessThan = 13 => "less_than",
    }
}

op_codes! {
    /// Reductions of a tile to one value.
    ReduceOp {
        Sum = 0 => "sum",
        Mean = 1 => "mean",
        Max = 2 => "max",
        Min = 3 => "min",
        Prod = 4 => "prod",
        Norm1 = 5 => "norm1",
        Norm2 = 6 => "norm2",
        NormMax = 7 => "norm_max",
        SquaredNorm = 8 => "squared_norm",
        CountNonZero = 9 => "count_nonzero",
        Any = 10 => "any",
        All = 11 => "all",
    }
}

op_codes! {
    /// Reductions of a tile to the logical index of one of its elements.
    IndexReduceOp {
        IndexMax = 0 => "index_max",
        IndexMin = 1 => "index_min",
        IndexAbsMax = 2 => "index_abs_max",
        IndexAbsMin = 3 => "index_abs_min",
    }
}

op_codes! {
    /// Reductions over a pair of tiles.
    Reduce3Op {
        Dot = 0 => "dot",
        EuclideanDistance = 1 => "euclidean",
        ManhattanDistance = 2 => "manhattan",
        CosineSimilarity = 3 => "cosine_similarity",
        CosineDistance = 4 => "cosine_distance",
    }
}

op_codes! {
    /// Moment statistics; `b_args[0]` selects the bias-corrected estimator.
    SummaryStatsOp {
        Variance = 0 => "variance",
        StandardDeviation = 1 => "std",
    }
}

op_codes! {
    /// Random fills driven by the context's generator.
    RandomOp {
        Uniform = 0 => "uniform",
        Gaussian = 1 => "gaussian",
        Bernoulli = 2 => "bernoulli",
    }
}

impl TransformOp {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            TransformOp::Abs => x.abs(),
            TransformOp::Neg => -x,
            TransformOp::Exp => x.exp(),
            TransformOp::Log => x.ln(),
            TransformOp::Sqrt => x.sqrt(),
            TransformOp::Square => x * x,
            TransformOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            TransformOp::Tanh => x.tanh(),
            TransformOp::Relu => x.max(0.0),
            TransformOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            TransformOp::Floor => x.floor(),
            TransformOp::Ceil => x.ceil(),
            TransformOp::Round => x.round(),
            TransformOp::Reciprocal => 1.0 / x,
            TransformOp::Sin => x.sin(),
            TransformOp::Cos => x.cos(),
            TransformOp::OneMinus => 1.0 - x,
            TransformOp::Identity => x,
        }
    }
}

impl BinaryOp {
    pub fn apply(&self, a: f64, b: f64) -> f64 {
        let flag = |c: bool| if c { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Pow => a.powf(b),
            BinaryOp::ReverseSub => b - a,
            BinaryOp::ReverseDiv => b / a,
            BinaryOp::Copy => b,
            BinaryOp::SquaredDifference => (a - b) * (a - b),
            BinaryOp::Equals => flag(a == b),
            BinaryOp::GreaterThan => flag(a > b),
            BinaryOp::LessThan => flag(a < b),
        }
    }
}

impl ReduceOp {
    pub fn reduce(&self, values: impl Iterator<Item = f64>) -> f64 {
        match self {
            ReduceOp::Sum => values.sum(),
            ReduceOp::Mean => {
                let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                if n == 0 {
                    f64::NAN
                } else {
                    sum / n as f64
                }
            }
            ReduceOp::Max => values.fold(f64::NEG_INFINITY, f64::max),
            ReduceOp::Min => values.fold(f64::INFINITY, f64::min),
            ReduceOp::Prod => values.product(),
            ReduceOp::Norm1 => values.map(f64::abs).sum(),
            ReduceOp::Norm2 => values.map(|v| v * v).sum::<f64>().sqrt(),
            ReduceOp::NormMax => values.map(f64::abs).fold(0.0, f64::max),
            ReduceOp::SquaredNorm => values.map(|v| v * v).sum(),
            ReduceOp::CountNonZero => values.filter(|v| *v != 0.0).count() as f64,
            ReduceOp::Any => {
                let mut values = values;
                if values.any(|v| v != 0.0) {
                    1.0
                } else {
                    0.0
                }
            }
            ReduceOp::All => {
                let mut values = values;
                if values.all(|v| v != 0.0) {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl IndexReduceOp {
    /// Position of the winning element; the first one wins ties. -1 for an
    /// empty tile.
    pub fn reduce(&self, values: impl Iterator<Item = f64>) -> f64 {
        let key: fn(f64) -> f64 = match self {
            IndexReduceOp::IndexMax | IndexReduceOp::IndexMin => |v| v,
            IndexReduceOp::IndexAbsMax | IndexReduceOp::IndexAbsMin => f64::abs,
        };
        let better: fn(f64, f64) -> bool = match self {
            IndexReduceOp::IndexMax | IndexReduceOp::IndexAbsMax => |new, best| new > best,
            IndexReduceOp::IndexMin | IndexReduceOp::IndexAbsMin => |new, best| new < best,
        };
        let mut best: Option<(usize, f64)> = None;
        for (i, v) in values.enumerate() {
            let k = key(v);
            match best {
                Some((_, b)) if !better(k, b) => {}
                _ => best = Some((i, k)),
            }
        }
        best.map(|(i, _)| i as f64).unwrap_or(-1.0)
    }
}

impl Reduce3Op {
    pub fn reduce(&self, pairs: impl Iterator<Item = (f64, f64)>) -> f64 {
        match self {
            Reduce3Op::Dot => pairs.map(|(a, b)| a * b).sum(),
            Reduce3Op::EuclideanDistance => {
                pairs.map(|(a, b)| (a - b) * (a - b)).sum::<f64>().sqrt()
            }
            Reduce3Op::ManhattanDistance => pairs.map(|(a, b)| (a - b).abs()).sum(),
            Reduce3Op::CosineSimilarity | Reduce3Op::CosineDistance => {
                let (dot, na, nb) = pairs.fold((0.0, 0.0, 0.0), |(d, na, nb), (a, b)| {
                    (d + a * b, na + a * a, nb + b * b)
                });
                let sim = dot / (na.sqrt() * nb.sqrt());
                if *self == Reduce3Op::CosineSimilarity {
                    sim
                } else {
                    1.0 - sim
                }
            }
        }
    }
}

impl SummaryStatsOp {
    pub fn reduce(&self, values: &[f64], bias_corrected: bool) -> f64 {
        let n = values.len();
        if n == 0 {
            return f64::NAN;
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
        let denom = if bias_corrected && n > 1 {
            (n - 1) as f64
        } else {
            n as f64
        };
        let var = ss / denom;
        match self {
            SummaryStatsOp::Variance => var,
            SummaryStatsOp::StandardDeviation => var.sqrt(),
        }
    }
}

/// A fully identified op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Transform(TransformOp),
    Pairwise(BinaryOp),
    Scalar(BinaryOp),
    ScalarAlongDimension(BinaryOp),
    Broadcast(BinaryOp),
    Reduce(ReduceOp),
    IndexReduce(IndexReduceOp),
    Reduce3(Reduce3Op),
    SummaryStats(SummaryStatsOp),
    Random(RandomOp),
}

impl Op {
    /// Resolve a (family, code) pair.
    pub fn from_code(family: OpFamily, code: i32) -> Result<Op> {
        let op = match family {
            OpFamily::Transform => TransformOp::from_code(code).map(Op::Transform),
            OpFamily::Pairwise => BinaryOp::from_code(code).map(Op::Pairwise),
            OpFamily::Scalar => BinaryOp::from_code(code).map(Op::Scalar),
            OpFamily::ScalarAlongDimension => {
                BinaryOp::from_code(code).map(Op::ScalarAlongDimension)
            }
            OpFamily::Broadcast => BinaryOp::from_code(code).map(Op::Broadcast),
            OpFamily::Reduce => ReduceOp::from_code(code).map(Op::Reduce),
            OpFamily::IndexReduce => IndexReduceOp::from_code(code).map(Op::IndexReduce),
            OpFamily::Reduce3 => Reduce3Op::from_code(code).map(Op::Reduce3),
            OpFamily::SummaryStats => SummaryStatsOp::from_code(code).map(Op::SummaryStats),
            OpFamily::Random => RandomOp::from_code(code).map(Op::Random),
        };
        op.ok_or_else(|| Error::UnknownOp {
            family: family.name().to_string(),
            code,
        })
    }

    pub fn family(&self) -> OpFamily {
        match self {
            Op::Transform(_) => OpFamily::Transform,
            Op::Pairwise(_) => OpFamily::Pairwise,
            Op::Scalar(_) => OpFamily::Scalar,
            Op::ScalarAlongDimension(_) => OpFamily::ScalarAlongDimension,
            Op::Broadcast(_) => OpFamily::Broadcast,
            Op::Reduce(_) => OpFamily::Reduce,
            Op::IndexReduce(_) => OpFamily::IndexReduce,
            Op::Reduce3(_) => OpFamily::Reduce3,
            Op::SummaryStats(_) => OpFamily::SummaryStats,
            Op::Random(_) => OpFamily::Random,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Op::Transform(o) => o.code(),
            Op::Pairwise(o) | Op::Scalar(o) | Op::ScalarAlongDimension(o) | Op::Broadcast(o) => {
                o.code()
            }
            Op::Reduce(o) => o.code(),
            Op::IndexReduce(o) => o.code(),
            Op::Reduce3(o) => o.code(),
            Op::SummaryStats(o) => o.code(),
            Op::Random(o) => o.code(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Transform(o) => o.name(),
            Op::Pairwise(o) | Op::Scalar(o) | Op::ScalarAlongDimension(o) | Op::Broadcast(o) => {
                o.name()
            }
            Op::Reduce(o) => o.name(),
            Op::IndexReduce(o) => o.name(),
            Op::Reduce3(o) => o.name(),
            Op::SummaryStats(o) => o.name(),
            Op::Random(o) => o.name(),
        }
    }

    /// Every op the engine knows, family by family.
    pub fn all() -> Vec<Op> {
        let mut out: Vec<Op> = Vec::new();
        out.extend(TransformOp::ALL.iter().map(|&o| Op::Transform(o)));
        out.extend(BinaryOp::ALL.iter().map(|&o| Op::Pairwise(o)));
        out.extend(BinaryOp::ALL.iter().map(|&o| Op::Scalar(o)));
        out.extend(BinaryOp::ALL.iter().map(|&o| Op::ScalarAlongDimension(o)));
        out.extend(BinaryOp::ALL.iter().map(|&o| Op::Broadcast(o)));
        out.extend(ReduceOp::ALL.iter().map(|&o| Op::Reduce(o)));
        out.extend(IndexReduceOp::ALL.iter().map(|&o| Op::IndexReduce(o)));
        out.extend(Reduce3Op::ALL.iter().map(|&o| Op::Reduce3(o)));
        out.extend(SummaryStatsOp::ALL.iter().map(|&o| Op::SummaryStats(o)));
        out.extend(RandomOp::ALL.iter().map(|&o| Op::Random(o)));
        out
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.family(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip_every_family() {
        for op in Op::all() {
            assert_eq!(Op::from_code(op.family(), op.code()).unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_code() {
        let err = Op::from_code(OpFamily::Reduce, 999).unwrap_err();
        assert!(matches!(err, Error::UnknownOp { code: 999, .. }));
    }

    #[test]
    fn test_family_names() {
        for f in OpFamily::ALL {
            assert_eq!(OpFamily::from_name(f.name()), Some(f));
        }
    }

    #[test]
    fn test_index_reduce_ties_and_empty() {
        let v = [1.0, 5.0, 5.0, -7.0];
        assert_eq!(IndexReduceOp::IndexMax.reduce(v.iter().copied()), 1.0);
        assert_eq!(IndexReduceOp::IndexAbsMax.reduce(v.iter().copied()), 3.0);
        assert_eq!(IndexReduceOp::IndexMin.reduce(v.iter().copied()), 3.0);
        assert_eq!(IndexReduceOp::IndexMin.reduce(std::iter::empty()), -1.0);
    }

    #[test]
    fn test_summary_stats_bias() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(SummaryStatsOp::Variance.reduce(&v, false), 1.25);
        assert!((SummaryStatsOp::Variance.reduce(&v, true) - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_reduce3() {
        let pairs = || [(1.0, 4.0), (2.0, 6.0)].into_iter();
        assert_eq!(Reduce3Op::Dot.reduce(pairs()), 16.0);
        assert_eq!(Reduce3Op::ManhattanDistance.reduce(pairs()), 7.0);
        assert_eq!(Reduce3Op::EuclideanDistance.reduce(pairs()), 5.0);
    }
}
