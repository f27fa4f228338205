use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while validating a pipeline description during DAG
/// construction. Violated invariants of an already-built DAG are bugs and
/// panic instead.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("pipeline has no output functions"))]
    NoOutputs,

    #[snafu(display("function {func} is called but never given a pure definition"))]
    NoPureDefinition { func: String },

    #[snafu(display("input function {func} cannot have a definition"))]
    InputWithDefinition { func: String },

    #[snafu(display("function {func} already has a pure definition"))]
    DuplicatePureDefinition { func: String },

    #[snafu(display("pipeline contains a cycle through function {func}"))]
    PipelineCycle { func: String },

    #[snafu(display("load of {producer} supplies {got} coordinates, expected {expected}"))]
    LoadArityMismatch { producer: String, expected: usize, got: usize },

    #[snafu(display("coordinate in {func} references variable {var}, but the stage only has {limit}"))]
    CoordinateVarOutOfRange { func: String, var: usize, limit: usize },

    #[snafu(display("dimension {dim} is out of range for {func} ({dims} dimensions)"))]
    DimensionOutOfRange { func: String, dim: usize, dims: usize },

    #[snafu(display("output function {func} needs a bounds estimate on every dimension"))]
    MissingEstimate { func: String },
}
