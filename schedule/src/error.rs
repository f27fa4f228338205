use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Recoverable search errors. Internal invariant violations (running out of
/// legal states, decision counter mismatches, jacobian dimension mismatches)
/// indicate bugs and panic instead of appearing here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The cost model failed to evaluate a batch. The search has no recovery
    /// policy beyond aborting.
    #[snafu(display("cost model failed to evaluate enqueued states: {message}"))]
    CostModel { message: String },
}
