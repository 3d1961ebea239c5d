//! Typed failures of the simulation core.

use thiserror::Error;

/// Failure raised by trajectory simulation or tree reconstruction.
///
/// Rejections (acceptance condition unmet, infeasible punctual events,
/// exhausted leap retries) are handled by the retry driver and only surface
/// here as [`SimulationError::RetriesExhausted`]. The tree-stage variants are
/// never retried. The internal-consistency variants indicate a logic or model
/// defect rather than sampling variance.
#[derive(Debug, Error, PartialEq)]
pub enum SimulationError {
    #[error("failed to simulate trajectory satisfying acceptance condition (max_retries = {max_retries})")]
    RetriesExhausted { max_retries: usize },

    #[error("refusing to simulate tree from trajectory failing acceptance condition")]
    InvalidTrajectory,

    #[error("trajectory contains no samples")]
    NoSamples,

    #[error("no lineages remaining")]
    NoLineages,

    #[error("multiple lineages remaining ({count})")]
    MultipleLineages { count: usize },

    #[error("reaction selection loop fell through")]
    SelectionFellThrough,

    #[error("reaction box index {0} not found")]
    UnknownReactionBox(usize),

    #[error("event storage exhausted after {0} events")]
    EventStorageExhausted(usize),
}

impl SimulationError {
    /// Whether this error reflects a logic or configuration defect.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::SelectionFellThrough | Self::UnknownReactionBox(_) | Self::EventStorageExhausted(_)
        )
    }
}
