//! In-process stand-ins for the collaborators around the extractor: input
//! datasets and the evaluation runtime that stages, extracts and invokes
//! submitted computations.

pub mod dataset;
pub mod runtime;

pub use dataset::{DataShape, Dataset};
pub use runtime::{ComputationRuntime, EvaluationRequest, Input};
