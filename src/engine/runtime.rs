/// Evaluation runtime.
///
/// Each request is staged in its own directory under the storage root,
/// then extraction and invocation run on a blocking worker. Concurrent
/// requests are bounded by a semaphore and each one by a timeout. A worker
/// keeps its permit until it has stopped, so a timed-out computation still
/// counts against the limit until its interpreter observes cancellation.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::{Capability, Operation, StateCapability};
use crate::config::Config;
use crate::sandbox::interpreter::{Cancellation, RuntimeError};
use crate::sandbox::{
    extract_safe_computation, ExtractOptions, ExtractionFailure, Output, SourceUnit, UnitArena,
};

use super::dataset::{create_dummy, DataShape, Dataset};

/// Name of the persisted source inside a staging directory.
const SOURCE_FILE: &str = "computation_module.py";
const DATA_FILE: &str = "data.json";

/// Who is to blame for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The submitted computation or its input.
    Client,
    /// The service itself.
    Server,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Extraction(#[from] ExtractionFailure),
    #[error("computation failed: {0}")]
    Computation(#[from] RuntimeError),
    #[error("staging failed: {0}")]
    Staging(#[from] std::io::Error),
    #[error("evaluation worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
    #[error("evaluation runtime is closed")]
    Closed,
}

impl GateError {
    pub fn fault(&self) -> Fault {
        match self {
            GateError::Extraction(_) | GateError::Computation(_) => Fault::Client,
            GateError::Staging(_)
            | GateError::Worker(_)
            | GateError::Timeout(_)
            | GateError::Closed => Fault::Server,
        }
    }
}

/// Data a computation runs on.
#[derive(Debug, Clone)]
pub enum Input {
    Data(Dataset),
    /// Random data of this shape.
    Shape(DataShape),
}

impl Input {
    pub fn into_dataset(self) -> Dataset {
        match self {
            Input::Data(dataset) => dataset,
            Input::Shape(shape) => create_dummy(&shape, &mut rand::thread_rng()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub computation: String,
    pub input: Input,
}

/// Outcome of a successful request.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub result: Output,
    /// Input columns the computation read, in first-access order.
    pub selected_columns: Vec<String>,
    /// `state` operations in call order.
    pub operations: Vec<Operation>,
    pub unit_id: String,
}

/// Cancels the worker of a request that timed out or was abandoned.
struct CancelOnDrop(Cancellation);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub struct ComputationRuntime {
    storage_dir: PathBuf,
    options: ExtractOptions,
    arena: Arc<UnitArena>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl ComputationRuntime {
    pub fn new(config: &Config) -> Self {
        Self {
            storage_dir: config.storage.dir.clone(),
            options: ExtractOptions::from_config(config),
            arena: Arc::new(UnitArena::new()),
            semaphore: Arc::new(Semaphore::new(config.runtime.max_concurrent.max(1))),
            timeout: Duration::from_secs(config.runtime.timeout_secs),
        }
    }

    /// Stages, extracts and invokes one computation.
    pub async fn evaluate(&self, request: EvaluationRequest) -> Result<Evaluation, GateError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;

        let request_id = Uuid::new_v4();
        let staging = self.storage_dir.join(request_id.to_string());
        tokio::fs::create_dir_all(&staging).await?;

        let dataset = request.input.into_dataset();
        info!(
            "Evaluating request {request_id} ({} bytes, columns {})",
            request.computation.len(),
            dataset.shape()
        );
        let data = serde_json::to_vec(&dataset).map_err(std::io::Error::from)?;
        tokio::fs::write(staging.join(DATA_FILE), data).await?;

        let unit = SourceUnit::new(request.computation, staging.join(SOURCE_FILE));
        let cancellation = Cancellation::new();
        let mut options = self.options.clone();
        options.load.cancellation = cancellation.clone();
        let arena = self.arena.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run(&unit, &dataset, &arena, &options)
        });
        let _cancel = CancelOnDrop(cancellation.clone());

        let outcome = match tokio::time::timeout(self.timeout, worker).await {
            Ok(joined) => joined.map_err(GateError::from).and_then(|result| result),
            Err(_) => {
                cancellation.cancel();
                Err(GateError::Timeout(self.timeout))
            }
        };

        match &outcome {
            Ok(evaluation) => {
                info!(
                    "Request {request_id} done: unit {}, {} operations",
                    evaluation.unit_id,
                    evaluation.operations.len()
                );
                remove_staging(&staging).await;
            }
            Err(e) => {
                warn!("Request {request_id} failed ({:?} fault): {e}", e.fault());
                if !self.options.load.retain_failed_sources {
                    remove_staging(&staging).await;
                }
            }
        }
        outcome
    }
}

/// Blocking part of a request.
fn run(
    unit: &SourceUnit,
    dataset: &Dataset,
    arena: &UnitArena,
    options: &ExtractOptions,
) -> Result<Evaluation, GateError> {
    let handle = extract_safe_computation(unit, arena, options)?;
    debug!(
        "Invoking '{}' of unit {} from {} (loaded {})",
        handle.entry_name(),
        handle.unit_id(),
        handle.source_path().display(),
        handle.loaded_at().to_rfc3339()
    );

    let state = Arc::new(StateCapability::new());
    let args = Arc::new(dataset.to_capability());
    let state_capability: Arc<dyn Capability> = state.clone();
    let args_capability: Arc<dyn Capability> = args.clone();
    let result = handle.invoke(state_capability, args_capability);

    arena.release(&handle.unit_id());
    debug!("{} units remain loaded", arena.len());
    Ok(Evaluation {
        result: result?,
        selected_columns: args.selected_columns(),
        operations: state.operations(),
        unit_id: handle.unit_id().to_string(),
    })
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        warn!("Could not remove staging directory {}: {e}", staging.display());
    } else {
        debug!("Removed staging directory {}", staging.display());
    }
}
