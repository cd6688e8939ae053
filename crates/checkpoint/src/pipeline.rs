//! Background saves with at most one in flight
//!
//! [`AsyncSavePipeline::submit`] first resolves the previous save, so a
//! slow storage tier throttles the caller instead of piling up concurrent
//! writes. A failed previous save is reported in the [`SubmitReceipt`] and
//! logged; it does not stop the new save from starting.

use runtime_core::{Error, Generation, Result, StateBlob};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::writer::CheckpointWriter;

/// How a background save ended
#[derive(Debug)]
pub struct SaveOutcome {
    pub generation: Generation,
    pub result: Result<()>,
}

impl SaveOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<()> {
        self.result
    }
}

/// The one save currently running in the background
#[derive(Debug)]
pub struct SaveHandle {
    generation: Generation,
    task: JoinHandle<Result<()>>,
}

impl SaveHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the save to finish
    pub async fn wait(self) -> SaveOutcome {
        let result = match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::SaveFailed {
                generation: self.generation,
                message: format!("save task did not complete: {}", e),
            }),
        };
        SaveOutcome {
            generation: self.generation,
            result,
        }
    }
}

/// Returned by [`AsyncSavePipeline::submit`]
#[derive(Debug)]
pub struct SubmitReceipt {
    /// Generation now saving in the background
    pub generation: Generation,

    /// Outcome of the save that was in flight when this one was submitted
    pub previous: Option<SaveOutcome>,
}

/// Owns the in-flight save handle of one worker
#[derive(Debug)]
pub struct AsyncSavePipeline {
    writer: CheckpointWriter,
    in_flight: Option<SaveHandle>,
}

impl AsyncSavePipeline {
    pub fn new(writer: CheckpointWriter) -> Self {
        Self {
            writer,
            in_flight: None,
        }
    }

    pub fn writer(&self) -> &CheckpointWriter {
        &self.writer
    }

    /// Changes apply to saves submitted afterwards
    pub fn writer_mut(&mut self) -> &mut CheckpointWriter {
        &mut self.writer
    }

    /// Generation of the save still running, if any
    pub fn in_flight(&self) -> Option<Generation> {
        self.in_flight.as_ref().map(SaveHandle::generation)
    }

    /// Resolve the previous save, then start saving `blob` in the background
    pub async fn submit(&mut self, generation: Generation, blob: StateBlob) -> SubmitReceipt {
        let previous = self.poll_previous().await;
        if let Some(outcome) = &previous {
            if let Err(e) = &outcome.result {
                error!(
                    generation = %outcome.generation,
                    error = %e,
                    "Previous checkpoint save failed"
                );
            }
        }

        self.writer.prepare();
        let writer = self.writer.clone();
        let task = tokio::spawn(async move { writer.persist(generation, blob).await });
        self.in_flight = Some(SaveHandle { generation, task });
        debug!(%generation, "Checkpoint save submitted");

        SubmitReceipt {
            generation,
            previous,
        }
    }

    /// Wait for the in-flight save, if any, and take its outcome
    pub async fn poll_previous(&mut self) -> Option<SaveOutcome> {
        match self.in_flight.take() {
            Some(handle) => Some(handle.wait().await),
            None => None,
        }
    }

    /// Take the in-flight outcome only if the save already finished
    pub async fn try_poll_previous(&mut self) -> Option<SaveOutcome> {
        if self.in_flight.as_ref().is_some_and(SaveHandle::is_finished) {
            self.poll_previous().await
        } else {
            None
        }
    }

    /// Wait for the in-flight save and surface its failure
    pub async fn flush(&mut self) -> Result<()> {
        match self.poll_previous().await {
            Some(outcome) => outcome.into_result(),
            None => Ok(()),
        }
    }
}
