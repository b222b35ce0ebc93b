//! AI intake: one staged photo, one extraction call, one merge.

use super::codec::{AdmissionError, EncodedBytes, ImageCodec, SelectedFile, admit};
use super::draft::DraftListingModel;
use crate::operation::{AsyncOperation, Completion, OperationState};
use crate::vehicle::{ExtractionError, ExtractionResult, VehicleExtractor};
use serde::Serialize;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Which editing surface the draft is on. The only edge is
/// `AiIntake -> ManualReview`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    #[default]
    AiIntake,
    ManualReview,
}

impl EditMode {
    pub fn promoted(self) -> Self {
        EditMode::ManualReview
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub result: ExtractionResult,
    pub image: EncodedBytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedInfo {
    pub name: String,
    pub media_type: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutcome {
    pub result: ExtractionResult,
    pub summary: String,
    pub mode: EditMode,
    pub batch_len: usize,
}

#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("upload an image first")]
    NoImageStaged,
    #[error("an extraction is already running")]
    InFlight,
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("staged image changed while the extraction ran")]
    Superseded,
}

#[derive(Clone)]
struct StagedImage {
    file: SelectedFile,
    generation: u64,
}

type ExtractionOperation = AsyncOperation<SelectedFile, Extraction, ExtractionError>;

#[derive(Clone)]
pub struct ExtractionReconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    model: DraftListingModel,
    staged: Mutex<Option<StagedImage>>,
    stage_generation: AtomicU64,
    mode: Mutex<EditMode>,
    operation: ExtractionOperation,
}

impl ExtractionReconciler {
    pub fn new(model: DraftListingModel, extractor: Arc<dyn VehicleExtractor>) -> Self {
        let codec = model.images().codec();
        let operation = AsyncOperation::new("extract_vehicle", move |file: SelectedFile| {
            let codec: Arc<dyn ImageCodec> = codec.clone();
            let extractor = extractor.clone();
            async move {
                let image = codec.encode(&file).await?;
                let result = extractor.extract(&image).await?;
                Ok(Extraction { result, image })
            }
        });
        Self {
            inner: Arc::new(ReconcilerInner {
                model,
                staged: Mutex::new(None),
                stage_generation: AtomicU64::new(0),
                mode: Mutex::new(EditMode::default()),
                operation,
            }),
        }
    }

    pub async fn mode(&self) -> EditMode {
        *self.inner.mode.lock().await
    }

    pub fn state(&self) -> OperationState<Extraction, ExtractionError> {
        self.inner.operation.state()
    }

    pub async fn staged(&self) -> Option<StagedInfo> {
        self.inner.staged.lock().await.as_ref().map(|staged| StagedInfo {
            name: staged.file.name.clone(),
            media_type: staged.file.media_type.clone(),
            size: staged.file.size(),
        })
    }

    /// Replaces the staged image. A pending extraction for the previous
    /// image will not be applied.
    pub async fn stage(&self, file: SelectedFile) -> Result<StagedInfo, ReconcileError> {
        admit(&file)?;
        let generation = self.inner.stage_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let info = StagedInfo {
            name: file.name.clone(),
            media_type: file.media_type.clone(),
            size: file.size(),
        };
        *self.inner.staged.lock().await = Some(StagedImage { file, generation });
        info!(target = "intake.extract", file = %info.name, generation, "image_staged");
        Ok(info)
    }

    pub async fn clear_staged(&self) -> bool {
        let mut staged = self.inner.staged.lock().await;
        self.inner.stage_generation.fetch_add(1, Ordering::SeqCst);
        staged.take().is_some()
    }

    /// Empties the draft this reconciler feeds and drops the staged image and
    /// any pending result. A merge already past its staged check finishes
    /// before the draft is cleared.
    pub async fn reset(&self) {
        let mut staged = self.inner.staged.lock().await;
        self.inner.stage_generation.fetch_add(1, Ordering::SeqCst);
        staged.take();
        self.inner.model.clear().await;
        drop(staged);
        self.inner.operation.reset();
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.operation.is_in_flight()
    }

    pub async fn extract(&self) -> Result<ExtractionOutcome, ReconcileError> {
        let Some(staged) = self.inner.staged.lock().await.clone() else {
            return Err(ReconcileError::NoImageStaged);
        };

        let started = Instant::now();
        let completion = self
            .inner
            .operation
            .invoke_exclusive(staged.file.clone())
            .await
            .map_err(|_| ReconcileError::InFlight)?;
        let elapsed_ms = started.elapsed().as_millis();

        let extraction = match completion {
            Completion::Applied(Ok(extraction)) => extraction,
            Completion::Applied(Err(err)) => {
                crate::metrics::extraction_finished(false, elapsed_ms);
                warn!(target = "intake.extract", file = %staged.file.name, error = %err, "extraction_failed");
                return Err(err.into());
            }
            Completion::Discarded => return Err(ReconcileError::Superseded),
        };
        crate::metrics::extraction_finished(true, elapsed_ms);

        // Holding the staged lock keeps stage() from interleaving with the merge.
        let current = self.inner.staged.lock().await;
        if current.as_ref().map(|s| s.generation) != Some(staged.generation) {
            warn!(target = "intake.extract", file = %staged.file.name, "extraction_superseded");
            return Err(ReconcileError::Superseded);
        }

        self.inner.model.apply_extraction(&extraction.result).await;
        let batch_len = self.inner.model.images().append(extraction.image);
        let mode = {
            let mut mode = self.inner.mode.lock().await;
            *mode = mode.promoted();
            *mode
        };
        drop(current);

        let summary = extraction.result.summary();
        info!(target = "intake.extract", file = %staged.file.name, batch_len, "{summary}");
        Ok(ExtractionOutcome {
            result: extraction.result,
            summary,
            mode,
            batch_len,
        })
    }
}
