use super::batch::{
    BatchIngestionEngine, ImageStatus, IngestError, IngestionReport, PositionOutOfRange,
};
use super::codec::{ImageCodec, SelectedFile};
use super::draft::{
    DraftListingModel, FieldPatch, ListingFields, ListingSubmission, SubmitError, ValidationErrors,
};
use super::extraction::{
    EditMode, ExtractionOutcome, ExtractionReconciler, ReconcileError, StagedInfo,
};
use crate::operation::{AsyncOperation, Completion};
use crate::store::{ListingStore, StoreError, StoredListing};
use crate::vehicle::VehicleExtractor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Collaborators every session is wired to.
#[derive(Clone)]
pub struct SessionDeps {
    pub codec: Arc<dyn ImageCodec>,
    pub extractor: Arc<dyn VehicleExtractor>,
    pub listings: Arc<dyn ListingStore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageView {
    pub position: usize,
    pub source_index: usize,
    pub status: ImageStatus,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftView {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub mode: EditMode,
    pub fields: ListingFields,
    /// Bumped on every committed batch change.
    pub revision: u64,
    pub images: Vec<ImageView>,
    pub staged: Option<StagedInfo>,
    pub extraction: &'static str,
    pub submission: &'static str,
}

type SubmitOperation = AsyncOperation<ListingSubmission, StoredListing, StoreError>;

/// One editing session: the draft, its AI intake and its submission.
#[derive(Clone)]
pub struct DraftSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    created_at: DateTime<Utc>,
    model: DraftListingModel,
    reconciler: ExtractionReconciler,
    submission: SubmitOperation,
}

impl DraftSession {
    pub fn new(deps: &SessionDeps) -> Self {
        let model = DraftListingModel::new(BatchIngestionEngine::new(deps.codec.clone()));
        let reconciler = ExtractionReconciler::new(model.clone(), deps.extractor.clone());
        let listings = deps.listings.clone();
        let submission = AsyncOperation::new("add_car", move |submission: ListingSubmission| {
            let listings = listings.clone();
            async move { listings.add_car(submission).await }
        });
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                model,
                reconciler,
                submission,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether an extraction or a submission is running for this draft.
    pub fn is_busy(&self) -> bool {
        self.inner.reconciler.is_in_flight() || self.inner.submission.is_in_flight()
    }

    pub async fn view(&self) -> DraftView {
        let batch = self.inner.model.images().snapshot();
        let images = batch
            .images()
            .iter()
            .enumerate()
            .map(|(position, image)| ImageView {
                position,
                source_index: image.source_index(),
                status: image.status(),
                data: image.data().as_str().to_string(),
            })
            .collect();
        DraftView {
            id: self.inner.id,
            created_at: self.inner.created_at,
            mode: self.inner.reconciler.mode().await,
            fields: self.inner.model.fields().await,
            revision: batch.revision(),
            images,
            staged: self.inner.reconciler.staged().await,
            extraction: self.inner.reconciler.state().label(),
            submission: self.inner.submission.state().label(),
        }
    }

    pub async fn edit(&self, patch: FieldPatch) -> ListingFields {
        self.inner.model.edit(patch).await
    }

    pub async fn validation(&self) -> Result<(), ValidationErrors> {
        self.inner.model.validate().await.map(|_| ())
    }

    pub async fn ingest(&self, files: Vec<SelectedFile>) -> Result<IngestionReport, IngestError> {
        self.inner.model.images().submit(files).await
    }

    pub fn remove_image(&self, position: usize) -> Result<usize, PositionOutOfRange> {
        let images = self.inner.model.images();
        images.remove(position)?;
        Ok(images.len())
    }

    pub async fn stage(&self, file: SelectedFile) -> Result<StagedInfo, ReconcileError> {
        self.inner.reconciler.stage(file).await
    }

    pub async fn clear_staged(&self) -> bool {
        self.inner.reconciler.clear_staged().await
    }

    pub async fn extract(&self) -> Result<ExtractionOutcome, ReconcileError> {
        self.inner.reconciler.extract().await
    }

    /// Back to an empty draft. The edit mode stays where it is.
    pub async fn reset(&self) -> DraftView {
        self.inner.reconciler.reset().await;
        self.inner.submission.reset();
        info!(target = "intake.session", draft_id = %self.inner.id, "draft_reset");
        self.view().await
    }

    pub async fn submit(&self) -> Result<StoredListing, SubmitError> {
        if self.inner.submission.is_in_flight() {
            return Err(SubmitError::InFlight);
        }
        let submission = self.inner.model.prepare_submission().await?;
        let submitted_ids = submission.image_ids.clone();

        let completion = self
            .inner
            .submission
            .invoke_exclusive(submission)
            .await
            .map_err(|_| SubmitError::InFlight)?;

        match completion {
            Completion::Applied(Ok(stored)) => {
                // images committed while the store call ran stay in the draft
                let remaining = self.inner.model.images().drain(&submitted_ids);
                crate::metrics::listing_submitted(true);
                info!(
                    target = "intake.session",
                    draft_id = %self.inner.id,
                    listing_id = %stored.id,
                    images = submitted_ids.len(),
                    remaining,
                    "listing_submitted"
                );
                Ok(stored)
            }
            Completion::Applied(Err(err)) => {
                crate::metrics::listing_submitted(false);
                warn!(target = "intake.session", draft_id = %self.inner.id, error = %err, "listing_submit_failed");
                Err(err.into())
            }
            Completion::Discarded => Err(SubmitError::Superseded),
        }
    }
}
