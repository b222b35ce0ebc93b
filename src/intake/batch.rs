use super::codec::{AdmissionError, DecodeError, EncodedBytes, ImageCodec, SelectedFile, admit};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_with::{DisplayFromStr, serde_as};
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Ready,
    Failed,
}

/// One committed image. Entries never change after they are appended.
#[derive(Debug, Clone, Serialize)]
pub struct EncodedImage {
    #[serde(skip)]
    id: u64,
    source_index: usize,
    data: EncodedBytes,
    status: ImageStatus,
}

impl EncodedImage {
    fn ready(source_index: usize, data: EncodedBytes) -> Self {
        Self {
            id: 0,
            source_index,
            data,
            status: ImageStatus::Ready,
        }
    }

    /// Stable for the lifetime of the batch; never reused.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source_index(&self) -> usize {
        self.source_index
    }

    pub fn data(&self) -> &EncodedBytes {
        &self.data
    }

    pub fn status(&self) -> ImageStatus {
        self.status
    }
}

/// Ordered images of one draft, published as a whole on every commit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageBatch {
    epoch: u64,
    revision: u64,
    #[serde(skip)]
    next_id: u64,
    images: Vec<EncodedImage>,
}

impl ImageBatch {
    fn push(&mut self, mut image: EncodedImage) {
        self.next_id += 1;
        image.id = self.next_id;
        self.images.push(image);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[EncodedImage] {
        &self.images
    }

    /// Incremented once per committed change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn ids(&self) -> Vec<u64> {
        self.images.iter().map(EncodedImage::id).collect()
    }

    pub fn data_uris(&self) -> Vec<String> {
        self.images
            .iter()
            .map(|image| image.data.as_str().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FileError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Per-file outcome of one `submit` call, in selection order.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source_index: usize,
    pub name: String,
    pub status: ImageStatus,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FileError>,
}

impl FileReport {
    fn pending(source_index: usize, name: &str) -> Self {
        Self {
            source_index,
            name: name.to_string(),
            status: ImageStatus::Pending,
            error: None,
        }
    }

    fn settle(mut self, outcome: Result<(), FileError>) -> Self {
        match outcome {
            Ok(()) => self.status = ImageStatus::Ready,
            Err(err) => {
                self.status = ImageStatus::Failed;
                self.error = Some(err);
            }
        }
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub submitted: usize,
    pub committed: usize,
    pub batch_len: usize,
    pub files: Vec<FileReport>,
}

impl IngestionReport {
    /// Files that were rejected or failed to decode.
    pub fn diagnostics(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|report| report.status == ImageStatus::Failed)
    }
}

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("none of the {} selected files were accepted", diagnostics.len())]
    NoAcceptedFiles { diagnostics: Vec<FileReport> },
    #[error("batch was reset while files were encoding")]
    Superseded,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no image at position {position} (batch has {len})")]
pub struct PositionOutOfRange {
    pub position: usize,
    pub len: usize,
}

/// Fans a file selection out to the codec and joins the results into the
/// shared batch with a single commit.
#[derive(Clone)]
pub struct BatchIngestionEngine {
    codec: Arc<dyn ImageCodec>,
    batch: Arc<watch::Sender<ImageBatch>>,
}

impl BatchIngestionEngine {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        let (batch, _) = watch::channel(ImageBatch::default());
        Self {
            codec,
            batch: Arc::new(batch),
        }
    }

    pub fn codec(&self) -> Arc<dyn ImageCodec> {
        self.codec.clone()
    }

    pub fn snapshot(&self) -> ImageBatch {
        self.batch.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.batch.borrow().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.batch.borrow().is_empty()
    }

    /// Receiver of committed batches only.
    #[allow(dead_code)]
    pub fn subscribe(&self) -> watch::Receiver<ImageBatch> {
        self.batch.subscribe()
    }

    pub async fn submit(&self, files: Vec<SelectedFile>) -> Result<IngestionReport, IngestError> {
        let started = Instant::now();
        let epoch = self.batch.borrow().epoch;
        let submitted = files.len();

        let mut reports = Vec::with_capacity(submitted);
        let mut accepted = Vec::with_capacity(submitted);
        for (index, file) in files.iter().enumerate() {
            let report = FileReport::pending(index, &file.name);
            match admit(file) {
                Ok(()) => accepted.push((report, file)),
                Err(err) => {
                    warn!(target = "intake.batch", file = %file.name, error = %err, "file_rejected");
                    reports.push(report.settle(Err(err.into())));
                }
            }
        }

        if accepted.is_empty() {
            return Err(IngestError::NoAcceptedFiles {
                diagnostics: reports,
            });
        }

        let mut pending = accepted
            .into_iter()
            .map(|(report, file)| async move {
                let result = self.codec.encode(file).await;
                (report, result)
            })
            .collect::<FuturesUnordered<_>>();

        // completion order, not selection order
        let mut ready = Vec::new();
        while let Some((report, result)) = pending.next().await {
            match result {
                Ok(data) => {
                    ready.push(EncodedImage::ready(report.source_index, data));
                    reports.push(report.settle(Ok(())));
                }
                Err(err) => {
                    warn!(target = "intake.batch", file = %report.name, error = %err, "file_decode_failed");
                    reports.push(report.settle(Err(err.into())));
                }
            }
        }
        drop(pending);
        reports.sort_by_key(|report| report.source_index);

        let committed = ready.len();
        let batch_len = self.commit(epoch, ready)?;
        crate::metrics::batch_committed(submitted, committed, started.elapsed().as_millis());

        let report = IngestionReport {
            submitted,
            committed,
            batch_len,
            files: reports,
        };
        info!(
            target = "intake.batch",
            submitted,
            committed,
            failed = report.diagnostics().count(),
            batch_len,
            "batch_committed"
        );
        Ok(report)
    }

    /// Appends one already-encoded image as its own commit.
    pub fn append(&self, data: EncodedBytes) -> usize {
        let mut len = 0;
        self.batch.send_modify(|batch| {
            batch.push(EncodedImage::ready(0, data));
            batch.revision += 1;
            len = batch.images.len();
        });
        len
    }

    /// Removes the committed entry at `position`; later entries shift down.
    pub fn remove(&self, position: usize) -> Result<EncodedImage, PositionOutOfRange> {
        let mut removed = None;
        let mut len = 0;
        self.batch.send_if_modified(|batch| {
            len = batch.images.len();
            if position >= len {
                return false;
            }
            removed = Some(batch.images.remove(position));
            batch.revision += 1;
            true
        });
        removed.ok_or(PositionOutOfRange { position, len })
    }

    /// Removes the entries with the given ids in one commit. Entries added
    /// since those ids were read stay, and running joins are unaffected.
    pub fn drain(&self, ids: &[u64]) -> usize {
        let mut len = 0;
        self.batch.send_if_modified(|batch| {
            let before = batch.images.len();
            batch.images.retain(|image| !ids.contains(&image.id));
            len = batch.images.len();
            if len == before {
                return false;
            }
            batch.revision += 1;
            true
        });
        len
    }

    /// Clears the batch. Joins still running from before the reset will not
    /// commit.
    pub fn reset(&self) {
        self.batch.send_modify(|batch| {
            batch.epoch += 1;
            batch.revision += 1;
            batch.images.clear();
        });
    }

    fn commit(&self, epoch: u64, images: Vec<EncodedImage>) -> Result<usize, IngestError> {
        let mut outcome = Err(IngestError::Superseded);
        self.batch.send_if_modified(|batch| {
            if batch.epoch != epoch {
                return false;
            }
            if images.is_empty() {
                outcome = Ok(batch.images.len());
                return false;
            }
            for image in images {
                batch.push(image);
            }
            batch.revision += 1;
            outcome = Ok(batch.images.len());
            true
        });
        if outcome.is_err() {
            warn!(target = "intake.batch", epoch, "stale_batch_discarded");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::codec::DataUriCodec;
    use crate::intake::fixtures::{GatedCodec, jpeg_file, png_file};

    fn engine() -> BatchIngestionEngine {
        BatchIngestionEngine::new(Arc::new(DataUriCodec))
    }

    #[tokio::test]
    async fn oversized_file_is_skipped_and_reported() {
        let engine = engine();
        let big = SelectedFile::new("big.jpg", "image/jpeg", vec![0u8; 6 * 1024 * 1024]);
        let report = engine
            .submit(vec![big, png_file("small.png")])
            .await
            .expect("submit");

        assert_eq!(engine.len(), 1);
        assert_eq!(report.committed, 1);
        let diagnostics: Vec<_> = report.diagnostics().collect();
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(
            diagnostics[0].error,
            Some(FileError::Admission(AdmissionError::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn decode_failure_does_not_fail_siblings() {
        let engine = engine();
        let broken = SelectedFile::new("broken.png", "image/png", b"garbage".to_vec());
        let files = vec![png_file("a.png"), broken, jpeg_file("b.jpg")];

        let report = engine.submit(files).await.expect("submit");

        assert_eq!(report.committed, 2);
        assert_eq!(engine.len(), 2);
        assert_eq!(report.diagnostics().count(), report.submitted - report.committed);
        assert_eq!(report.files[1].status, ImageStatus::Failed);
        assert!(matches!(report.files[1].error, Some(FileError::Decode(_))));
    }

    #[tokio::test]
    async fn no_accepted_files_leaves_batch_untouched() {
        let engine = engine();
        engine.submit(vec![png_file("keep.png")]).await.expect("seed");
        let before = engine.snapshot();

        let err = engine
            .submit(vec![SelectedFile::new("doc.pdf", "application/pdf", vec![1])])
            .await
            .expect_err("nothing accepted");

        assert!(matches!(err, IngestError::NoAcceptedFiles { ref diagnostics } if diagnostics.len() == 1));
        let after = engine.snapshot();
        assert_eq!(after.len(), 1);
        assert_eq!(after.revision(), before.revision());
    }

    #[tokio::test]
    async fn commit_follows_completion_order_and_is_atomic() {
        let codec = GatedCodec::new();
        let engine = BatchIngestionEngine::new(Arc::new(codec.clone()));
        let rx = engine.subscribe();
        let files = vec![png_file("A.png"), png_file("B.png"), png_file("C.png")];

        let driver = async {
            codec.wait_for(3).await;
            for name in ["C.png", "B.png", "A.png"] {
                assert_eq!(engine.len(), 0, "no partial batch may be visible");
                codec.release(name);
                codec.wait_finished(name).await;
            }
        };
        let (report, _) = tokio::join!(engine.submit(files), driver);
        let report = report.expect("submit");

        assert_eq!(report.committed, 3);
        let batch = engine.snapshot();
        let order: Vec<usize> = batch.images().iter().map(|i| i.source_index()).collect();
        assert_eq!(order, vec![2, 1, 0]);
        assert_eq!(rx.borrow().revision(), 1);
    }

    #[tokio::test]
    async fn remove_shifts_later_entries_down() {
        let engine = engine();
        let files = (0..4).map(|i| png_file(&format!("{i}.png"))).collect();
        engine.submit(files).await.expect("submit");
        let before = engine.snapshot();

        let removed = engine.remove(1).expect("remove");

        let after = engine.snapshot();
        assert_eq!(after.len(), before.len() - 1);
        assert_eq!(removed.source_index(), before.images()[1].source_index());
        let mut expected: Vec<_> = before.images().iter().map(|i| i.source_index()).collect();
        expected.remove(1);
        let actual: Vec<_> = after.images().iter().map(|i| i.source_index()).collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn remove_out_of_range_changes_nothing() {
        let engine = engine();
        engine.submit(vec![png_file("only.png")]).await.expect("submit");

        let err = engine.remove(3).expect_err("out of range");

        assert_eq!(err, PositionOutOfRange { position: 3, len: 1 });
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn remove_during_inflight_submit_touches_committed_only() {
        let codec = GatedCodec::new();
        let engine = BatchIngestionEngine::new(Arc::new(codec.clone()));
        codec.open("old-0.png");
        codec.open("old-1.png");
        engine
            .submit(vec![png_file("old-0.png"), png_file("old-1.png")])
            .await
            .expect("seed");
        let old_second = engine.snapshot().images()[1].data().clone();

        let driver = async {
            codec.wait_for(4).await;
            engine.remove(0).expect("remove committed entry");
            codec.release("new-0.png");
            codec.release("new-1.png");
        };
        let (report, _) = tokio::join!(
            engine.submit(vec![png_file("new-0.png"), png_file("new-1.png")]),
            driver
        );
        report.expect("submit");

        let batch = engine.snapshot();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.images()[0].data(), &old_second);
    }

    #[tokio::test]
    async fn reset_discards_inflight_join() {
        let codec = GatedCodec::new();
        let engine = BatchIngestionEngine::new(Arc::new(codec.clone()));

        let driver = async {
            codec.wait_for(1).await;
            engine.reset();
            codec.release("late.png");
        };
        let (result, _) = tokio::join!(engine.submit(vec![png_file("late.png")]), driver);

        assert!(matches!(result, Err(IngestError::Superseded)));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn drain_removes_only_listed_entries() {
        let engine = engine();
        engine
            .submit(vec![png_file("a.png"), png_file("b.png")])
            .await
            .expect("first selection");
        let taken = engine.snapshot().ids();
        engine.submit(vec![jpeg_file("c.jpg")]).await.expect("second selection");
        let kept = engine.snapshot().images()[2].data().clone();
        let revision = engine.snapshot().revision();

        assert_eq!(engine.drain(&taken), 1);

        let batch = engine.snapshot();
        assert_eq!(batch.images()[0].data(), &kept);
        assert_eq!(batch.images()[0].data().media_type(), "image/jpeg");
        assert_eq!(batch.revision(), revision + 1);
        assert_eq!(engine.drain(&taken), 1);
        assert_eq!(engine.snapshot().revision(), revision + 1);
    }

    #[tokio::test]
    async fn drain_keeps_inflight_join_alive() {
        let codec = GatedCodec::new();
        let engine = BatchIngestionEngine::new(Arc::new(codec.clone()));
        codec.open("old.png");
        engine.submit(vec![png_file("old.png")]).await.expect("seed");
        let taken = engine.snapshot().ids();

        let driver = async {
            codec.wait_for(2).await;
            engine.drain(&taken);
            codec.release("new.png");
        };
        let (report, _) = tokio::join!(engine.submit(vec![png_file("new.png")]), driver);

        assert_eq!(report.expect("not superseded").batch_len, 1);
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn append_commits_single_entry() {
        let engine = engine();
        let data = EncodedBytes::from_data_uri("data:image/png;base64,AAAA").expect("uri");
        assert_eq!(engine.append(data), 1);
        assert_eq!(engine.snapshot().revision(), 1);
    }
}
