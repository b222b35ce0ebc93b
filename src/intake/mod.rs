pub mod batch;
pub mod codec;
pub mod draft;
pub mod extraction;
pub mod session;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::codec::{DecodeError, EncodedBytes, ImageCodec, SelectedFile};
    use crate::vehicle::{ExtractionError, ExtractionResult, VehicleExtractor};
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use futures::{FutureExt, future::BoxFuture};
    use std::{
        collections::HashSet,
        io::Cursor,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::sync::watch;

    fn encode_image(format: image::ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([180, 20, 20]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).expect("encode fixture");
        out.into_inner()
    }

    pub fn png_bytes() -> Vec<u8> {
        encode_image(image::ImageFormat::Png)
    }

    pub fn png_file(name: &str) -> SelectedFile {
        SelectedFile::new(name, "image/png", png_bytes())
    }

    pub fn jpeg_file(name: &str) -> SelectedFile {
        SelectedFile::new(name, "image/jpeg", encode_image(image::ImageFormat::Jpeg))
    }

    /// Codec whose encodes only finish once the test releases them by name.
    #[derive(Clone)]
    pub struct GatedCodec {
        opened: Arc<watch::Sender<HashSet<String>>>,
        started: Arc<watch::Sender<usize>>,
        finished: Arc<watch::Sender<HashSet<String>>>,
    }

    impl GatedCodec {
        pub fn new() -> Self {
            Self {
                opened: Arc::new(watch::channel(HashSet::new()).0),
                started: Arc::new(watch::channel(0).0),
                finished: Arc::new(watch::channel(HashSet::new()).0),
            }
        }

        pub fn open(&self, name: &str) {
            self.opened.send_modify(|set| {
                set.insert(name.to_string());
            });
        }

        pub fn release(&self, name: &str) {
            self.open(name);
        }

        pub async fn wait_for(&self, started: usize) {
            let mut rx = self.started.subscribe();
            rx.wait_for(|count| *count >= started)
                .await
                .expect("codec alive");
        }

        /// Resolves once the encode of `name` has returned its result.
        pub async fn wait_finished(&self, name: &str) {
            let mut rx = self.finished.subscribe();
            rx.wait_for(|set| set.contains(name))
                .await
                .expect("codec alive");
        }
    }

    impl ImageCodec for GatedCodec {
        fn encode<'a>(
            &'a self,
            file: &'a SelectedFile,
        ) -> BoxFuture<'a, Result<EncodedBytes, DecodeError>> {
            async move {
                self.started.send_modify(|count| *count += 1);
                let mut rx = self.opened.subscribe();
                rx.wait_for(|set| set.contains(&file.name))
                    .await
                    .map_err(|err| DecodeError::new(file.name.clone(), err.to_string()))?;
                let encoded = EncodedBytes::from_data_uri(format!(
                    "data:image/png;base64,{}",
                    BASE64.encode(file.name.as_bytes())
                ));
                self.finished.send_modify(|set| {
                    set.insert(file.name.clone());
                });
                encoded
            }
            .boxed()
        }
    }

    pub fn honda_city() -> ExtractionResult {
        ExtractionResult {
            make: "Honda".into(),
            model: "City".into(),
            year: 2020,
            color: "Silver".into(),
            body_type: "Sedan".into(),
            fuel_type: "Petrol".into(),
            transmission: "Automatic".into(),
            price: 18000.0,
            mileage: 13000,
            description: "Single owner city sedan with full service history.".into(),
            confidence: 0.92,
        }
    }

    /// Extractor returning a canned answer, optionally held until released.
    #[derive(Clone)]
    pub struct StubExtractor {
        answer: Result<ExtractionResult, ExtractionError>,
        gate: Option<Arc<watch::Sender<bool>>>,
        pub calls: Arc<AtomicUsize>,
    }

    impl StubExtractor {
        pub fn succeeding(result: ExtractionResult) -> Self {
            Self {
                answer: Ok(result),
                gate: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                answer: Err(ExtractionError::Remote(message.to_string())),
                gate: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn gated(mut self) -> Self {
            self.gate = Some(Arc::new(watch::channel(false).0));
            self
        }

        pub fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.send_replace(true);
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl VehicleExtractor for StubExtractor {
        fn extract<'a>(
            &'a self,
            _image: &'a EncodedBytes,
        ) -> BoxFuture<'a, Result<ExtractionResult, ExtractionError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    let mut rx = gate.subscribe();
                    let _ = rx.wait_for(|open| *open).await;
                }
                self.answer.clone()
            }
            .boxed()
        }
    }
}
