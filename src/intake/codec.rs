use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures::{FutureExt, future::BoxFuture};
use image::ImageReader;
use serde::{Serialize, Serializer};
use std::{fmt, io::Cursor, sync::Arc};
use thiserror::Error;

/// Per-file upload limit.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

pub const ACCEPTED_MEDIA_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];

const ACCEPTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// One binary picked by the user, with its declared media type.
#[derive(Clone)]
pub struct SelectedFile {
    pub name: String,
    pub media_type: String,
    bytes: Arc<[u8]>,
}

impl SelectedFile {
    pub fn new(
        name: impl Into<String>,
        media_type: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    #[cfg(test)]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SelectedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedFile")
            .field("name", &self.name)
            .field("media_type", &self.media_type)
            .field("size", &self.size())
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("{name} is {size} bytes, over the {limit} byte limit")]
    TooLarge {
        name: String,
        size: usize,
        limit: usize,
    },
    #[error("{name} has unsupported type `{media_type}`")]
    UnsupportedType { name: String, media_type: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{name}: unreadable image data ({reason})")]
pub struct DecodeError {
    pub name: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Size and type checks run before any encoding starts.
pub fn admit(file: &SelectedFile) -> Result<(), AdmissionError> {
    if file.size() > MAX_IMAGE_BYTES {
        return Err(AdmissionError::TooLarge {
            name: file.name.clone(),
            size: file.size(),
            limit: MAX_IMAGE_BYTES,
        });
    }
    if !accepted_type(file) {
        return Err(AdmissionError::UnsupportedType {
            name: file.name.clone(),
            media_type: file.media_type.clone(),
        });
    }
    Ok(())
}

fn accepted_type(file: &SelectedFile) -> bool {
    let declared = file.media_type.trim().to_ascii_lowercase();
    if !declared.is_empty() {
        return ACCEPTED_MEDIA_TYPES.contains(&declared.as_str());
    }
    file.name
        .rsplit_once('.')
        .map(|(_, ext)| ACCEPTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// A `data:<mime>;base64,<payload>` rendering of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBytes(String);

impl EncodedBytes {
    pub fn from_data_uri(uri: impl Into<String>) -> Result<Self, DecodeError> {
        let uri = uri.into();
        split_data_uri(&uri).ok_or_else(|| DecodeError::new("data uri", "malformed data uri"))?;
        Ok(Self(uri))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn media_type(&self) -> &str {
        split_data_uri(&self.0).map(|(mime, _)| mime).unwrap_or_default()
    }

    /// Base64 payload without the `data:` header.
    pub fn payload(&self) -> &str {
        split_data_uri(&self.0)
            .map(|(_, payload)| payload)
            .unwrap_or_default()
    }

    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        BASE64
            .decode(self.payload())
            .map_err(|err| DecodeError::new("data uri", err.to_string()))
    }
}

impl Serialize for EncodedBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    Some((mime, payload))
}

/// Turns one file into its transportable form. Implementations must not
/// touch any shared container.
pub trait ImageCodec: Send + Sync {
    fn encode<'a>(&'a self, file: &'a SelectedFile)
    -> BoxFuture<'a, Result<EncodedBytes, DecodeError>>;
}

/// Sniffs the real image format and renders a base64 data URI on the
/// blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataUriCodec;

impl ImageCodec for DataUriCodec {
    fn encode<'a>(
        &'a self,
        file: &'a SelectedFile,
    ) -> BoxFuture<'a, Result<EncodedBytes, DecodeError>> {
        let name = file.name.clone();
        let bytes = file.bytes.clone();
        async move {
            let worker_name = name.clone();
            tokio::task::spawn_blocking(move || render_data_uri(&worker_name, &bytes))
                .await
                .map_err(|err| DecodeError::new(name, err.to_string()))?
        }
        .boxed()
    }
}

fn render_data_uri(name: &str, bytes: &[u8]) -> Result<EncodedBytes, DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| DecodeError::new(name, err.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| DecodeError::new(name, "unrecognized image format"))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|err| DecodeError::new(name, err.to_string()))?;
    if width == 0 || height == 0 {
        return Err(DecodeError::new(name, "empty image"));
    }
    Ok(EncodedBytes(format!(
        "data:{};base64,{}",
        format.to_mime_type(),
        BASE64.encode(bytes)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::fixtures::png_bytes;

    #[test]
    fn admit_rejects_oversized_file() {
        let file = SelectedFile::new("big.jpg", "image/jpeg", vec![0u8; 6 * 1024 * 1024]);
        let err = admit(&file).expect_err("should reject");
        assert!(matches!(err, AdmissionError::TooLarge { limit, .. } if limit == MAX_IMAGE_BYTES));
    }

    #[test]
    fn admit_accepts_file_at_limit() {
        let file = SelectedFile::new("edge.png", "image/png", vec![0u8; MAX_IMAGE_BYTES]);
        assert!(admit(&file).is_ok());
    }

    #[test]
    fn admit_rejects_unsupported_type() {
        let file = SelectedFile::new("anim.gif", "image/gif", vec![1, 2, 3]);
        assert_eq!(
            admit(&file),
            Err(AdmissionError::UnsupportedType {
                name: "anim.gif".into(),
                media_type: "image/gif".into(),
            })
        );
    }

    #[test]
    fn admit_falls_back_to_extension() {
        let ok = SelectedFile::new("Front.JPEG", "", vec![1]);
        let bad = SelectedFile::new("notes.txt", "", vec![1]);
        assert!(admit(&ok).is_ok());
        assert!(admit(&bad).is_err());
    }

    #[tokio::test]
    async fn data_uri_codec_encodes_png() {
        let file = SelectedFile::new("car.png", "image/png", png_bytes());
        let encoded = DataUriCodec.encode(&file).await.expect("encode");
        assert!(encoded.as_str().starts_with("data:image/png;base64,"));
        assert_eq!(encoded.media_type(), "image/png");
        assert_eq!(encoded.decode().expect("decode"), png_bytes());
    }

    #[tokio::test]
    async fn data_uri_codec_rejects_garbage() {
        let file = SelectedFile::new("fake.jpg", "image/jpeg", b"not an image".to_vec());
        let err = DataUriCodec.encode(&file).await.expect_err("should fail");
        assert_eq!(err.name, "fake.jpg");
    }

    #[test]
    fn from_data_uri_requires_base64_header() {
        assert!(EncodedBytes::from_data_uri("data:image/png;base64,AAAA").is_ok());
        assert!(EncodedBytes::from_data_uri("https://example.com/a.png").is_err());
    }
}
