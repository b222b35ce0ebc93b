use crate::intake::batch::IngestionReport;
use crate::intake::codec::{EncodedBytes, SelectedFile};
use crate::intake::draft::FieldError;
use crate::intake::extraction::ExtractionOutcome;
use crate::intake::session::DraftView;
use crate::store::StoredListing;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// A file as the browser sends it: either a bare base64 body with its media
/// type, or a complete data URI.
#[derive(Debug, Clone, Deserialize)]
pub struct FilePayload {
    pub name: String,
    #[serde(default)]
    pub media_type: Option<String>,
    pub data: String,
}

impl FilePayload {
    pub fn into_file(self) -> Result<SelectedFile, String> {
        if self.data.starts_with("data:") {
            let uri = EncodedBytes::from_data_uri(self.data).map_err(|err| err.to_string())?;
            let bytes = uri.decode().map_err(|err| err.to_string())?;
            let media_type = self
                .media_type
                .unwrap_or_else(|| uri.media_type().to_string());
            return Ok(SelectedFile::new(self.name, media_type, bytes));
        }
        let bytes = BASE64
            .decode(self.data.trim())
            .map_err(|err| format!("{}: invalid base64 ({err})", self.name))?;
        Ok(SelectedFile::new(
            self.name,
            self.media_type.unwrap_or_default(),
            bytes,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub files: Vec<FilePayload>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub report: IngestionReport,
    pub draft: DraftView,
}

#[derive(Debug, Serialize)]
pub struct RemoveImageResponse {
    pub batch_len: usize,
}

#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub extraction: ExtractionOutcome,
    pub draft: DraftView,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub listing: StoredListing,
    pub draft: DraftView,
}

#[derive(Debug, Deserialize)]
pub struct FavoriteRequest {
    pub user_id: String,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub detail: Option<String>,
    pub fields: Option<Vec<FieldError>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_payload_takes_media_type_from_uri() {
        let payload = FilePayload {
            name: "front.png".into(),
            media_type: None,
            data: format!("data:image/png;base64,{}", BASE64.encode(b"png")),
        };
        let file = payload.into_file().expect("file");
        assert_eq!(file.media_type, "image/png");
        assert_eq!(file.bytes(), b"png");
    }

    #[test]
    fn bare_base64_payload_keeps_declared_type() {
        let payload = FilePayload {
            name: "side.jpg".into(),
            media_type: Some("image/jpeg".into()),
            data: BASE64.encode(b"jpeg"),
        };
        let file = payload.into_file().expect("file");
        assert_eq!(file.media_type, "image/jpeg");
        assert_eq!(file.size(), 4);
    }

    #[test]
    fn invalid_base64_is_reported_with_file_name() {
        let payload = FilePayload {
            name: "broken.png".into(),
            media_type: None,
            data: "***".into(),
        };
        let err = payload.into_file().expect_err("invalid");
        assert!(err.starts_with("broken.png"));
    }
}
