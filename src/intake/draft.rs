use super::batch::BatchIngestionEngine;
use crate::store::StoreError;
use crate::vehicle::ExtractionResult;
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{fmt, str::FromStr, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;

const MIN_YEAR: i32 = 1900;
const MIN_DESCRIPTION_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarStatus {
    #[default]
    Available,
    Unavailable,
    Sold,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown car status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for CarStatus {
    type Err = UnknownStatus;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "AVAILABLE" => Ok(CarStatus::Available),
            "UNAVAILABLE" => Ok(CarStatus::Unavailable),
            "SOLD" => Ok(CarStatus::Sold),
            _ => Err(UnknownStatus(input.to_string())),
        }
    }
}

/// Form state as the user typed it. Numbers stay text until validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ListingFields {
    pub make: String,
    pub model: String,
    pub year: String,
    pub price: String,
    pub mileage: String,
    pub color: String,
    pub fuel_type: String,
    pub transmission: String,
    pub body_type: String,
    pub seats: String,
    pub description: String,
    pub status: CarStatus,
    pub featured: bool,
}

/// Manual edit; only present fields are written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldPatch {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<String>,
    pub price: Option<String>,
    pub mileage: Option<String>,
    pub color: Option<String>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub seats: Option<String>,
    pub description: Option<String>,
    pub status: Option<CarStatus>,
    pub featured: Option<bool>,
}

/// Validated listing in the shape the persistence layer stores.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CarRecord {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub mileage: u64,
    pub color: String,
    pub fuel_type: String,
    pub transmission: String,
    pub body_type: String,
    pub seats: Option<u32>,
    pub description: String,
    pub status: CarStatus,
    pub featured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.0.iter().map(|e| e.field).collect();
        write!(f, "invalid fields: {}", fields.join(", "))
    }
}

impl ValidationErrors {
    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }
}

impl ListingFields {
    pub fn apply_patch(&mut self, patch: FieldPatch) {
        let FieldPatch {
            make,
            model,
            year,
            price,
            mileage,
            color,
            fuel_type,
            transmission,
            body_type,
            seats,
            description,
            status,
            featured,
        } = patch;
        let text_fields = [
            (&mut self.make, make),
            (&mut self.model, model),
            (&mut self.year, year),
            (&mut self.price, price),
            (&mut self.mileage, mileage),
            (&mut self.color, color),
            (&mut self.fuel_type, fuel_type),
            (&mut self.transmission, transmission),
            (&mut self.body_type, body_type),
            (&mut self.seats, seats),
            (&mut self.description, description),
        ];
        for (slot, value) in text_fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(featured) = featured {
            self.featured = featured;
        }
    }

    /// Overwrites every extracted field; seats, status and featured are not
    /// part of an extraction and keep their values.
    pub fn apply_extraction(&mut self, result: &ExtractionResult) {
        self.make = result.make.clone();
        self.model = result.model.clone();
        self.year = result.year.to_string();
        self.color = result.color.clone();
        self.body_type = result.body_type.clone();
        self.fuel_type = result.fuel_type.clone();
        self.price = result.price.to_string();
        self.mileage = result.mileage.to_string();
        self.transmission = result.transmission.clone();
        self.description = result.description.clone();
    }

    pub fn validate(&self) -> Result<CarRecord, ValidationErrors> {
        self.validate_for_year(Utc::now().year())
    }

    pub fn validate_for_year(&self, current_year: i32) -> Result<CarRecord, ValidationErrors> {
        let mut errors = Vec::new();
        let mut fail = |field: &'static str, message: &str| {
            errors.push(FieldError {
                field,
                message: message.to_string(),
            })
        };

        let make = required(&self.make, "make", "Make is required", &mut fail);
        let model = required(&self.model, "model", "Model is required", &mut fail);
        let color = required(&self.color, "color", "Color is required", &mut fail);
        let fuel_type = required(&self.fuel_type, "fuel_type", "Fuel type is required", &mut fail);
        let transmission = required(
            &self.transmission,
            "transmission",
            "Transmission is required",
            &mut fail,
        );
        let body_type = required(&self.body_type, "body_type", "Body type is required", &mut fail);

        let year = self
            .year
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|year| (MIN_YEAR..=current_year + 1).contains(year));
        if year.is_none() {
            fail("year", "Valid year required");
        }

        let price = if self.price.trim().is_empty() {
            fail("price", "Price is required");
            None
        } else {
            let parsed = self
                .price
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|price| price.is_finite() && *price >= 0.0);
            if parsed.is_none() {
                fail("price", "Price must be a non-negative number");
            }
            parsed
        };

        let mileage = if self.mileage.trim().is_empty() {
            fail("mileage", "Mileage is required");
            None
        } else {
            let parsed = self.mileage.trim().parse::<u64>().ok();
            if parsed.is_none() {
                fail("mileage", "Mileage must be a non-negative whole number");
            }
            parsed
        };

        let seats = match self.seats.trim() {
            "" => Some(None),
            raw => raw.parse::<u32>().ok().map(Some),
        };
        if seats.is_none() {
            fail("seats", "Seats must be a non-negative whole number");
        }

        let description = self.description.trim();
        if description.chars().count() < MIN_DESCRIPTION_CHARS {
            fail(
                "description",
                "Description must be at least 10 characters",
            );
        }

        match (year, price, mileage, seats) {
            (Some(year), Some(price), Some(mileage), Some(seats)) if errors.is_empty() => {
                Ok(CarRecord {
                    make,
                    model,
                    year,
                    price,
                    mileage,
                    color,
                    fuel_type,
                    transmission,
                    body_type,
                    seats,
                    description: description.to_string(),
                    status: self.status,
                    featured: self.featured,
                })
            }
            _ => Err(ValidationErrors(errors)),
        }
    }
}

fn required(
    value: &str,
    field: &'static str,
    message: &str,
    fail: &mut impl FnMut(&'static str, &str),
) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fail(field, message);
    }
    trimmed.to_string()
}

/// Snapshot handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ListingSubmission {
    pub car: CarRecord,
    pub images: Vec<String>,
    /// Batch entries the images were read from, in the same order.
    #[serde(skip)]
    pub image_ids: Vec<u64>,
}

#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("upload at least 1 image")]
    MissingImages,
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("a submission is already in flight")]
    InFlight,
    #[error("draft was reset while the submission ran")]
    Superseded,
    #[error("failed to store listing: {0}")]
    Persist(#[from] StoreError),
}

/// The draft's scalar fields plus the image batch they travel with.
#[derive(Clone)]
pub struct DraftListingModel {
    fields: Arc<RwLock<ListingFields>>,
    images: BatchIngestionEngine,
}

impl DraftListingModel {
    pub fn new(images: BatchIngestionEngine) -> Self {
        Self {
            fields: Arc::new(RwLock::new(ListingFields::default())),
            images,
        }
    }

    pub fn images(&self) -> &BatchIngestionEngine {
        &self.images
    }

    pub async fn fields(&self) -> ListingFields {
        self.fields.read().await.clone()
    }

    pub async fn edit(&self, patch: FieldPatch) -> ListingFields {
        let mut fields = self.fields.write().await;
        fields.apply_patch(patch);
        fields.clone()
    }

    pub async fn apply_extraction(&self, result: &ExtractionResult) {
        self.fields.write().await.apply_extraction(result);
    }

    pub async fn validate(&self) -> Result<CarRecord, ValidationErrors> {
        self.fields.read().await.validate()
    }

    /// Clears fields and images.
    pub async fn clear(&self) {
        *self.fields.write().await = ListingFields::default();
        self.images.reset();
    }

    /// Checks images first, then fields.
    pub async fn prepare_submission(&self) -> Result<ListingSubmission, SubmitError> {
        let batch = self.images.snapshot();
        if batch.is_empty() {
            return Err(SubmitError::MissingImages);
        }
        let car = self.validate().await?;
        Ok(ListingSubmission {
            car,
            images: batch.data_uris(),
            image_ids: batch.ids(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::codec::{DataUriCodec, EncodedBytes};
    use crate::intake::fixtures::honda_city;

    fn complete_fields() -> ListingFields {
        ListingFields {
            make: "Honda".into(),
            model: "City".into(),
            year: "2020".into(),
            price: "18000".into(),
            mileage: "13000".into(),
            color: "Silver".into(),
            fuel_type: "Petrol".into(),
            transmission: "Automatic".into(),
            body_type: "Sedan".into(),
            seats: String::new(),
            description: "Well kept, one owner.".into(),
            status: CarStatus::Available,
            featured: false,
        }
    }

    fn failed_fields(err: &ValidationErrors) -> Vec<&'static str> {
        err.fields().iter().map(|e| e.field).collect()
    }

    #[test]
    fn complete_form_validates() {
        let record = complete_fields().validate_for_year(2025).expect("valid");
        assert_eq!(record.year, 2020);
        assert_eq!(record.price, 18000.0);
        assert_eq!(record.mileage, 13000);
        assert_eq!(record.seats, None);
    }

    #[test]
    fn empty_form_reports_every_required_field() {
        let err = ListingFields::default()
            .validate_for_year(2025)
            .expect_err("invalid");
        assert_eq!(
            failed_fields(&err),
            vec![
                "make",
                "model",
                "color",
                "fuel_type",
                "transmission",
                "body_type",
                "year",
                "price",
                "mileage",
                "description",
            ]
        );
    }

    #[test]
    fn year_bounds_follow_current_year() {
        let mut fields = complete_fields();
        fields.year = "2026".into();
        assert!(fields.validate_for_year(2025).is_ok());
        fields.year = "2027".into();
        assert_eq!(
            failed_fields(&fields.validate_for_year(2025).unwrap_err()),
            vec!["year"]
        );
        fields.year = "1899".into();
        assert!(fields.validate_for_year(2025).is_err());
    }

    #[test]
    fn negative_numbers_are_rejected() {
        let mut fields = complete_fields();
        fields.price = "-1".into();
        fields.mileage = "-5".into();
        fields.seats = "-2".into();
        let err = fields.validate_for_year(2025).expect_err("invalid");
        assert_eq!(failed_fields(&err), vec!["price", "mileage", "seats"]);
    }

    #[test]
    fn seats_are_omitted_when_blank() {
        let record = complete_fields().validate_for_year(2025).expect("valid");
        let json = serde_json::to_value(&record).expect("serialize");
        assert!(json.get("seats").is_none());
        assert_eq!(json["fuelType"], "Petrol");

        let mut fields = complete_fields();
        fields.seats = "5".into();
        let record = fields.validate_for_year(2025).expect("valid");
        assert_eq!(record.seats, Some(5));
    }

    #[test]
    fn short_description_is_rejected() {
        let mut fields = complete_fields();
        fields.description = "  long enough ".into();
        assert!(fields.validate_for_year(2025).is_ok());
        fields.description = "short".into();
        assert_eq!(
            failed_fields(&fields.validate_for_year(2025).unwrap_err()),
            vec!["description"]
        );
    }

    #[test]
    fn status_parses_closed_set() {
        assert_eq!(" sold".parse::<CarStatus>(), Ok(CarStatus::Sold));
        assert_eq!(
            "archived".parse::<CarStatus>(),
            Err(UnknownStatus("archived".into()))
        );
        let parsed: Result<CarStatus, _> = serde_json::from_str("\"RESERVED\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut fields = complete_fields();
        fields.apply_patch(FieldPatch {
            color: Some("Red".into()),
            featured: Some(true),
            ..FieldPatch::default()
        });
        assert_eq!(fields.color, "Red");
        assert!(fields.featured);
        assert_eq!(fields.make, "Honda");
    }

    #[test]
    fn extraction_overwrites_manual_edits() {
        let mut fields = complete_fields();
        fields.make = "Typed by hand".into();
        fields.seats = "7".into();
        fields.apply_extraction(&honda_city());
        assert_eq!(fields.make, "Honda");
        assert_eq!(fields.year, "2020");
        assert_eq!(fields.price, "18000");
        assert_eq!(fields.seats, "7");
    }

    #[tokio::test]
    async fn submission_requires_images_even_when_fields_are_valid() {
        let model = DraftListingModel::new(BatchIngestionEngine::new(Arc::new(DataUriCodec)));
        model.fields.write().await.clone_from(&complete_fields());
        assert!(model.validate().await.is_ok());

        assert!(matches!(
            model.prepare_submission().await,
            Err(SubmitError::MissingImages)
        ));
    }

    #[tokio::test]
    async fn submission_carries_images_and_record() {
        let model = DraftListingModel::new(BatchIngestionEngine::new(Arc::new(DataUriCodec)));
        model.fields.write().await.clone_from(&complete_fields());
        let data = EncodedBytes::from_data_uri("data:image/png;base64,AAAA").expect("uri");
        model.images().append(data);

        let submission = model.prepare_submission().await.expect("ready");

        assert_eq!(submission.images, vec!["data:image/png;base64,AAAA".to_string()]);
        assert_eq!(submission.image_ids, model.images().snapshot().ids());
        assert_eq!(submission.car.make, "Honda");
    }
}
