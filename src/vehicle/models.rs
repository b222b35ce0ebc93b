use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};

pub const FUEL_TYPES: &[&str] = &["Petrol", "Diesel", "Electric", "Hybrid", "Plug-in Hybrid"];

pub const TRANSMISSIONS: &[&str] = &["Automatic", "Manual", "Semi-Automatic"];

pub const BODY_TYPES: &[&str] = &[
    "SUV",
    "Sedan",
    "Hatchback",
    "Convertible",
    "Coupe",
    "Wagon",
    "Pickup",
];

/// Vehicle attributes read off one photo. Numeric fields accept either JSON
/// numbers or numeric strings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub make: String,
    pub model: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub year: i32,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub body_type: String,
    #[serde(default)]
    pub fuel_type: String,
    #[serde(default)]
    pub transmission: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub price: f64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub mileage: u64,
    #[serde(default)]
    pub description: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub confidence: f32,
}

impl ExtractionResult {
    /// "Detected 2020 Honda City with 92% confidence"
    pub fn summary(&self) -> String {
        format!(
            "Detected {} {} {} with {}% confidence",
            self.year,
            self.make,
            self.model,
            (self.confidence * 100.0).round() as u32
        )
    }
}
