pub mod extract;
pub mod models;

pub use extract::{ExtractionError, LlmVehicleExtractor, VehicleExtractor};
pub use models::ExtractionResult;
