use super::models::{BODY_TYPES, ExtractionResult, FUEL_TYPES, TRANSMISSIONS};
use crate::intake::codec::{DecodeError, EncodedBytes};
use crate::llm::{ContentBlock, LlmClient, LlmContent, LlmMessage};
use futures::{FutureExt, future::BoxFuture};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("extraction request failed: {0}")]
    Remote(String),
    #[error("unable to parse extraction result: {0}")]
    InvalidResponse(String),
}

/// Remote capability that reads vehicle attributes off one encoded image.
pub trait VehicleExtractor: Send + Sync {
    fn extract<'a>(
        &'a self,
        image: &'a EncodedBytes,
    ) -> BoxFuture<'a, Result<ExtractionResult, ExtractionError>>;
}

pub struct LlmVehicleExtractor {
    llm: LlmClient,
}

impl LlmVehicleExtractor {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

impl VehicleExtractor for LlmVehicleExtractor {
    fn extract<'a>(
        &'a self,
        image: &'a EncodedBytes,
    ) -> BoxFuture<'a, Result<ExtractionResult, ExtractionError>> {
        async move {
            let messages = vec![
                LlmMessage::text("system", system_prompt()),
                LlmMessage {
                    role: "user".into(),
                    content: LlmContent::Blocks(vec![
                        ContentBlock::Text {
                            text: "Identify this vehicle and return the JSON object.".into(),
                        },
                        ContentBlock::Image {
                            mime_type: image.media_type().to_string(),
                            data: image.payload().to_string(),
                        },
                    ]),
                },
            ];

            let response = self
                .llm
                .chat(&messages)
                .await
                .map_err(|err| ExtractionError::Remote(err.to_string()))?;
            if let Some(usage) = &response.usage {
                debug!(
                    target = "intake.extract",
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "llm_usage"
                );
            }
            parse_extraction(&response.text)
        }
        .boxed()
    }
}

fn system_prompt() -> String {
    format!(
        r#"You are a vehicle intake assistant. Look at the car in the image and respond with one JSON
object with exactly these keys:
  make, model, year, color, price, mileage, bodyType, fuelType, transmission, description, confidence.
bodyType is one of {body:?}. fuelType is one of {fuel:?}. transmission is one of {trans:?}.
price is an estimated asking price as a number, mileage an estimated odometer reading as an integer,
description a short (2-3 sentence) listing description, confidence a number between 0 and 1.
Output JSON only."#,
        body = BODY_TYPES,
        fuel = FUEL_TYPES,
        trans = TRANSMISSIONS,
    )
}

pub fn parse_extraction(raw: &str) -> Result<ExtractionResult, ExtractionError> {
    let cleaned = strip_markdown_fence(raw);
    let mut value: Value = serde_json::from_str(&cleaned)
        .map_err(|err| ExtractionError::InvalidResponse(err.to_string()))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| ExtractionError::InvalidResponse("expected a json object".into()))?;
    normalize_numbers(obj);

    let mut result: ExtractionResult = serde_json::from_value(value)
        .map_err(|err| ExtractionError::InvalidResponse(err.to_string()))?;
    result.confidence = if result.confidence.is_finite() {
        result.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(result)
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// Models like to answer `"$18,000"` or `13000.0`; reduce these to forms the
/// typed fields accept.
fn normalize_numbers(obj: &mut Map<String, Value>) {
    for key in ["year", "mileage"] {
        let Some(field) = obj.get_mut(key) else {
            continue;
        };
        let replacement = match &*field {
            Value::String(s) => Some(Value::String(
                s.chars().filter(char::is_ascii_digit).collect(),
            )),
            Value::Number(n) if !n.is_u64() => n
                .as_f64()
                .filter(|f| *f >= 0.0)
                .map(|f| Value::from(f.round() as u64)),
            _ => None,
        };
        if let Some(value) = replacement {
            *field = value;
        }
    }
    if let Some(Value::String(s)) = obj.get_mut("price") {
        *s = s
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
    }
    if let Some(Value::Null) = obj.get("confidence") {
        obj.remove("confidence");
    }
}
