//! `apiextensions.k8s.io/v1` ConversionReview envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tether_core::Object;
use tracing::{info, warn};

use crate::{ConversionError, Converter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    #[serde(default = "review_api_version")]
    pub api_version: String,
    #[serde(default = "review_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConversionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ConversionResponse>,
}

fn review_api_version() -> String { "apiextensions.k8s.io/v1".to_string() }
fn review_kind() -> String { "ConversionReview".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub uid: String,
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    #[serde(default)]
    pub objects: Vec<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub uid: String,
    #[serde(default)]
    pub converted_objects: Vec<Json>,
    pub result: ConversionResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConversionResult {
    pub fn success() -> Self { Self { status: "Success".to_string(), message: None } }
    pub fn failure(message: impl Into<String>) -> Self { Self { status: "Failure".to_string(), message: Some(message.into()) } }
    pub fn is_success(&self) -> bool { self.status == "Success" }
}

/// Answer a review. One failed object fails the whole batch and no
/// converted objects are returned.
pub async fn review(converter: &Converter, review: ConversionReview) -> ConversionReview {
    let Some(req) = review.request else {
        let response = ConversionResponse {
            uid: String::new(),
            converted_objects: Vec::new(),
            result: ConversionResult::failure("review carries no request"),
        };
        return ConversionReview { response: Some(response), request: None, ..review };
    };
    let (converted_objects, result) = match convert_all(converter, &req.objects, &req.desired_api_version).await {
        Ok(objs) => {
            info!(uid = %req.uid, count = objs.len(), to = %req.desired_api_version, "conversion review served");
            (objs, ConversionResult::success())
        }
        Err(e) => {
            warn!(uid = %req.uid, error = %e, "conversion review failed");
            (Vec::new(), ConversionResult::failure(e.to_string()))
        }
    };
    ConversionReview {
        api_version: review.api_version,
        kind: review.kind,
        request: None,
        response: Some(ConversionResponse { uid: req.uid, converted_objects, result }),
    }
}

async fn convert_all(converter: &Converter, raw: &[Json], to: &str) -> Result<Vec<Json>, ConversionError> {
    let mut out = Vec::with_capacity(raw.len());
    for r in raw {
        let obj: Object = serde_json::from_value(r.clone()).map_err(|e| match r.get("kind").and_then(Json::as_str) {
            Some(k) if k.parse::<tether_core::Kind>().is_err() => ConversionError::UnknownKind(k.to_string()),
            _ => ConversionError::Malformed(e.to_string()),
        })?;
        let converted = converter.convert(&obj, to).await?;
        // Only apiVersion and spec change; every other field passes through as sent.
        let mut merged = r.clone();
        if let Some(m) = merged.as_object_mut() {
            m.insert("apiVersion".to_string(), Json::String(converted.api_version));
            m.insert("spec".to_string(), converted.spec);
        }
        out.push(merged);
    }
    Ok(out)
}
