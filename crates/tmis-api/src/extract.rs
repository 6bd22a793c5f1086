//! Request extractors
//!
//! Author: hephaex@gmail.com

use crate::error::AppError;
use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequest;
use tmis_core::FieldError;

/// JSON body whose rejections use the API error shape
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(err) => {
                AppError::Validation(vec![data_error_field(&err.body_text())])
            }
            JsonRejection::JsonSyntaxError(_) => {
                AppError::BadRequest("Request body is not valid JSON".to_string())
            }
            JsonRejection::MissingJsonContentType(_) => {
                AppError::BadRequest("Expected Content-Type: application/json".to_string())
            }
            other => AppError::BadRequest(other.body_text()),
        }
    }
}

/// Map a serde data error onto the offending field
fn data_error_field(text: &str) -> FieldError {
    if let Some(field) = between_backticks(text, "missing field `") {
        let message = format!("{field} is required");
        return FieldError::new(field, message);
    }

    // serde_path_to_error prefixes the path: "...target type: email: invalid type..."
    let detail = text.rsplit("target type: ").next().unwrap_or(text);
    match detail.split_once(": ") {
        Some((path, message)) if !path.contains(' ') && !path.is_empty() && path != "." => {
            FieldError::new(path, message)
        }
        _ => FieldError::new("body", detail),
    }
}

fn between_backticks<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let start = text.find(prefix)? + prefix.len();
    let rest = &text[start..];
    rest.find('`').map(|end| &rest[..end])
}
