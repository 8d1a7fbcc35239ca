use axum::{
    Json,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{BytesRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use vitae_api_types::{Envelope, ExportFormat, ExportQuery, ImportOutcome, ImportQuery, SaveOutcome};

use crate::application::cv::transfer;
use crate::domain::CvDocument;
use crate::domain::document::is_known_section;

use super::error::ApiError;
use super::state::ApiState;

pub async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn get_cv(State(state): State<ApiState>) -> Result<Json<Envelope<Value>>, ApiError> {
    let document = state.cv.get_cv(false).await?;
    Ok(Json(Envelope::ok(document.into())))
}

pub async fn save_cv(
    State(state): State<ApiState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Envelope<SaveOutcome>>, ApiError> {
    let body = read_body(&state, body)?;
    let value: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request("Body must be a JSON document").with_detail(err.to_string()))?;
    let document =
        CvDocument::from_value(value).map_err(|err| ApiError::invalid_document(err.to_string()))?;

    let version = state.cv.save_cv(&document).await?;
    Ok(Json(Envelope::ok(SaveOutcome { version })))
}

pub async fn export_cv(
    State(state): State<ApiState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        None | Some("") => ExportFormat::default(),
        Some(raw) => raw
            .parse::<ExportFormat>()
            .map_err(ApiError::unsupported_format)?,
    };

    let document = state.cv.get_cv(false).await?;
    let text = transfer::export(&document, format)?;

    let mut response = text.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", document.version())) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"cv.{}\"", format.as_str()))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

pub async fn import_cv(
    State(state): State<ApiState>,
    query: Result<Query<ImportQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Envelope<ImportOutcome>>, ApiError> {
    let Query(query) = query.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let body = read_body(&state, body)?;

    let format = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(transfer::format_from_content_type);
    let document = transfer::parse_import(&body, format)?;
    let version = document.version();

    if query.preview {
        return Ok(Json(Envelope::ok(ImportOutcome {
            preview: true,
            saved: false,
            version,
            document: document.into(),
        })));
    }

    let version = state.cv.save_cv(&document).await?;
    Ok(Json(Envelope::ok(ImportOutcome {
        preview: false,
        saved: true,
        version,
        document: document.into(),
    })))
}

pub async fn get_section(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Envelope<Value>>, ApiError> {
    if !is_known_section(&name) {
        return Err(ApiError::bad_request(format!("Unknown section `{name}`")));
    }

    let document = state.cv.get_cv(false).await?;
    match document.section(&name) {
        Some(section) => Ok(Json(Envelope::ok(section.clone()))),
        None => Err(ApiError::not_found(format!(
            "Section `{name}` is not present in the document"
        ))),
    }
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("Unknown route")
}

fn read_body(state: &ApiState, body: Result<Bytes, BytesRejection>) -> Result<Bytes, ApiError> {
    match body {
        Ok(bytes) if bytes.len() > state.max_body_bytes => {
            Err(ApiError::payload_too_large(state.max_body_bytes))
        }
        Ok(bytes) => Ok(bytes),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(ApiError::payload_too_large(state.max_body_bytes))
        }
        Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
    }
}
