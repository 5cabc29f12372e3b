//! Implementations of `RouteHandler` for the stream operations

pub mod create_stream;
pub mod delete_stream;
pub mod get_stream;
pub mod list_streams;
pub mod play_stream;
pub mod version;

use hyper::header::HeaderValue;
use hyper::{Body, Response, StatusCode};
use roadvision_core::manager::StreamManagerError;
use roadvision_core::StreamId;
use serde::Serialize;
use std::collections::HashMap;
use tracing::error;

/// Name of the path parameter that holds a stream's id
pub const STREAM_ID_PARAMETER: &str = "id";

/// Body returned with every error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Serializes the value as the body of a json response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let json = match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(error) => {
            error!("Failed to serialize response to json: {:?}", error);
            let mut response = Response::default();
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;

            return response;
        }
    };

    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        hyper::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    response
}

pub fn error_response(status: StatusCode, message: String) -> Response<Body> {
    json_response(status, &ErrorResponse { error: message })
}

/// Maps a stream manager error to the status code clients should see
pub fn manager_error_response(error: &StreamManagerError) -> Response<Body> {
    let status = match error {
        StreamManagerError::NotFound(_) => StatusCode::NOT_FOUND,
        StreamManagerError::InvalidSource { .. } => StatusCode::BAD_REQUEST,
        StreamManagerError::LaunchFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    error_response(status, error.to_string())
}

fn stream_id_parameter(path_parameters: &HashMap<String, String>) -> Option<StreamId> {
    path_parameters
        .get(STREAM_ID_PARAMETER)
        .map(|id| StreamId(id.clone()))
}
