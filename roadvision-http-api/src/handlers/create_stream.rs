//! Contains the handler that adds a new stream
//!
//! The request body is a json object with the `name` and `source` of the stream.  Streams with an
//! rtsp source start transcoding and analysis right away, all others are only tracked.

use crate::handlers::{error_response, json_response, manager_error_response};
use crate::routing::RouteHandler;
use async_trait::async_trait;
use hyper::{Body, Error, Request, Response, StatusCode};
use roadvision_core::manager::StreamManager;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

pub struct CreateStreamHandler {
    manager: StreamManager,
}

#[derive(Deserialize)]
pub struct CreateStreamRequest {
    pub name: String,
    pub source: String,
}

impl CreateStreamHandler {
    pub fn new(manager: StreamManager) -> Self {
        CreateStreamHandler { manager }
    }
}

#[async_trait]
impl RouteHandler for CreateStreamHandler {
    async fn execute(
        &self,
        request: &mut Request<Body>,
        _path_parameters: HashMap<String, String>,
        _request_id: String,
    ) -> Result<Response<Body>, Error> {
        let body = hyper::body::to_bytes(request.body_mut()).await?;
        let create_request = match serde_json::from_slice::<CreateStreamRequest>(&body) {
            Ok(create_request) => create_request,
            Err(error) => {
                warn!("Invalid create stream request: {}", error);
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid request body: {}", error),
                ));
            }
        };

        // A launch failure still leaves the stream tracked
        match self
            .manager
            .add_stream(create_request.name, create_request.source)
            .await
        {
            Ok(stream) => Ok(json_response(StatusCode::OK, &stream)),
            Err(error) => Ok(manager_error_response(&error)),
        }
    }
}
