//! Contains the handler that stops tracking a stream

use crate::handlers::{error_response, stream_id_parameter};
use crate::routing::RouteHandler;
use async_trait::async_trait;
use hyper::{Body, Error, Request, Response, StatusCode};
use roadvision_core::manager::StreamManager;
use std::collections::HashMap;

/// Removes a stream, responding only once its transcoder has exited and its output is deleted
pub struct DeleteStreamHandler {
    manager: StreamManager,
}

impl DeleteStreamHandler {
    pub fn new(manager: StreamManager) -> Self {
        DeleteStreamHandler { manager }
    }
}

#[async_trait]
impl RouteHandler for DeleteStreamHandler {
    async fn execute(
        &self,
        _request: &mut Request<Body>,
        path_parameters: HashMap<String, String>,
        _request_id: String,
    ) -> Result<Response<Body>, Error> {
        let id = match stream_id_parameter(&path_parameters) {
            Some(id) => id,
            None => {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "No stream id specified".to_string(),
                ))
            }
        };

        if self.manager.remove_stream(&id).await {
            let mut response = Response::default();
            *response.status_mut() = StatusCode::NO_CONTENT;

            Ok(response)
        } else {
            Ok(error_response(
                StatusCode::NOT_FOUND,
                format!("No stream exists with the id '{}'", id),
            ))
        }
    }
}
