//! Contains the handler that makes a stream playable

use crate::handlers::{error_response, json_response, manager_error_response, stream_id_parameter};
use crate::routing::RouteHandler;
use async_trait::async_trait;
use hyper::{Body, Error, Request, Response, StatusCode};
use roadvision_core::manager::StreamManager;
use serde::Serialize;
use std::collections::HashMap;

/// Ensures the stream is being transcoded and responds with the url its playlist is served from.
/// Only streams with an rtsp source can be played.
pub struct PlayStreamHandler {
    manager: StreamManager,
}

#[derive(Serialize)]
pub struct PlayStreamResponse {
    pub hls_url: String,
}

impl PlayStreamHandler {
    pub fn new(manager: StreamManager) -> Self {
        PlayStreamHandler { manager }
    }
}

#[async_trait]
impl RouteHandler for PlayStreamHandler {
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

        match self.manager.play_stream(&id).await {
            Ok(hls_url) => Ok(json_response(StatusCode::OK, &PlayStreamResponse { hls_url })),
            Err(error) => Ok(manager_error_response(&error)),
        }
    }
}
