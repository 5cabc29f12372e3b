//! Contains the handler for getting the details of a single stream

use crate::handlers::{error_response, json_response, manager_error_response, stream_id_parameter};
use crate::routing::RouteHandler;
use async_trait::async_trait;
use hyper::{Body, Error, Request, Response, StatusCode};
use roadvision_core::manager::StreamManager;
use std::collections::HashMap;

pub struct GetStreamHandler {
    manager: StreamManager,
}

impl GetStreamHandler {
    pub fn new(manager: StreamManager) -> Self {
        GetStreamHandler { manager }
    }
}

#[async_trait]
impl RouteHandler for GetStreamHandler {
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

        match self.manager.get_stream(&id) {
            Ok(stream) => Ok(json_response(StatusCode::OK, &stream)),
            Err(error) => Ok(manager_error_response(&error)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::handlers::{test_support, STREAM_ID_PARAMETER};

    #[tokio::test]
    async fn existing_stream_is_returned() {
        let (manager, _output) = test_support::manager();
        let stream = manager
            .add_stream("bridge".to_string(), "https://example.com/video.m3u8".to_string())
            .await
            .unwrap();

        let handler = GetStreamHandler::new(manager.clone());
        let mut parameters = HashMap::new();
        parameters.insert(STREAM_ID_PARAMETER.to_string(), stream.id().0.clone());
        let response = handler
            .execute(&mut Request::new(Body::empty()), parameters, "test".to_string())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK, "Unexpected status code");
        let json = test_support::body_json(response).await;
        assert_eq!(json["id"], stream.id().0.as_str());
        assert_eq!(json["name"], "bridge");
        assert_eq!(json["source"], "https://example.com/video.m3u8");
    }

    #[tokio::test]
    async fn unknown_stream_returns_not_found() {
        let (manager, _output) = test_support::manager();
        let handler = GetStreamHandler::new(manager);
        let mut parameters = HashMap::new();
        parameters.insert(STREAM_ID_PARAMETER.to_string(), "99".to_string());

        let response = handler
            .execute(&mut Request::new(Body::empty()), parameters, "test".to_string())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND, "Unexpected status code");
    }
}
