//! Contains the handler for getting the list of tracked streams

use crate::handlers::json_response;
use crate::routing::RouteHandler;
use async_trait::async_trait;
use hyper::{Body, Error, Request, Response, StatusCode};
use roadvision_core::manager::StreamManager;
use std::collections::HashMap;

/// Returns every tracked stream, in the order they were added
pub struct ListStreamsHandler {
    manager: StreamManager,
}

impl ListStreamsHandler {
    pub fn new(manager: StreamManager) -> Self {
        ListStreamsHandler { manager }
    }
}

#[async_trait]
impl RouteHandler for ListStreamsHandler {
    async fn execute(
        &self,
        _request: &mut Request<Body>,
        _path_parameters: HashMap<String, String>,
        _request_id: String,
    ) -> Result<Response<Body>, Error> {
        let streams = self.manager.list_streams();
        Ok(json_response(StatusCode::OK, &streams))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::handlers::test_support;

    #[tokio::test]
    async fn streams_are_listed_in_creation_order() {
        let (manager, _output) = test_support::manager();
        for name in ["first", "second"] {
            manager
                .add_stream(name.to_string(), "https://example.com/video.m3u8".to_string())
                .await
                .unwrap();
        }

        let handler = ListStreamsHandler::new(manager.clone());
        let mut request = Request::new(Body::empty());
        let response = handler
            .execute(&mut request, HashMap::new(), "test".to_string())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK, "Unexpected status code");
        let json = test_support::body_json(response).await;
        let streams = json.as_array().expect("Expected an array");
        assert_eq!(streams.len(), 2, "Unexpected number of streams");
        assert_eq!(streams[0]["name"], "first");
        assert_eq!(streams[1]["name"], "second");
        assert_eq!(streams[0]["status"], "Idle");
        assert_eq!(streams[0]["detections"], 0);
        assert!(streams[0]["hls_url"].is_null(), "Unexpected playback url");
    }
}
