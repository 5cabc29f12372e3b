//! HTTP api for managing the tracked streams.  Requests are dispatched through a `RoutingTable`,
//! so the binary decides which routes are exposed.

pub mod handlers;
pub mod routing;

use handlers::create_stream::CreateStreamHandler;
use handlers::delete_stream::DeleteStreamHandler;
use handlers::get_stream::GetStreamHandler;
use handlers::list_streams::ListStreamsHandler;
use handlers::play_stream::PlayStreamHandler;
use handlers::version::VersionHandler;
use handlers::STREAM_ID_PARAMETER;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use roadvision_core::manager::StreamManager;
use routing::{PathPart, Route, RouteRegistrationError, RoutingTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot::{channel, Receiver, Sender};
use tracing::{error, info, instrument};
use uuid::Uuid;

pub struct HttpApiShutdownSignal {}

/// Builds the routing table with every stream operation the api exposes
pub fn stream_routes(manager: StreamManager) -> Result<RoutingTable, RouteRegistrationError> {
    let streams_path = vec![PathPart::exact("api"), PathPart::exact("streams")];
    let stream_path = vec![
        PathPart::exact("api"),
        PathPart::exact("streams"),
        PathPart::parameter(STREAM_ID_PARAMETER),
    ];

    let mut routes = RoutingTable::new();
    routes.register(Route {
        method: Method::GET,
        path: Vec::new(),
        handler: Box::new(VersionHandler),
    })?;

    routes.register(Route {
        method: Method::GET,
        path: streams_path.clone(),
        handler: Box::new(ListStreamsHandler::new(manager.clone())),
    })?;

    routes.register(Route {
        method: Method::POST,
        path: streams_path,
        handler: Box::new(CreateStreamHandler::new(manager.clone())),
    })?;

    routes.register(Route {
        method: Method::GET,
        path: stream_path.clone(),
        handler: Box::new(GetStreamHandler::new(manager.clone())),
    })?;

    routes.register(Route {
        method: Method::DELETE,
        path: stream_path,
        handler: Box::new(DeleteStreamHandler::new(manager.clone())),
    })?;

    routes.register(Route {
        method: Method::POST,
        path: vec![
            PathPart::exact("api"),
            PathPart::exact("play"),
            PathPart::parameter(STREAM_ID_PARAMETER),
        ],
        handler: Box::new(PlayStreamHandler::new(manager)),
    })?;

    Ok(routes)
}

/// Starts serving the routes on the address.  The server stops accepting requests once a signal
/// is sent through the returned sender, or the sender is dropped.
pub fn start_http_api(
    bind_address: SocketAddr,
    routes: RoutingTable,
) -> Result<Sender<HttpApiShutdownSignal>, hyper::Error> {
    let routes = Arc::new(routes);
    let service = make_service_fn(move |socket: &AddrStream| {
        let remote_address = socket.remote_addr();
        let routes_clone = routes.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request: Request<Body>| {
                let request_id = Uuid::new_v4();
                execute_request(request, remote_address, routes_clone.clone(), request_id)
            }))
        }
    });

    let (sender, receiver) = channel();
    let server = Server::try_bind(&bind_address)?
        .serve(service)
        .with_graceful_shutdown(graceful_shutdown(receiver));

    info!("Starting HTTP api on {}", bind_address);
    tokio::spawn(async {
        if let Err(error) = server.await {
            error!("HTTP api stopped with an error: {}", error);
        }
    });

    Ok(sender)
}

async fn graceful_shutdown(shutdown_signal: Receiver<HttpApiShutdownSignal>) {
    let _ = shutdown_signal.await;
    info!("HTTP api shutting down");
}

#[instrument(
    skip(request, client_address, routes),
    fields(http_method = %request.method(), http_uri = %request.uri(), client_ip = %client_address.ip())
)]
async fn execute_request(
    mut request: Request<Body>,
    client_address: SocketAddr,
    routes: Arc<RoutingTable>,
    request_id: Uuid,
) -> Result<Response<Body>, hyper::Error> {
    info!(
        "Incoming HTTP request for {} {} from {}",
        request.method(),
        request.uri(),
        client_address.ip()
    );

    let started_at = Instant::now();

    match execute_handler(&mut request, &routes, request_id.to_string()).await {
        Ok(response) => {
            let elapsed = started_at.elapsed();
            info!(
                duration = %elapsed.as_millis(),
                "Request returning status code {} in {} ms", response.status(), elapsed.as_millis()
            );

            Ok(response)
        }

        Err(error) => {
            let elapsed = started_at.elapsed();
            error!(
                duration = %elapsed.as_millis(),
                "Request thrown error: {:?}", error
            );

            Err(error)
        }
    }
}

/// Runs the handler of the route matching the request, or returns a 404 when no route matches
pub async fn execute_handler(
    request: &mut Request<Body>,
    routes: &RoutingTable,
    request_id: String,
) -> Result<Response<Body>, hyper::Error> {
    let path = request.uri().path().to_string();
    let parts = path
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

    match routes.get_route(request.method(), &parts) {
        Some(route) => {
            let parameters = route.get_parameters(&parts);
            route.handler.execute(request, parameters, request_id).await
        }

        None => {
            let mut response = Response::new(Body::from("Invalid URL"));
            *response.status_mut() = StatusCode::NOT_FOUND;

            Ok(response)
        }
    }
}
