//! Mechanisms to define the routes of the HTTP api, and which handler runs for each of them.

use async_trait::async_trait;
use hyper::{Body, Method, Request, Response};
use std::collections::HashMap;

/// How a single fragment of the url path is matched.  A fragment is everything between a `/` and
/// either the next `/` or the end of the path.  Query parameters are not considered.
#[derive(Clone)]
pub enum PathPart {
    /// The fragment must match this exact, case sensitive, value
    Exact { value: String },

    /// The fragment can be any string.  Its value is handed to the handler as a path parameter
    /// with the given name.
    Parameter { name: String },
}

impl PathPart {
    pub fn exact(value: &str) -> Self {
        PathPart::Exact {
            value: value.to_string(),
        }
    }

    pub fn parameter(name: &str) -> Self {
        PathPart::Parameter {
            name: name.to_string(),
        }
    }
}

/// Code that runs for a matched route
#[async_trait]
pub trait RouteHandler {
    /// Executes the handler for the request, with the path parameters already extracted.  The
    /// request id is the one the request's log entries are tagged with.
    async fn execute(
        &self,
        request: &mut Request<Body>,
        path_parameters: HashMap<String, String>,
        request_id: String,
    ) -> Result<Response<Body>, hyper::Error>;
}

/// An http method and path, and the handler that serves requests matching them
pub struct Route {
    pub method: Method,
    pub path: Vec<PathPart>,
    pub handler: Box<dyn RouteHandler + Sync + Send>,
}

#[derive(thiserror::Error, Debug)]
pub enum RouteRegistrationError {
    /// A route with the same method and path parts is already registered
    #[error("A route is already registered that conflicts with this route")]
    RouteConflict,
}

/// All routes the api serves
pub struct RoutingTable {
    routes: HashMap<Method, RouteNode>,
}

#[derive(PartialEq, Eq, Hash)]
enum SearchablePathPart {
    Exact(String),
    Parameter,
}

struct RouteNode {
    leaf: Option<Route>,
    children: HashMap<SearchablePathPart, RouteNode>,
}

impl RouteNode {
    fn new() -> Self {
        RouteNode {
            leaf: None,
            children: HashMap::new(),
        }
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, route: Route) -> Result<(), RouteRegistrationError> {
        let mut node = self
            .routes
            .entry(route.method.clone())
            .or_insert_with(RouteNode::new);

        for part in &route.path {
            let searchable_part = match part {
                PathPart::Exact { value } => SearchablePathPart::Exact(value.clone()),
                PathPart::Parameter { .. } => SearchablePathPart::Parameter,
            };

            node = node
                .children
                .entry(searchable_part)
                .or_insert_with(RouteNode::new);
        }

        if node.leaf.is_some() {
            return Err(RouteRegistrationError::RouteConflict);
        }

        node.leaf = Some(route);

        Ok(())
    }

    /// Finds the route for the method and path.  Exact fragments win over parameters.
    pub fn get_route(&self, method: &Method, path_parts: &[&str]) -> Option<&Route> {
        let node = self.routes.get(method)?;
        find_route(0, path_parts, node)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        RoutingTable::new()
    }
}

fn find_route<'a>(index: usize, parts: &[&str], current_node: &'a RouteNode) -> Option<&'a Route> {
    if index >= parts.len() {
        return current_node.leaf.as_ref();
    }

    if let Some(exact_child) = current_node
        .children
        .get(&SearchablePathPart::Exact(parts[index].to_string()))
    {
        if let Some(route) = find_route(index + 1, parts, exact_child) {
            return Some(route);
        }
    }

    if let Some(parameter_child) = current_node.children.get(&SearchablePathPart::Parameter) {
        if let Some(route) = find_route(index + 1, parts, parameter_child) {
            return Some(route);
        }
    }

    None
}

impl Route {
    pub fn get_parameters(&self, path_parts: &[&str]) -> HashMap<String, String> {
        let mut results = HashMap::new();
        for (part, value) in self.path.iter().zip(path_parts) {
            if let PathPart::Parameter { name } = part {
                results.insert(name.clone(), value.to_string());
            }
        }

        results
    }
}
