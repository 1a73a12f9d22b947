//! URL-pattern routing table
//!
//! Routes are (method, regex, handler) triples tried in registration order.
//! A pattern matches only the whole path. Capture group 1 is the model name and
//! must be non-empty; groups 2 and 3 are the version and the action and may be
//! absent.

use axum::http::{Method, StatusCode};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("route pattern '{0}' does not capture a model name")]
    MissingModelGroup(String),
}

/// Values captured from a matched path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams {
    pub model: String,
    pub version: String,
    pub action: String,
}

/// Outcome of resolving a request line
#[derive(Debug)]
pub enum Resolution<'a, H> {
    Matched { handler: &'a H, params: RouteParams },
    NotFound,
    MethodNotAllowed,
}

impl<H> Resolution<'_, H> {
    pub fn status(&self) -> StatusCode {
        match self {
            Resolution::Matched { .. } => StatusCode::OK,
            Resolution::NotFound => StatusCode::NOT_FOUND,
            Resolution::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

struct Route<H> {
    method: Method,
    pattern: Regex,
    handler: H,
}

/// Ordered routing table, immutable once the server starts
pub struct Routes<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for Routes<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> Routes<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route
    pub fn register(mut self, method: Method, pattern: &str, handler: H) -> Result<Self, RouteError> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|source| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        if regex.captures_len() < 2 {
            return Err(RouteError::MissingModelGroup(pattern.to_string()));
        }

        self.routes.push(Route {
            method,
            pattern: regex,
            handler,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the handler for `method` and `path`
    ///
    /// The first route matching both wins. If some route matched the path under
    /// a different method, the result is `MethodNotAllowed`.
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution<'_, H> {
        let mut path_matched = false;

        for route in &self.routes {
            let Some(captures) = route.pattern.captures(path) else {
                continue;
            };
            let Some(model) = captures.get(1).filter(|m| !m.as_str().is_empty()) else {
                continue;
            };
            if route.method != *method {
                path_matched = true;
                continue;
            }

            let group = |index: usize| {
                captures
                    .get(index)
                    .map_or_else(String::new, |m| m.as_str().to_string())
            };
            return Resolution::Matched {
                handler: &route.handler,
                params: RouteParams {
                    model: model.as_str().to_string(),
                    version: group(2),
                    action: group(3),
                },
            };
        }

        if path_matched {
            Resolution::MethodNotAllowed
        } else {
            Resolution::NotFound
        }
    }
}
