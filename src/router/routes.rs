//! Route table and request validation.

use crate::config::RouteConfig;
use crate::error::{Error, Result};

/// A forwarding route. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    pub upstream_path: String,
    pub required_fields: Vec<String>,
}

impl From<&RouteConfig> for Route {
    fn from(config: &RouteConfig) -> Self {
        Self {
            path: config.path.clone(),
            upstream_path: config.upstream_path.clone(),
            required_fields: config.required_fields.clone(),
        }
    }
}

impl Route {
    /// Check the body against this route's required fields.
    ///
    /// Only structure is checked: the body must be a JSON object and each
    /// required field must be present, non-null and not an empty string. Routes without
    /// required fields accept any body unparsed.
    pub fn validate(&self, body: &[u8]) -> Result<()> {
        if self.required_fields.is_empty() {
            return Ok(());
        }

        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("Request body is not valid JSON: {}", e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| Error::Validation("Request body must be a JSON object".to_string()))?;

        for field in &self.required_fields {
            match object.get(field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(Error::Validation(format!(
                        "Missing required field '{}'",
                        field
                    )));
                }
                Some(serde_json::Value::String(s)) if s.is_empty() => {
                    return Err(Error::Validation(format!(
                        "Field '{}' must not be empty",
                        field
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

/// Lookup table from inbound path to [`Route`].
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Build the table from configured routes.
    pub fn new(configs: &[RouteConfig]) -> Self {
        Self {
            routes: configs.iter().map(Route::from).collect(),
        }
    }

    /// Resolve an inbound path to its route.
    ///
    /// Matching is exact, except that a single trailing slash is ignored.
    pub fn resolve(&self, path: &str) -> Result<&Route> {
        let normalized = if path.len() > 1 {
            path.strip_suffix('/').unwrap_or(path)
        } else {
            path
        };

        self.routes
            .iter()
            .find(|route| route.path == normalized)
            .ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })
    }

    /// All configured routes, in configuration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
