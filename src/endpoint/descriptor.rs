//! Route descriptors as supplied by the host integration layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// HTTP method of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Trace,
}

impl HttpMethod {
    /// Canonical upper-case name, as used in fingerprints and changelogs.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "OPTIONS" => Ok(HttpMethod::Options),
            "TRACE" => Ok(HttpMethod::Trace),
            other => Err(format!("unknown HTTP method: {}", other)),
        }
    }
}

/// Where a declared parameter is bound from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterType {
    Body,
    Query,
    Model,
    Path,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::Body => "BODY",
            ParameterType::Query => "QUERY",
            ParameterType::Model => "MODEL",
            ParameterType::Path => "PATH",
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of an endpoint: two descriptors name the same endpoint
/// iff their keys are equal.
///
/// Field order gives the sort order used for fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub path: String,
    pub http_method: HttpMethod,
    pub signature: String,
}

impl EndpointKey {
    pub fn new(path: impl Into<String>, http_method: HttpMethod, signature: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            http_method,
            signature: signature.into(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.http_method, self.path, self.signature)
    }
}

/// Raw route metadata for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub path: String,
    pub http_method: HttpMethod,
    /// Stable signature string supplied by the host integration.
    pub signature: String,
    #[serde(default)]
    pub is_pattern_path: bool,
}

impl EndpointDescriptor {
    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.path.clone(), self.http_method, self.signature.clone())
    }
}

/// A parameter declared by a discovered route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredParameter {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub param_type: Option<ParameterType>,
}

/// A route as reported by the descriptor source: identity plus the
/// parameters and headers it declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    #[serde(flatten)]
    pub descriptor: EndpointDescriptor,
    #[serde(default)]
    pub parameters: Vec<DeclaredParameter>,
    #[serde(default)]
    pub headers: Vec<String>,
}

impl DiscoveredEndpoint {
    pub fn new(path: &str, http_method: HttpMethod, signature: &str) -> Self {
        Self {
            descriptor: EndpointDescriptor {
                path: path.to_string(),
                http_method,
                signature: signature.to_string(),
                is_pattern_path: false,
            },
            parameters: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Add a declared parameter.
    pub fn with_parameter(mut self, name: &str, param_type: Option<ParameterType>) -> Self {
        self.parameters.push(DeclaredParameter {
            name: name.to_string(),
            param_type,
        });
        self
    }

    /// Add a declared header.
    pub fn with_header(mut self, name: &str) -> Self {
        self.headers.push(name.to_string());
        self
    }

    /// Mark the path as a pattern (e.g. `/users/{id}`).
    pub fn pattern(mut self) -> Self {
        self.descriptor.is_pattern_path = true;
        self
    }

    pub fn key(&self) -> EndpointKey {
        self.descriptor.key()
    }
}
