//! Order-independent fingerprint of a discovered route set.
//!
//! The fingerprint only answers "did anything change since the last run".
//! Individual endpoints are always identified by their [`EndpointKey`].
//!
//! [`EndpointKey`]: crate::endpoint::EndpointKey

use sha2::{Digest, Sha256};

use crate::endpoint::DiscoveredEndpoint;

/// Separates fields inside one endpoint's record.
const FIELD_DELIMITER: &str = " : ";
/// Terminates one endpoint's record.
const RECORD_DELIMITER: &str = "\n";

/// Compute the hex SHA-256 fingerprint of a route set.
///
/// Endpoints are sorted by (path, method, signature) and each endpoint's
/// parameters (name, then type) and headers (name) are sorted before being
/// folded in, so discovery order never affects the result.
pub fn fingerprint(endpoints: &[DiscoveredEndpoint]) -> String {
    let mut sorted: Vec<&DiscoveredEndpoint> = endpoints.iter().collect();
    sorted.sort_by(|a, b| a.key().cmp(&b.key()));

    let mut hasher = Sha256::new();
    for endpoint in sorted {
        hasher.update(canonical_record(endpoint).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn canonical_record(endpoint: &DiscoveredEndpoint) -> String {
    let descriptor = &endpoint.descriptor;
    let mut record = String::new();
    record.push_str(&descriptor.path);
    record.push_str(FIELD_DELIMITER);
    record.push_str(descriptor.http_method.as_str());
    record.push_str(FIELD_DELIMITER);
    record.push_str(&descriptor.signature);

    let mut parameters: Vec<(&str, &str)> = endpoint
        .parameters
        .iter()
        .map(|p| (p.name.as_str(), p.param_type.map(|t| t.as_str()).unwrap_or("")))
        .collect();
    parameters.sort();
    for (name, param_type) in parameters {
        record.push_str(FIELD_DELIMITER);
        record.push_str("p=");
        record.push_str(name);
        record.push('/');
        record.push_str(param_type);
    }

    let mut headers: Vec<&str> = endpoint.headers.iter().map(String::as_str).collect();
    headers.sort();
    for name in headers {
        record.push_str(FIELD_DELIMITER);
        record.push_str("h=");
        record.push_str(name);
    }

    record.push_str(RECORD_DELIMITER);
    record
}
