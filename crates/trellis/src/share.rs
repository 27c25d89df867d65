use std::collections::HashMap;

/// Request/response metadata carried alongside every call.
pub type Metadata = HashMap<String, String>;

/// Metadata key carrying the bearer token injected by [`crate::XClient::auth`].
pub const AUTH_KEY: &str = "_auth";

/// Metadata key carrying the error message on an `Error`-status response.
pub const ERROR_KEY: &str = "_error";

/// Metadata key carrying the symbolic error kind on an `Error`-status response.
pub const ERROR_KIND_KEY: &str = "_kind";

/// Splits a server key of the form `network@host:port` into its parts.
///
/// A bare address without `@` defaults to `tcp`.
pub fn split_network_and_address(server: &str) -> (&str, &str) {
    match server.split_once('@') {
        Some((network, address)) => (network, address),
        None => ("tcp", server),
    }
}

/// Joins a network and address back into the `network@address` key form.
pub fn server_key(network: &str, address: &str) -> String {
    format!("{network}@{address}")
}
