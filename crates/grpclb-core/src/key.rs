//! Registry key layout
//!
//! ```text
//! key    = "/" + SCHEMA + "/" + service_name + "/" + instance_address
//! prefix = "/" + SCHEMA + "/" + service_name + "/"
//! ```

/// Namespace shared by registrars and resolvers.
pub const SCHEMA: &str = "grpclb";

/// Key under which an instance announces itself.
pub fn registry_key(service_name: &str, address: &str) -> String {
    format!("{}{}", service_prefix(service_name), address)
}

/// Prefix watched by resolvers of a service.
pub fn service_prefix(service_name: &str) -> String {
    format!("/{}/{}/", SCHEMA, service_name)
}

/// Instance address carried by a key, if the key lives under `prefix`.
pub fn address_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|addr| !addr.is_empty())
}
