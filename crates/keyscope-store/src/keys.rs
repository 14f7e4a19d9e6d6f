//! Layout of keys in the persistence store.
//!
//! Everything lives under [`STORAGE_NAMESPACE`] so unrelated application
//! data sharing the store never collides with ours.  Connection ids are
//! escaped so a `:` inside an id can never extend another id's prefix.

use std::borrow::Cow;

use keyscope_shared::constants::STORAGE_NAMESPACE;
use keyscope_shared::ConnectionId;

/// Key segment for a connection id: `%` and `:` are percent-encoded.
fn id_segment(connection_id: &ConnectionId) -> Cow<'_, str> {
    let raw = connection_id.as_str();
    if !raw.contains(['%', ':']) {
        return Cow::Borrowed(raw);
    }
    Cow::Owned(raw.replace('%', "%25").replace(':', "%3A"))
}

pub fn namespace_prefix() -> String {
    format!("{STORAGE_NAMESPACE}:")
}

pub fn connections() -> String {
    format!("{STORAGE_NAMESPACE}:connections")
}

pub fn active_connection() -> String {
    format!("{STORAGE_NAMESPACE}:active_connection")
}

pub fn subscriptions(connection_id: &ConnectionId) -> String {
    format!("{STORAGE_NAMESPACE}:subscriptions:{}", id_segment(connection_id))
}

/// Prefix shared by every persisted message list of one connection.
pub fn messages_prefix(connection_id: &ConnectionId) -> String {
    format!("{STORAGE_NAMESPACE}:messages:{}:", id_segment(connection_id))
}

pub fn messages(connection_id: &ConnectionId, channel: &str) -> String {
    format!("{}{channel}", messages_prefix(connection_id))
}

pub fn ui(name: &str) -> String {
    format!("{STORAGE_NAMESPACE}:ui:{name}")
}
