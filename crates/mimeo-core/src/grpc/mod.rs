//! Raw byte-level gRPC proxying
//!
//! gRPC payloads are treated as opaque length-delimited frames: the
//! [`raw`] codec passes bytes through unmodified, so no protobuf schema
//! is ever needed. The [`router`] matches fully-qualified methods
//! against configured routes and dispatches to the record/forward
//! [`proxy`] or the [`mock`] handler.

pub mod mock;
pub mod proxy;
pub mod raw;
pub mod router;

pub use mock::GrpcMock;
pub use proxy::GrpcProxy;
pub use raw::{generate_request_id, is_likely_unary, RawCodec, RawMessage};
pub use router::{GrpcDestination, GrpcRoute, GrpcRouter};

use std::collections::BTreeMap;

use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};

/// Serialize ASCII metadata entries as a JSON `key -> [values]` object.
/// Binary-valued entries are skipped; they cannot round-trip through
/// the textual header store.
pub fn metadata_to_json(metadata: &MetadataMap) -> String {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in metadata.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry {
            if let Ok(value) = value.to_str() {
                map.entry(key.as_str().to_owned())
                    .or_default()
                    .push(value.to_owned());
            }
        }
    }
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_owned())
}

/// Rebuild a metadata map from its serialized form. Entries that are no
/// longer valid header names/values are dropped.
pub fn metadata_from_json(raw: &str) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    let Ok(map) = serde_json::from_str::<BTreeMap<String, Vec<String>>>(raw) else {
        return metadata;
    };
    for (key, values) in map {
        let Ok(key) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = AsciiMetadataValue::try_from(value.as_str()) {
                metadata.append(key.clone(), value);
            }
        }
    }
    metadata
}

/// Split `/package.Service/Method` into its service and method parts.
pub fn split_full_method(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    let service = parts.next().filter(|s| !s.is_empty())?;
    let method = parts.next().filter(|m| !m.is_empty() && !m.contains('/'))?;
    Some((service, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_through_json() {
        let mut metadata = MetadataMap::new();
        metadata.append("x-trace", AsciiMetadataValue::try_from("abc").unwrap());
        metadata.append("x-trace", AsciiMetadataValue::try_from("def").unwrap());
        metadata.insert("authority", AsciiMetadataValue::try_from("example").unwrap());

        let json = metadata_to_json(&metadata);
        let back = metadata_from_json(&json);
        let values: Vec<_> = back
            .get_all("x-trace")
            .iter()
            .map(|v| v.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(values, vec!["abc", "def"]);
        assert_eq!(back.get("authority").unwrap(), "example");
    }

    #[test]
    fn invalid_metadata_json_becomes_empty() {
        assert!(metadata_from_json("not json").iter().next().is_none());
    }

    #[test]
    fn full_method_splits_into_service_and_method() {
        assert_eq!(
            split_full_method("/com.example.userservice.UserService/GetUser"),
            Some(("com.example.userservice.UserService", "GetUser"))
        );
        assert_eq!(split_full_method("/missing-method"), None);
        assert_eq!(split_full_method("/a/b/c"), None);
        assert_eq!(split_full_method(""), None);
    }
}
