use trellis_core::{GroupVersionKind, ObjectKey};

const OBJECTS_PREFIX: &str = "objects/";
const SNAPSHOTS_PREFIX: &str = "snapshots/";

/// Key encoder for storage keys
pub struct KeyEncoder;

impl KeyEncoder {
    /// Encode an object key: objects/{api_version}/{kind}/{namespace}/{name}
    pub fn encode_object_key(key: &ObjectKey) -> String {
        format!("{}{}", OBJECTS_PREFIX, key.storage_key())
    }

    /// Encode a prefix for scanning objects of a kind, optionally within a namespace
    pub fn encode_prefix(gvk: &GroupVersionKind, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}{}/{}/{}/", OBJECTS_PREFIX, gvk.api_version(), gvk.kind, ns),
            None => format!("{}{}/{}/", OBJECTS_PREFIX, gvk.api_version(), gvk.kind),
        }
    }

    /// Encode the prior-state snapshot key of a shoot
    pub fn encode_snapshot_key(shoot: &ObjectKey) -> String {
        format!("{}{}", SNAPSHOTS_PREFIX, shoot.storage_key())
    }

    /// Parse an object storage key back into (api_version, kind, namespace, name)
    ///
    /// The api_version of grouped kinds contains a slash, so parsing works
    /// from the right.
    pub fn parse_object_key(key: &str) -> Option<(String, String, Option<String>, String)> {
        let rest = key.strip_prefix(OBJECTS_PREFIX)?;
        let parts: Vec<&str> = rest.split('/').collect();

        match parts.as_slice() {
            [version, kind, name] => Some((version.to_string(), kind.to_string(), None, name.to_string())),
            [version, kind, ns, name] if !version.contains('.') => Some((
                version.to_string(),
                kind.to_string(),
                Some(ns.to_string()),
                name.to_string(),
            )),
            [group, version, kind, name] => Some((
                format!("{}/{}", group, version),
                kind.to_string(),
                None,
                name.to_string(),
            )),
            [group, version, kind, ns, name] => Some((
                format!("{}/{}", group, version),
                kind.to_string(),
                Some(ns.to_string()),
                name.to_string(),
            )),
            _ => None,
        }
    }
}
