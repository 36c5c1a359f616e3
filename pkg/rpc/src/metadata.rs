use std::collections::BTreeMap;

use common::errors::*;

/// A single metadata value: either a UTF-8 string (the common case) or an
/// opaque byte string (for keys ending in `-bin`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s.as_str()),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b.as_slice(),
        }
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Ascii(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Ascii(v.to_string())
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(v: Vec<u8>) -> Self {
        MetadataValue::Binary(v)
    }
}

fn is_binary_key(key: &str) -> bool {
    key.ends_with("-bin")
}

/// Keys that only the transport itself is allowed to set.
fn is_reserved_key(key: &str) -> bool {
    key.starts_with("grpc-")
        || key.starts_with(':')
        || key == "content-type"
        || key == "user-agent"
        || key == "te"
}

/// An ordered multimap of header values, keyed by lowercase ASCII key.
///
/// Iteration order is insertion order. Keys ending in `-bin` carry
/// opaque byte-string values; all other keys carry UTF-8 strings. Forbidden
/// keys (`grpc-*`, `:*`, `content-type`, `user-agent`, `te`) are rejected by
/// `set`/`append`.
///
/// A `Metadata` handed to the transport is logically moved: `freeze()`
/// flips an internal flag and further mutation attempts return an error
/// rather than silently doing nothing, so a bug where a caller keeps
/// mutating after send surfaces immediately instead of producing a
/// last-writer-wins race.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    // BTreeMap is used only to get a stable key ordering for iteration;
    // insertion order among the values for a single key is preserved by
    // the Vec underneath each entry.
    entries: BTreeMap<String, (usize, Vec<MetadataValue>)>,
    next_order: usize,
    frozen: bool,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize_key(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    fn check_settable(&self, key: &str) -> Result<()> {
        if self.frozen {
            return Err(err_msg("Metadata is frozen and can no longer be mutated"));
        }

        if is_reserved_key(key) {
            return Err(format_err!("Metadata key '{}' is reserved", key));
        }

        Ok(())
    }

    fn check_value(key: &str, value: &MetadataValue) -> Result<()> {
        match value {
            MetadataValue::Binary(_) => {
                if !is_binary_key(key) {
                    return Err(format_err!(
                        "Key '{}' does not end in '-bin' but was given a binary value",
                        key
                    ));
                }
            }
            MetadataValue::Ascii(_) => {
                if is_binary_key(key) {
                    return Err(format_err!(
                        "Key '{}' ends in '-bin' and requires a binary value",
                        key
                    ));
                }
            }
        }

        Ok(())
    }

    /// Replaces all values associated with `key`.
    pub fn set<K: Into<String>, V: Into<MetadataValue>>(&mut self, key: K, value: V) -> Result<()> {
        let key = Self::normalize_key(&key.into());
        self.check_settable(&key)?;

        let value = value.into();
        Self::check_value(&key, &value)?;

        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(key, (order, vec![value]));
        Ok(())
    }

    /// Like `set`, but skips the reserved-key check (`grpc-*`, `:*`,
    /// `content-type`, `user-agent`, `te`).
    ///
    /// Only transport implementations should call this: they sit below the
    /// layer `set`/`append` protect (e.g. encoding a deadline into
    /// `grpc-timeout`), so the restriction that keeps ordinary
    /// handler/middleware code from hand-writing protocol-owned headers does
    /// not apply to them.
    pub fn set_transport<K: Into<String>, V: Into<MetadataValue>>(&mut self, key: K, value: V) -> Result<()> {
        if self.frozen {
            return Err(err_msg("Metadata is frozen and can no longer be mutated"));
        }

        let key = Self::normalize_key(&key.into());
        let value = value.into();
        Self::check_value(&key, &value)?;

        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(key, (order, vec![value]));
        Ok(())
    }

    /// Replaces all values associated with `key` with the given sequence.
    pub fn set_all<K: Into<String>, V: Into<MetadataValue>, I: IntoIterator<Item = V>>(
        &mut self,
        key: K,
        values: I,
    ) -> Result<()> {
        let key = Self::normalize_key(&key.into());
        self.check_settable(&key)?;

        let mut out = vec![];
        for v in values {
            let v = v.into();
            Self::check_value(&key, &v)?;
            out.push(v);
        }

        if out.is_empty() {
            return Err(err_msg("Metadata values must be non-empty"));
        }

        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(key, (order, out));
        Ok(())
    }

    /// Appends a single value, preserving any existing values for `key`.
    pub fn append<K: Into<String>, V: Into<MetadataValue>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<()> {
        let key = Self::normalize_key(&key.into());
        self.check_settable(&key)?;

        let value = value.into();
        Self::check_value(&key, &value)?;

        match self.entries.get_mut(&key) {
            Some((_, values)) => values.push(value),
            None => {
                let order = self.next_order;
                self.next_order += 1;
                self.entries.insert(key, (order, vec![value]));
            }
        }

        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        let key = Self::normalize_key(key);
        self.entries.get(&key).and_then(|(_, v)| v.first())
    }

    pub fn get_all(&self, key: &str) -> &[MetadataValue] {
        let key = Self::normalize_key(key);
        match self.entries.get(&key) {
            Some((_, v)) => v.as_slice(),
            None => &[],
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(&Self::normalize_key(key))
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let key = Self::normalize_key(key);
        self.check_settable(&key)?;
        self.entries.remove(&key);
        Ok(())
    }

    /// Visits every (key, values) pair in insertion order.
    pub fn for_each<F: FnMut(&str, &[MetadataValue])>(&self, mut f: F) {
        let mut ordered: Vec<(&String, &(usize, Vec<MetadataValue>))> = self.entries.iter().collect();
        ordered.sort_by_key(|(_, (order, _))| *order);
        for (key, (_, values)) in ordered {
            f(key, values.as_slice());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Marks this instance as read-only. Called by the transport once the
    /// metadata has been handed off as a header/trailer frame.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Flattens to a list of wire-level (key, value) frame entries, emitting
    /// one entry per value rather than comma-joining multi-value keys —
    /// joining, if any, is the transport's concern.
    pub fn to_frame_entries(&self) -> Vec<(String, MetadataValue)> {
        let mut out = vec![];
        self.for_each(|key, values| {
            for value in values {
                out.push((key.to_string(), value.clone()));
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_keys() {
        let mut m = Metadata::new();
        assert!(m.set("grpc-status", "0").is_err());
        assert!(m.set("content-type", "application/grpc").is_err());
        assert!(m.set(":authority", "x").is_err());
    }

    #[test]
    fn binary_keys_require_binary_values() {
        let mut m = Metadata::new();
        assert!(m.set("trace-bin", "not binary").is_err());
        assert!(m.set("trace-bin", vec![1u8, 2, 3]).is_ok());
        assert!(m.set("trace", vec![1u8, 2, 3]).is_err());
    }

    #[test]
    fn preserves_insertion_order() {
        let mut m = Metadata::new();
        m.set("b", "2").unwrap();
        m.set("a", "1").unwrap();

        let mut seen = vec![];
        m.for_each(|k, _| seen.push(k.to_string()));
        assert_eq!(seen, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn append_preserves_multi_value_order() {
        let mut m = Metadata::new();
        m.append("test", "v1").unwrap();
        m.append("test", "v2").unwrap();

        let values = m.get_all("test");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].as_str(), Some("v1"));
        assert_eq!(values[1].as_str(), Some("v2"));
    }

    #[test]
    fn set_transport_bypasses_reserved_key_check() {
        let mut m = Metadata::new();
        assert!(m.set("grpc-timeout", "1S").is_err());
        assert!(m.set_transport("grpc-timeout", "1S").is_ok());
        assert_eq!(m.get("grpc-timeout").unwrap().as_str(), Some("1S"));
    }

    #[test]
    fn frozen_rejects_mutation() {
        let mut m = Metadata::new();
        m.set("a", "1").unwrap();
        m.freeze();
        assert!(m.set("b", "2").is_err());
        assert!(m.append("a", "2").is_err());
        assert!(m.delete("a").is_err());
    }
}
