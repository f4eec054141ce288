//! Tag registry for JSON-addressable dynamic fields.
//!
//! Field names appearing in document tails are interned into small tag
//! ids; a dotted path becomes a [`TagsPath`]. The registry is versioned
//! and persisted with the namespace so stored documents keep decoding
//! after a restart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use memdb_types::TagsPath;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagsMatcher {
    names: Vec<String>,
    #[serde(skip)]
    by_name: HashMap<String, u32>,
    version: u32,
}

impl TagsMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Intern a single name, registering it on first sight.
    pub fn name_to_tag(&mut self, name: &str) -> u32 {
        if let Some(&tag) = self.by_name.get(name) {
            return tag;
        }
        let tag = self.names.len() as u32;
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), tag);
        self.version += 1;
        tag
    }

    pub fn tag_to_name(&self, tag: u32) -> Option<&str> {
        self.names.get(tag as usize).map(|s| s.as_str())
    }

    /// Resolve a dotted path, registering unknown segments.
    pub fn path_to_tags(&mut self, path: &str) -> TagsPath {
        path.split('.').map(|seg| self.name_to_tag(seg)).collect()
    }

    /// Resolve a dotted path without registering anything.
    pub fn lookup_path(&self, path: &str) -> Option<TagsPath> {
        path.split('.')
            .map(|seg| self.by_name.get(seg).copied())
            .collect()
    }

    /// Walk a JSON value along a tag path.
    pub fn extract<'a>(
        &self,
        root: &'a serde_json::Value,
        path: &TagsPath,
    ) -> Option<&'a serde_json::Value> {
        let mut cur = root;
        for &tag in path {
            let name = self.tag_to_name(tag)?;
            cur = cur.get(name)?;
        }
        Some(cur)
    }

    /// Rebuild the name lookup after deserialization.
    pub fn rebuild(&mut self) {
        self.by_name = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_stable() {
        let mut tm = TagsMatcher::new();
        let a = tm.name_to_tag("color");
        let b = tm.name_to_tag("size");
        assert_eq!(tm.name_to_tag("color"), a);
        assert_ne!(a, b);
        assert_eq!(tm.tag_to_name(a), Some("color"));
    }

    #[test]
    fn test_path_extract() {
        let mut tm = TagsMatcher::new();
        let path = tm.path_to_tags("specs.weight");
        let doc = serde_json::json!({"specs": {"weight": 12}});
        assert_eq!(tm.extract(&doc, &path), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut tm = TagsMatcher::new();
        tm.path_to_tags("a.b.c");
        let json = serde_json::to_string(&tm).unwrap();
        let mut back: TagsMatcher = serde_json::from_str(&json).unwrap();
        back.rebuild();
        assert_eq!(back.lookup_path("a.b"), tm.lookup_path("a.b"));
    }
}
