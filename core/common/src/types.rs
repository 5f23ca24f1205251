//! Common types used throughout Strata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a logical (failover) storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageName(String);

impl StorageName {
    /// Create a new StorageName from a string.
    ///
    /// # Errors
    /// - Returns error if the name is empty or only whitespace
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::Error::Configuration(
                "Storage name cannot be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for StorageName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<StorageName> for String {
    fn from(name: StorageName) -> Self {
        name.0
    }
}

/// A path within a storage, independent of the backend holding it.
///
/// Paths are always absolute and normalized: `"a/b"`, `"/a/b"` and
/// `"/a/b/"` all designate the same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoragePath {
    components: Vec<String>,
}

impl StoragePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if a component is empty, `.`/`..`, or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            Self::check_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into StoragePath.
    ///
    /// Uses '/' as separator. Repeated separators are collapsed.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    fn check_component(comp: &str) -> crate::Result<()> {
        if comp.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Path component cannot be empty".to_string(),
            ));
        }
        if comp == "." || comp == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Path component cannot be \"{}\"",
                comp
            )));
        }
        if comp.contains('/') || comp.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Path component cannot contain separators".to_string(),
            ));
        }
        Ok(())
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        Self::check_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Whether `self` is `other` or lies below it.
    pub fn starts_with(&self, other: &StoragePath) -> bool {
        self.components.starts_with(&other.components)
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_storage_name_creation() {
        let name = StorageName::new("default").unwrap();
        assert_eq!(name.as_str(), "default");
    }

    #[test]
    fn test_storage_name_empty_fails() {
        assert!(StorageName::new("").is_err());
        assert!(StorageName::new("  ").is_err());
    }

    #[test]
    fn test_storage_name_deserialization_validates() {
        let name: StorageName = serde_json::from_str("\"media\"").unwrap();
        assert_eq!(name.as_str(), "media");
        assert!(serde_json::from_str::<StorageName>("\"\"").is_err());
    }

    #[test]
    fn test_storage_path_root() {
        let path = StoragePath::root();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
        assert!(StoragePath::parse("").unwrap().is_root());
        assert!(StoragePath::parse("/").unwrap().is_root());
    }

    #[test]
    fn test_storage_path_parse_normalizes() {
        let path = StoragePath::parse("foo//bar/baz/").unwrap();
        assert_eq!(path.components(), &["foo", "bar", "baz"]);
        assert_eq!(path.to_string_path(), "/foo/bar/baz");
        assert_eq!(path, StoragePath::parse("/foo/bar/baz").unwrap());
    }

    #[test]
    fn test_storage_path_rejects_traversal() {
        assert!(StoragePath::parse("/foo/../bar").is_err());
        assert!(StoragePath::parse("./foo").is_err());
    }

    #[test]
    fn test_storage_path_join_and_parent() {
        let path = StoragePath::root().join("foo").unwrap().join("bar").unwrap();
        assert_eq!(path.to_string_path(), "/foo/bar");
        assert_eq!(path.parent().unwrap().to_string_path(), "/foo");
        assert_eq!(path.name(), Some("bar"));
        assert!(path.join("a/b").is_err());
    }

    #[test]
    fn test_storage_path_starts_with() {
        let dir = StoragePath::parse("/foo").unwrap();
        assert!(StoragePath::parse("/foo/bar").unwrap().starts_with(&dir));
        assert!(!StoragePath::parse("/foobar").unwrap().starts_with(&dir));
        assert!(dir.starts_with(&StoragePath::root()));
    }

    proptest! {
        #[test]
        fn test_storage_path_display_reparses(parts in proptest::collection::vec("[a-z0-9_.-]{1,8}", 0..5)) {
            prop_assume!(parts.iter().all(|p| p != "." && p != ".."));
            let path = StoragePath::from_components(parts).unwrap();
            prop_assert_eq!(StoragePath::parse(&path.to_string_path()).unwrap(), path);
        }
    }
}
