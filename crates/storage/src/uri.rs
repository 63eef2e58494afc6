//! Bucket-scoped object URI parsing and validation.

use core::fmt;
use core::str::FromStr;

use object_store::path::Path as ObjectPath;

use crate::StorageError;

/// An opaque object location of the form `<scheme>://<bucket>/<path>`.
///
/// Path segments are validated on parse: traversal segments (`.`/`..`) and
/// empty segments are rejected so a stored URI can never escape its bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    scheme: String,
    bucket: String,
    path: String,
}

impl ObjectUri {
    /// Builds a URI from parts, validating the path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUri` if any part is empty or the path contains
    /// traversal or empty segments.
    pub fn new(scheme: &str, bucket: &str, path: &str) -> Result<Self, StorageError> {
        if scheme.is_empty() || bucket.is_empty() || path.is_empty() {
            return Err(StorageError::InvalidUri(format!(
                "{scheme}://{bucket}/{path}"
            )));
        }
        validate_path(path)?;
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path as an `object_store` path.
    #[must_use]
    pub fn object_path(&self) -> ObjectPath {
        ObjectPath::from(self.path.as_str())
    }

    /// Final path segment, e.g. a file name.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

fn validate_path(path: &str) -> Result<(), StorageError> {
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::InvalidUri(format!(
                "path contains an illegal segment: {path}"
            )));
        }
    }
    Ok(())
}

impl FromStr for ObjectUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;
        let (bucket, path) = rest
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;
        Self::new(scheme, bucket, path)
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let uri: ObjectUri = "s3://artifacts/raw/flowers.zip".parse().unwrap();
        assert_eq!(uri.scheme(), "s3");
        assert_eq!(uri.bucket(), "artifacts");
        assert_eq!(uri.path(), "raw/flowers.zip");
        assert_eq!(uri.file_name(), "flowers.zip");
        assert_eq!(uri.to_string(), "s3://artifacts/raw/flowers.zip");
    }

    #[test]
    fn test_rejects_missing_scheme_or_path() {
        assert!("artifacts/raw/x.zip".parse::<ObjectUri>().is_err());
        assert!("s3://artifacts".parse::<ObjectUri>().is_err());
        assert!("s3:///raw/x.zip".parse::<ObjectUri>().is_err());
    }

    #[test]
    fn test_rejects_traversal_segments() {
        assert!("s3://artifacts/raw/../secrets".parse::<ObjectUri>().is_err());
        assert!("s3://artifacts/./x".parse::<ObjectUri>().is_err());
        assert!("s3://artifacts/raw//x".parse::<ObjectUri>().is_err());
    }
}
