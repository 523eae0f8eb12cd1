//! Test fixtures shared by the funclite integration tests.

use std::collections::HashMap;
use std::path::Path;

use funclite_shared::FunctionRequest;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// A package directory written to disk for one test.
///
/// The directory lives as long as this value; the digest is content-derived
/// so republished fixtures get distinct cache identities.
pub struct TestPackage {
    dir: TempDir,
    digest: String,
}

impl TestPackage {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Builder for tenant-package fixtures.
///
/// ```
/// use funclite_test_utils::PackageBuilder;
///
/// let package = PackageBuilder::new()
///     .file("index.js", "module.exports = (req, res) => res.send('ok');")
///     .build();
/// assert!(package.root().join("index.js").is_file());
/// ```
#[derive(Default)]
pub struct PackageBuilder {
    files: Vec<(String, Vec<u8>)>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file; parent directories are created on build.
    pub fn file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }

    /// Shorthand for the entry module.
    pub fn entry(self, source: impl Into<Vec<u8>>) -> Self {
        self.file("index.js", source)
    }

    pub fn build(mut self) -> TestPackage {
        let dir = TempDir::new().expect("failed to create package dir");
        self.files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (path, contents) in &self.files {
            let target = dir.path().join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).expect("failed to create package subdir");
            }
            std::fs::write(&target, contents).expect("failed to write package file");
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(contents);
        }
        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
        TestPackage { dir, digest }
    }
}

/// Builder for invocation requests in the front-door shape.
#[derive(Default)]
pub struct RequestBuilder {
    request: FunctionRequest,
}

impl RequestBuilder {
    pub fn new() -> Self {
        let mut request = FunctionRequest::default();
        request.method = "GET".into();
        request.url = "/".into();
        request.path = "/".into();
        request.protocol = "http".into();
        request.hostname = "localhost".into();
        request.ip = "127.0.0.1".into();
        Self { request }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.request.method = method.into();
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.request.body = body;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request
            .headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> FunctionRequest {
        self.request
    }
}

/// Environment maps without the `HashMap` ceremony.
pub fn env_vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_tracks_content() {
        let a = PackageBuilder::new().entry("module.exports = 1;").build();
        let b = PackageBuilder::new().entry("module.exports = 1;").build();
        let c = PackageBuilder::new().entry("module.exports = 2;").build();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn nested_files_are_written() {
        let package = PackageBuilder::new()
            .entry("module.exports = 1;")
            .file("lib/a/b.js", "module.exports = 2;")
            .build();
        assert!(package.root().join("lib/a/b.js").is_file());
    }
}
