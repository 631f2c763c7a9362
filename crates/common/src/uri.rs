//! Stable artifact identifier derivation
//!
//! Package URLs for container images and SPDX-style git URIs, used
//! consistently by the extractor and the storage backends.

use crate::{Error, Result};

/// Registry implied when an image reference names none.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// A parsed container image id `[scheme://]repo@alg:hex`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageId {
    pub repository: String,
    pub algorithm: String,
    pub hex: String,
}

impl ImageId {
    /// Parse an image id by stripping the scheme, splitting repository from
    /// digest, then algorithm from hex.
    pub fn parse(image_id: &str) -> Result<Self> {
        let without_scheme = match image_id.split_once("//") {
            Some((_, rest)) => rest,
            None => image_id,
        };
        let (repository, digest) = without_scheme
            .split_once('@')
            .ok_or_else(|| Error::MalformedInput(format!("image id without digest: {image_id}")))?;
        let (algorithm, hex) = parse_digest(digest)?;
        if repository.is_empty() {
            return Err(Error::MalformedInput(format!(
                "image id without repository: {image_id}"
            )));
        }
        Ok(Self {
            repository: repository.to_string(),
            algorithm,
            hex,
        })
    }

    /// Reference form `<repo>@<alg>:<hex>` used by OCI storage.
    pub fn reference(&self) -> String {
        format!("{}@{}:{}", self.repository, self.algorithm, self.hex)
    }

    /// Material URI form `oci://<repo>`.
    pub fn oci_uri(&self) -> String {
        format!("oci://{}", self.repository)
    }

    /// Package-URL form, appending the registry only when it is not the
    /// implicit default.
    pub fn purl(&self) -> String {
        image_purl(&self.repository, &self.algorithm, &self.hex)
    }
}

/// Parse `alg:hex`, tolerating a trailing whitespace-separated file path.
pub fn parse_digest(digest: &str) -> Result<(String, String)> {
    let head = digest
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::MalformedInput("empty digest".to_string()))?;
    let (alg, hex) = head
        .split_once(':')
        .ok_or_else(|| Error::MalformedInput(format!("digest without algorithm: {digest}")))?;
    if alg.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::MalformedInput(format!("invalid digest: {digest}")));
    }
    Ok((alg.to_string(), hex.to_string()))
}

/// Whether the first path segment of an image reference names a registry.
fn is_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Compute the package URL `pkg:docker/<repo>@<alg>:<hex>` for an image.
///
/// A leading registry matching the default is stripped; any other registry
/// moves into the `repository_url` qualifier.
pub fn image_purl(repository: &str, algorithm: &str, hex: &str) -> String {
    match repository.split_once('/') {
        Some((first, rest)) if is_registry(first) => {
            if first == DEFAULT_REGISTRY {
                format!("pkg:docker/{rest}@{algorithm}:{hex}")
            } else {
                format!("pkg:docker/{rest}@{algorithm}:{hex}?repository_url={first}")
            }
        }
        _ => format!("pkg:docker/{repository}@{algorithm}:{hex}"),
    }
}

/// Normalize a git source URL into the `git+<url>.git` dependency form.
pub fn git_dependency_uri(url: &str) -> String {
    let mut uri = if url.starts_with("git+") {
        url.to_string()
    } else {
        format!("git+{url}")
    };
    if !uri.ends_with(".git") {
        uri.push_str(".git");
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_image_id_with_scheme() {
        let id = ImageId::parse("docker://docker.io/library/base@sha256:0a1b2c").unwrap();
        assert_eq!(id.repository, "docker.io/library/base");
        assert_eq!(id.algorithm, "sha256");
        assert_eq!(id.hex, "0a1b2c");
        assert_eq!(id.reference(), "docker.io/library/base@sha256:0a1b2c");
    }

    #[test]
    fn parse_image_id_rejects_malformed() {
        assert!(ImageId::parse("no-digest-here").is_err());
        assert!(ImageId::parse("repo@not-a-digest").is_err());
        assert!(ImageId::parse("@sha256:abcd").is_err());
    }

    #[test]
    fn digest_trailing_path_ignored() {
        let (alg, hex) = parse_digest("sha256:deadbeef  /workspace/out.txt").unwrap();
        assert_eq!(alg, "sha256");
        assert_eq!(hex, "deadbeef");
    }

    #[test]
    fn purl_default_registry_stripped() {
        assert_eq!(
            image_purl("index.docker.io/library/img", "sha256", "aa"),
            "pkg:docker/library/img@sha256:aa"
        );
    }

    #[test]
    fn purl_custom_registry_becomes_qualifier() {
        assert_eq!(
            image_purl("reg.example/team/img", "sha256", "aa"),
            "pkg:docker/team/img@sha256:aa?repository_url=reg.example"
        );
    }

    #[test]
    fn purl_bare_repository() {
        assert_eq!(
            image_purl("team/img", "sha256", "aa"),
            "pkg:docker/team/img@sha256:aa"
        );
    }

    #[test]
    fn image_id_round_trip() {
        let original = "reg.example/team/img@sha256:00ff";
        let id = ImageId::parse(&format!("docker://{original}")).unwrap();
        assert_eq!(id.reference(), original);
    }

    #[test]
    fn git_uri_normalization() {
        assert_eq!(
            git_dependency_uri("https://git.x/y"),
            "git+https://git.x/y.git"
        );
        assert_eq!(
            git_dependency_uri("git+https://git.x/y.git"),
            "git+https://git.x/y.git"
        );
    }
}
