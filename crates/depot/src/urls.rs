//! URL generation for depot resources.
//!
//! Routing lives outside the depot; everything that needs to hand a URL
//! back to a client goes through a [`UrlGenerator`].

use manifest::Digest;

/// Builds the URLs the depot hands back to clients.
pub trait UrlGenerator: Send + Sync {
    /// Location of a sandbox record.
    fn sandbox(&self, guid: &str) -> String;

    /// Upload target for one digest of a sandbox.
    fn sandbox_checksum(&self, guid: &str, digest: &Digest) -> String;

    /// Download location of one cookbook file.
    fn cookbook_file(&self, cookbook: &str, version: &str, digest: &Digest) -> String;

    /// Location of a node record.
    fn node(&self, name: &str) -> String;
}

/// REST-style URLs below a base address.
#[derive(Debug, Clone)]
pub struct BaseUrl {
    base: String,
}

impl BaseUrl {
    /// Generator rooted at `base` (trailing slashes are ignored).
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    /// The base address.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Split a cookbook file URL back into `(cookbook, version, digest)`.
    ///
    /// Accepts anything ending in `cookbooks/{name}/{version}/files/{digest}`.
    pub fn parse_cookbook_file(url: &str) -> Option<(String, String, Digest)> {
        let parts: Vec<&str> = url.trim_end_matches('/').rsplit('/').take(5).collect();
        match parts.as_slice() {
            [digest, "files", version, name, "cookbooks"] => Some((
                (*name).to_string(),
                (*version).to_string(),
                Digest::new(*digest),
            )),
            _ => None,
        }
    }
}

impl UrlGenerator for BaseUrl {
    fn sandbox(&self, guid: &str) -> String {
        format!("{}/sandboxes/{guid}", self.base)
    }

    fn sandbox_checksum(&self, guid: &str, digest: &Digest) -> String {
        format!("{}/sandboxes/{guid}/{digest}", self.base)
    }

    fn cookbook_file(&self, cookbook: &str, version: &str, digest: &Digest) -> String {
        format!("{}/cookbooks/{cookbook}/{version}/files/{digest}", self.base)
    }

    fn node(&self, name: &str) -> String {
        format!("{}/nodes/{name}", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let urls = BaseUrl::new("http://depot:4000/");
        let digest = Digest::new("abc123");
        assert_eq!(urls.sandbox("g1"), "http://depot:4000/sandboxes/g1");
        assert_eq!(
            urls.sandbox_checksum("g1", &digest),
            "http://depot:4000/sandboxes/g1/abc123"
        );
        assert_eq!(
            urls.cookbook_file("apache2", "1.0.0", &digest),
            "http://depot:4000/cookbooks/apache2/1.0.0/files/abc123"
        );
    }

    #[test]
    fn test_parse_cookbook_file() {
        let urls = BaseUrl::new("local://depot");
        let url = urls.cookbook_file("apache2", "1.0.0", &Digest::new("abc"));
        assert_eq!(
            BaseUrl::parse_cookbook_file(&url),
            Some(("apache2".into(), "1.0.0".into(), Digest::new("abc")))
        );
        assert_eq!(BaseUrl::parse_cookbook_file("local://depot/nodes/web1"), None);
    }
}
