#![forbid(unsafe_code)]

//! Process and request level guards.

use anyhow::{Result, bail};
use axum::http::HeaderMap;
use nix::unistd::Uid;

/// Header a fronting API gateway uses to prove requests came through it.
pub const PROXY_SECRET_HEADER: &str = "x-rapidapi-proxy-secret";

/// Fails fast when a binary is started as root. The service only needs to
/// write its own database files, so there is never a reason to run it
/// privileged.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; please use an unprivileged service account");
    }
    Ok(())
}

/// Optional shared secret. With no secret configured every request passes.
#[derive(Clone, Default)]
pub struct ProxySecret {
    digest: Option<blake3::Hash>,
}

impl ProxySecret {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            digest: secret
                .filter(|value| !value.is_empty())
                .map(|value| blake3::hash(value.as_bytes())),
        }
    }

    pub fn is_open(&self) -> bool {
        self.digest.is_none()
    }

    /// `blake3::Hash` equality is constant time, so comparing digests does not
    /// leak how much of the secret matched.
    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.digest else {
            return true;
        };

        headers
            .get(PROXY_SECRET_HEADER)
            .map(|value| blake3::hash(value.as_bytes()) == *expected)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ProxySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySecret")
            .field("configured", &!self.is_open())
            .finish()
    }
}
