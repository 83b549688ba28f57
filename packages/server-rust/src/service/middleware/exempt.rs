//! Infrastructure paths excluded from span and metric volume.

use std::sync::Arc;

/// Probe, scrape and browser-noise prefixes exempted by default.
pub const DEFAULT_EXEMPT_PREFIXES: &[&str] = &[
    "/health",
    "/healthz",
    "/ready",
    "/readyz",
    "/livez",
    "/readiness",
    "/liveness",
    "/metrics",
    "/favicon.ico",
];

/// Prefix set shared by the trace and metrics stages.
#[derive(Debug, Clone)]
pub struct ExemptPaths {
    prefixes: Arc<[String]>,
}

impl Default for ExemptPaths {
    fn default() -> Self {
        Self::from_prefixes(DEFAULT_EXEMPT_PREFIXES.iter().copied())
    }
}

impl ExemptPaths {
    pub fn from_prefixes<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Default set plus `path`, used for a non-default metrics path.
    #[must_use]
    pub fn with(self, path: &str) -> Self {
        if path.is_empty() || self.prefixes.iter().any(|p| p == path) {
            return self;
        }
        let mut prefixes = self.prefixes.to_vec();
        prefixes.push(path.to_string());
        Self {
            prefixes: prefixes.into(),
        }
    }

    #[must_use]
    pub fn is_exempt(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefixes_match_probes() {
        let exempt = ExemptPaths::default();
        for path in ["/health", "/healthz", "/ready", "/metrics", "/favicon.ico", "/livez"] {
            assert!(exempt.is_exempt(path), "{path}");
        }
        assert!(!exempt.is_exempt("/api/v1/users/profile"));
        assert!(!exempt.is_exempt("/"));
    }

    #[test]
    fn custom_metrics_path_added_once() {
        let exempt = ExemptPaths::default().with("/internal/prom").with("/internal/prom");
        assert!(exempt.is_exempt("/internal/prom"));
        assert_eq!(exempt.prefixes.len(), DEFAULT_EXEMPT_PREFIXES.len() + 1);
    }
}
