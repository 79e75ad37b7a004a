//! Deterministic, length-bounded resource names.
//!
//! All resources belonging to a cluster derive their names from the owner
//! name plus fixed suffixes, joined with `-`. Names must stay within the
//! Kubernetes resource-name bound, so the owner name is truncated when a
//! combination would exceed it; suffixes are never cut, because consumers
//! match on them.

use tracing::error;

/// Maximum length of the names we generate (RFC 1035 label bound).
pub const MAX_NAME_LENGTH: usize = 63;

/// Produces suffixed resource names for one kind of owner.
///
/// For a given `(namer, owner_name, suffixes)` input the output is
/// deterministic. Fixed (default) suffixes are validated at construction
/// time: a namer whose fixed suffixes already exceed the suffix budget is a
/// configuration bug and panics immediately, so requests never have to.
#[derive(Clone, Debug)]
pub struct Namer {
    max_suffix_length: usize,
    default_suffixes: Vec<String>,
}

impl Namer {
    /// Creates a namer reserving at most `max_suffix_length` characters for
    /// suffixes (separators included).
    ///
    /// Panics when the budget leaves no room for an owner name.
    pub fn new(max_suffix_length: usize) -> Self {
        assert!(
            max_suffix_length < MAX_NAME_LENGTH,
            "suffix budget {max_suffix_length} leaves no room for an owner name \
             (maximum name length is {MAX_NAME_LENGTH})"
        );

        Self {
            max_suffix_length,
            default_suffixes: Vec::new(),
        }
    }

    /// Adds suffixes appended to every generated name, before the
    /// per-request ones.
    ///
    /// Panics when the fixed suffixes alone exceed the suffix budget.
    pub fn with_default_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_suffixes = suffixes.into_iter().map(Into::into).collect();

        let fixed_length: usize = self
            .default_suffixes
            .iter()
            .map(|suffix| suffix.len() + 1)
            .sum();
        assert!(
            fixed_length <= self.max_suffix_length,
            "fixed suffixes {:?} exceed the suffix budget of {} characters",
            self.default_suffixes,
            self.max_suffix_length
        );

        self
    }

    /// Builds `<owner>-<suffix>-...-<suffix>`, truncating the owner name so
    /// the result stays within [`MAX_NAME_LENGTH`].
    pub fn suffix(&self, owner_name: &str, suffixes: &[&str]) -> String {
        let mut suffix = String::new();
        for part in self
            .default_suffixes
            .iter()
            .map(String::as_str)
            .chain(suffixes.iter().copied())
        {
            suffix.push('-');
            suffix.push_str(part);
        }

        if suffix.len() > self.max_suffix_length {
            // Fixed suffixes are checked at construction time, so only
            // request-time suffixes can get us here. The suffix must stay
            // intact, the owner prefix pays the price.
            error!(
                %suffix,
                budget = self.max_suffix_length,
                "resource name suffixes exceed the configured budget"
            );
        }

        let max_owner_length = MAX_NAME_LENGTH.saturating_sub(suffix.len());
        let owner: String = owner_name.chars().take(max_owner_length).collect();

        format!("{owner}{suffix}")
    }
}

/// Namer used for all Elasticsearch cluster resources.
pub fn es_namer() -> Namer {
    Namer::new(36)
}

/// `<owner>-<role>-ca-internal`, the secret holding a role's CA material.
pub fn ca_internal_secret_name(namer: &Namer, owner_name: &str, role: &str) -> String {
    namer.suffix(owner_name, &[role, "ca-internal"])
}

/// `<owner>-http-certs-public`, the secret publishing the HTTP CA
/// certificate for clients.
pub fn http_public_certs_secret_name(namer: &Namer, owner_name: &str) -> String {
    namer.suffix(owner_name, &["http-certs-public"])
}

/// `<pod>-certs`, the per-pod node certificate secret.
pub fn node_certificate_secret_name(namer: &Namer, pod_name: &str) -> String {
    namer.suffix(pod_name, &["certs"])
}

/// `<owner>-es`, the cluster's external service.
pub fn external_service_name(namer: &Namer, owner_name: &str) -> String {
    namer.suffix(owner_name, &["es"])
}
