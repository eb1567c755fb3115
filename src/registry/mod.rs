//! Key & project registry.
//!
//! The registry maps opaque API tokens to projects. It is read-only from
//! the proxy's perspective; an external control plane provisions the
//! entries, and the proxy refreshes its snapshot out-of-band. Readers take
//! a shared snapshot and are never blocked by a refresh.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{ProjectSeed, RegistryConfig};

/// Plan tier. Supplies limit defaults when a project does not carry
/// explicit overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Starter,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
        }
    }

    /// Default monthly request limit for the tier.
    pub fn monthly_request_limit(&self) -> u64 {
        match self {
            Plan::Free => 50_000,
            Plan::Starter => 500_000,
            Plan::Pro => 5_000_000,
        }
    }

    /// Default per-minute request limit for the tier.
    pub fn per_minute_limit(&self) -> u32 {
        match self {
            Plan::Free => 60,
            Plan::Starter => 300,
            Plan::Pro => 1_000,
        }
    }
}

/// A project as seen by the proxy: immutable within a request.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub plan: Plan,
    pub monthly_request_limit: u64,
    pub per_minute_limit: u32,
    pub cache_ttl: Duration,
    pub similarity_threshold: f64,
    pub cache_enabled: bool,
    pub suspended: bool,
    /// Per-provider credentials; fall back to the statically configured
    /// provider keys when absent.
    pub credentials: HashMap<String, String>,
}

impl Project {
    fn from_seed(seed: &ProjectSeed, default_ttl_secs: u64, default_threshold: f64) -> Self {
        Self {
            id: seed.id.clone(),
            plan: seed.plan,
            monthly_request_limit: seed
                .monthly_request_limit
                .unwrap_or_else(|| seed.plan.monthly_request_limit()),
            per_minute_limit: seed
                .per_minute_limit
                .unwrap_or_else(|| seed.plan.per_minute_limit()),
            cache_ttl: Duration::from_secs(seed.cache_ttl_secs.unwrap_or(default_ttl_secs)),
            similarity_threshold: seed.similarity_threshold.unwrap_or(default_threshold),
            cache_enabled: seed.cache_enabled,
            suspended: seed.suspended,
            credentials: seed.credentials.clone(),
        }
    }

    /// Credential for a provider, if this project overrides it.
    pub fn credential(&self, provider: &str) -> Option<&str> {
        self.credentials.get(provider).map(String::as_str)
    }
}

/// Token-to-project lookup.
pub trait Registry: Send + Sync {
    /// Resolve an API token to its project. `None` means the token is
    /// unknown (401); a suspended project is returned as-is and refused
    /// by the auth layer (403).
    fn lookup(&self, token: &str) -> Option<Arc<Project>>;
}

/// Registry backed by a swappable in-memory snapshot.
///
/// `replace_all` installs a new table atomically; in-flight requests keep
/// the snapshot they already resolved.
pub struct StaticRegistry {
    by_token: RwLock<Arc<HashMap<String, Arc<Project>>>>,
}

impl StaticRegistry {
    pub fn new(
        config: &RegistryConfig,
        default_ttl_secs: u64,
        default_threshold: f64,
    ) -> Self {
        let registry = Self {
            by_token: RwLock::new(Arc::new(HashMap::new())),
        };
        registry.replace_all(&config.projects, default_ttl_secs, default_threshold);
        registry
    }

    /// Install a fresh project table. Called at startup and on refresh.
    pub fn replace_all(
        &self,
        seeds: &[ProjectSeed],
        default_ttl_secs: u64,
        default_threshold: f64,
    ) {
        let mut table = HashMap::with_capacity(seeds.len());
        for seed in seeds {
            let project = Project::from_seed(seed, default_ttl_secs, default_threshold);
            table.insert(seed.token.clone(), Arc::new(project));
        }
        tracing::debug!(projects = table.len(), "Registry snapshot installed");
        *self.by_token.write() = Arc::new(table);
    }

    pub fn len(&self) -> usize {
        self.by_token.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.read().is_empty()
    }
}

impl Registry for StaticRegistry {
    fn lookup(&self, token: &str) -> Option<Arc<Project>> {
        let snapshot = Arc::clone(&self.by_token.read());
        snapshot.get(token).cloned()
    }
}
