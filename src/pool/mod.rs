//! Live upstream pool: the ordered endpoint list, the user pin, and the
//! per-endpoint transient health state used for failover cool-downs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Base cool-down applied after a transient failure.
pub const COOLDOWN_BASE: Duration = Duration::from_secs(60);
/// Upper bound on the exponential back-off.
pub const COOLDOWN_CAP: Duration = Duration::from_secs(600);

/// Wire protocol an upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Claude,
    Openai,
    Gemini,
}

impl UpstreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamKind::Claude => "claude",
            UpstreamKind::Openai => "openai",
            UpstreamKind::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured upstream provider. Immutable once inside the pool; a
/// config change replaces the whole list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Upstream {
    pub name: String,
    pub host: String,
    pub api_key: String,
    pub kind: UpstreamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub remark: String,
}

/// Strip any scheme prefix and trailing slash so `host` is a bare authority.
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool: {0}")]
    InvalidPool(String),
    #[error("no such upstream: {0}")]
    NoSuchUpstream(String),
}

#[derive(Debug, Default, Clone)]
struct Health {
    disabled_until: Option<Instant>,
    consecutive_failures: u32,
}

struct PoolInner {
    upstreams: Vec<Arc<Upstream>>,
    pinned: Option<String>,
    health: HashMap<String, Health>,
}

/// The live, hot-swappable upstream pool.
///
/// Readers take a snapshot under the read lock and never hold it across
/// network I/O; `replace` installs a new list atomically and in-flight
/// requests keep whatever snapshot they captured.
pub struct EndpointPool {
    inner: RwLock<PoolInner>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                upstreams: Vec::new(),
                pinned: None,
                health: HashMap::new(),
            }),
        }
    }

    /// Atomically substitute the ordered upstream list.
    ///
    /// Rejects duplicate or empty names and non-Claude upstreams without a
    /// default model. On success the health map is pruned to the new name
    /// set and a pin whose target vanished or was disabled is cleared.
    pub fn replace(&self, list: Vec<Upstream>) -> Result<(), PoolError> {
        validate(&list)?;

        let upstreams: Vec<Arc<Upstream>> = list
            .into_iter()
            .map(|mut u| {
                u.host = normalize_host(&u.host);
                Arc::new(u)
            })
            .collect();

        let mut inner = self.inner.write().unwrap();
        inner
            .health
            .retain(|name, _| upstreams.iter().any(|u| u.name == *name));

        if let Some(pinned) = inner.pinned.clone() {
            let still_valid = upstreams.iter().any(|u| u.name == pinned && u.enabled);
            if !still_valid {
                tracing::info!(upstream = %pinned, "pin cleared by pool replacement");
                inner.pinned = None;
            }
        }

        inner.upstreams = upstreams;
        Ok(())
    }

    /// Upstreams eligible for routing, in priority order: enabled and not in
    /// an active cool-down.
    pub fn eligible(&self) -> Vec<Arc<Upstream>> {
        let now = Instant::now();
        let inner = self.inner.read().unwrap();
        inner
            .upstreams
            .iter()
            .filter(|u| u.enabled && !in_cooldown(&inner.health, &u.name, now))
            .cloned()
            .collect()
    }

    /// Attempt order for one request: the pinned upstream first when it is
    /// eligible, then the rest by priority.
    pub fn attempt_order(&self) -> Vec<Arc<Upstream>> {
        let mut attempts = self.eligible();
        let pinned = self.inner.read().unwrap().pinned.clone();
        if let Some(pinned) = pinned {
            if let Some(pos) = attempts.iter().position(|u| u.name == pinned) {
                let upstream = attempts.remove(pos);
                attempts.insert(0, upstream);
            }
        }
        attempts
    }

    /// Put an upstream into cool-down after a transient failure. Back-to-back
    /// failures double the cool-down up to the cap. Returns the applied
    /// duration.
    pub fn mark_failed(&self, name: &str) -> Duration {
        let mut inner = self.inner.write().unwrap();
        let health = inner.health.entry(name.to_string()).or_default();
        let cooldown = COOLDOWN_BASE
            .saturating_mul(1u32 << health.consecutive_failures.min(4))
            .min(COOLDOWN_CAP);
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.disabled_until = Some(Instant::now() + cooldown);
        tracing::warn!(upstream = name, cooldown_secs = cooldown.as_secs(), "upstream in cool-down");
        cooldown
    }

    /// Clear the cool-down and the failure streak after a success.
    pub fn mark_ok(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(health) = inner.health.get_mut(name) {
            health.disabled_until = None;
            health.consecutive_failures = 0;
        }
    }

    /// Pin a preferred upstream by name. The target must exist and be
    /// user-enabled.
    pub fn pin(&self, name: &str) -> Result<(), PoolError> {
        let mut inner = self.inner.write().unwrap();
        let exists = inner.upstreams.iter().any(|u| u.name == name && u.enabled);
        if !exists {
            return Err(PoolError::NoSuchUpstream(name.to_string()));
        }
        inner.pinned = Some(name.to_string());
        Ok(())
    }

    pub fn clear_pin(&self) {
        self.inner.write().unwrap().pinned = None;
    }

    /// The upstream a fresh request would hit first: the pin while it is
    /// eligible, otherwise the head of the eligible list.
    pub fn current(&self) -> Option<Arc<Upstream>> {
        self.attempt_order().into_iter().next()
    }

    /// Name of the current upstream, for display surfaces.
    pub fn current_name(&self) -> Option<String> {
        self.current().map(|u| u.name.clone())
    }
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}

fn in_cooldown(health: &HashMap<String, Health>, name: &str, now: Instant) -> bool {
    health
        .get(name)
        .and_then(|h| h.disabled_until)
        .map(|until| now < until)
        .unwrap_or(false)
}

fn validate(list: &[Upstream]) -> Result<(), PoolError> {
    let mut seen = std::collections::HashSet::new();
    for upstream in list {
        if upstream.name.is_empty() {
            return Err(PoolError::InvalidPool("upstream name is empty".into()));
        }
        if !seen.insert(upstream.name.as_str()) {
            return Err(PoolError::InvalidPool(format!(
                "duplicate upstream name: {}",
                upstream.name
            )));
        }
        if upstream.kind != UpstreamKind::Claude
            && upstream
                .default_model
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
        {
            return Err(PoolError::InvalidPool(format!(
                "upstream {} ({}) requires a default model",
                upstream.name, upstream.kind
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(name: &str, kind: UpstreamKind, enabled: bool) -> Upstream {
        Upstream {
            name: name.to_string(),
            host: format!("{name}.example.com"),
            api_key: "sk-test".to_string(),
            kind,
            default_model: match kind {
                UpstreamKind::Claude => None,
                UpstreamKind::Openai => Some("gpt-4-turbo".to_string()),
                UpstreamKind::Gemini => Some("gemini-pro".to_string()),
            },
            enabled,
            remark: String::new(),
        }
    }

    fn pool_of(list: Vec<Upstream>) -> EndpointPool {
        let pool = EndpointPool::new();
        pool.replace(list).unwrap();
        pool
    }

    #[test]
    fn normalize_host_strips_scheme_and_slash() {
        assert_eq!(normalize_host("https://api.example.com/"), "api.example.com");
        assert_eq!(normalize_host("http://api.example.com"), "api.example.com");
        assert_eq!(normalize_host("api.example.com"), "api.example.com");
    }

    #[test]
    fn replace_rejects_duplicate_names() {
        let pool = EndpointPool::new();
        let err = pool
            .replace(vec![
                upstream("a", UpstreamKind::Claude, true),
                upstream("a", UpstreamKind::Claude, true),
            ])
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidPool(_)));
    }

    #[test]
    fn replace_rejects_empty_name() {
        let pool = EndpointPool::new();
        let err = pool
            .replace(vec![upstream("", UpstreamKind::Claude, true)])
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidPool(_)));
    }

    #[test]
    fn replace_requires_default_model_for_non_claude() {
        let pool = EndpointPool::new();
        let mut u = upstream("oai", UpstreamKind::Openai, true);
        u.default_model = None;
        assert!(pool.replace(vec![u]).is_err());
    }

    #[test]
    fn eligible_respects_order_and_enabled_flag() {
        let pool = pool_of(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Openai, false),
            upstream("c", UpstreamKind::Gemini, true),
        ]);
        let names: Vec<_> = pool.eligible().iter().map(|u| u.name.clone()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn mark_failed_removes_from_eligible_until_mark_ok() {
        let pool = pool_of(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Claude, true),
        ]);

        pool.mark_failed("a");
        let names: Vec<_> = pool.eligible().iter().map(|u| u.name.clone()).collect();
        assert_eq!(names, vec!["b"]);

        pool.mark_ok("a");
        let names: Vec<_> = pool.eligible().iter().map(|u| u.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn cooldown_doubles_and_caps() {
        let pool = pool_of(vec![upstream("a", UpstreamKind::Claude, true)]);

        assert_eq!(pool.mark_failed("a"), Duration::from_secs(60));
        assert_eq!(pool.mark_failed("a"), Duration::from_secs(120));
        assert_eq!(pool.mark_failed("a"), Duration::from_secs(240));
        assert_eq!(pool.mark_failed("a"), Duration::from_secs(480));
        assert_eq!(pool.mark_failed("a"), Duration::from_secs(600));
        assert_eq!(pool.mark_failed("a"), Duration::from_secs(600));

        pool.mark_ok("a");
        assert_eq!(pool.mark_failed("a"), Duration::from_secs(60));
    }

    #[test]
    fn pin_rejects_unknown_and_disabled_upstreams() {
        let pool = pool_of(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Claude, false),
        ]);

        assert!(matches!(pool.pin("missing"), Err(PoolError::NoSuchUpstream(_))));
        assert!(matches!(pool.pin("b"), Err(PoolError::NoSuchUpstream(_))));
        assert!(pool.pin("a").is_ok());
    }

    #[test]
    fn pinned_upstream_goes_first_in_attempt_order() {
        let pool = pool_of(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Claude, true),
            upstream("c", UpstreamKind::Claude, true),
        ]);

        pool.pin("c").unwrap();
        let names: Vec<_> = pool.attempt_order().iter().map(|u| u.name.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(pool.current_name().as_deref(), Some("c"));
    }

    #[test]
    fn pinned_upstream_in_cooldown_falls_back_to_head() {
        let pool = pool_of(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Claude, true),
        ]);

        pool.pin("b").unwrap();
        pool.mark_failed("b");
        assert_eq!(pool.current_name().as_deref(), Some("a"));

        pool.mark_ok("b");
        assert_eq!(pool.current_name().as_deref(), Some("b"));
    }

    #[test]
    fn replace_clears_pin_when_target_disappears() {
        let pool = pool_of(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Claude, true),
        ]);
        pool.pin("b").unwrap();

        pool.replace(vec![upstream("a", UpstreamKind::Claude, true)])
            .unwrap();
        assert_eq!(pool.current_name().as_deref(), Some("a"));

        // pin survives when the target is still present and enabled
        pool.replace(vec![
            upstream("b", UpstreamKind::Claude, true),
            upstream("a", UpstreamKind::Claude, true),
        ])
        .unwrap();
        assert_eq!(pool.current_name().as_deref(), Some("b"));
    }

    #[test]
    fn replace_prunes_health_of_removed_upstreams() {
        let pool = pool_of(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Claude, true),
        ]);
        pool.mark_failed("a");

        // "a" is removed and re-added: its cool-down state is gone
        pool.replace(vec![upstream("b", UpstreamKind::Claude, true)])
            .unwrap();
        pool.replace(vec![
            upstream("a", UpstreamKind::Claude, true),
            upstream("b", UpstreamKind::Claude, true),
        ])
        .unwrap();

        let names: Vec<_> = pool.eligible().iter().map(|u| u.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn empty_pool_yields_no_current() {
        let pool = EndpointPool::new();
        pool.replace(Vec::new()).unwrap();
        assert!(pool.eligible().is_empty());
        assert!(pool.current().is_none());
    }
}
