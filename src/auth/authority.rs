//! Agent authority gate.
//!
//! A policy layer over the persisted trust records: every pull touches the
//! agent's row (creating it on first contact) and comes back with a
//! decision. Untrusted agents are not refused at the transport level; they
//! receive an empty, held command list so a compromised agent learns
//! nothing from the response shape.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::infra::traits::AuthorityStore;

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub enabled: bool,
    pub default_trusted: bool,
    /// When storage fails, admit (`true`) or hold (`false`). Holding is
    /// the default: a dead trust table must not widen delivery.
    pub fail_open: bool,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_trusted: true,
            fail_open: false,
        }
    }
}

/// The gate's verdict for one contact.
#[derive(Debug, Clone)]
pub struct AuthorityDecision {
    pub trusted: bool,
    pub reason: String,
    /// Seconds since the agent's previous contact, if it has one.
    pub age_sec: Option<i64>,
}

#[derive(Clone)]
pub struct AuthorityGate {
    store: Arc<dyn AuthorityStore>,
    config: AuthorityConfig,
}

impl AuthorityGate {
    pub fn new(store: Arc<dyn AuthorityStore>, config: AuthorityConfig) -> Self {
        Self { store, config }
    }

    pub async fn evaluate_agent(&self, agent_id: &str, now: DateTime<Utc>) -> AuthorityDecision {
        if !self.config.enabled {
            return AuthorityDecision {
                trusted: true,
                reason: "authority_disabled".to_string(),
                age_sec: None,
            };
        }

        match self
            .store
            .touch_agent(agent_id, self.config.default_trusted, now)
            .await
        {
            Ok(touch) => {
                let age_sec = touch
                    .prior_last_seen
                    .map(|prior| (now - prior).num_seconds().max(0));
                if touch.record.trusted {
                    AuthorityDecision {
                        trusted: true,
                        reason: "ok".to_string(),
                        age_sec,
                    }
                } else {
                    let reason = if touch.record.reason.is_empty() {
                        "agent_distrusted".to_string()
                    } else {
                        touch.record.reason
                    };
                    AuthorityDecision {
                        trusted: false,
                        reason,
                        age_sec,
                    }
                }
            }
            Err(e) => {
                warn!(agent_id, error = %e, "authority lookup failed");
                if self.config.fail_open {
                    AuthorityDecision {
                        trusted: true,
                        reason: "authority_unavailable_fail_open".to_string(),
                        age_sec: None,
                    }
                } else {
                    AuthorityDecision {
                        trusted: false,
                        reason: "authority_unavailable".to_string(),
                        age_sec: None,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentAuthority, AuthorityTouch};
    use crate::infra::error::OutboxError;
    use crate::infra::traits::MockAuthorityStore;
    use chrono::Duration;

    fn touch(trusted: bool, reason: &str, prior: Option<DateTime<Utc>>, now: DateTime<Utc>) -> AuthorityTouch {
        AuthorityTouch {
            record: AgentAuthority {
                agent_id: "edge-1".to_string(),
                trusted,
                reason: reason.to_string(),
                last_seen: now,
                created_at: now,
            },
            prior_last_seen: prior,
        }
    }

    fn gate_with(store: MockAuthorityStore, config: AuthorityConfig) -> AuthorityGate {
        AuthorityGate::new(Arc::new(store), config)
    }

    #[tokio::test]
    async fn trusted_agent_passes_with_age() {
        let now = Utc::now();
        let prior = now - Duration::seconds(120);
        let mut store = MockAuthorityStore::new();
        store
            .expect_touch_agent()
            .returning(move |_, _, n| Ok(touch(true, "", Some(prior), n)));

        let d = gate_with(store, AuthorityConfig::default())
            .evaluate_agent("edge-1", now)
            .await;
        assert!(d.trusted);
        assert_eq!(d.reason, "ok");
        assert_eq!(d.age_sec, Some(120));
    }

    #[tokio::test]
    async fn distrusted_agent_is_held_with_reason() {
        let mut store = MockAuthorityStore::new();
        store
            .expect_touch_agent()
            .returning(|_, _, n| Ok(touch(false, "incident-443", None, n)));

        let d = gate_with(store, AuthorityConfig::default())
            .evaluate_agent("edge-1", Utc::now())
            .await;
        assert!(!d.trusted);
        assert_eq!(d.reason, "incident-443");
    }

    #[tokio::test]
    async fn storage_failure_holds_by_default() {
        let mut store = MockAuthorityStore::new();
        store
            .expect_touch_agent()
            .returning(|_, _, _| Err(OutboxError::Internal("db down".into())));

        let d = gate_with(store, AuthorityConfig::default())
            .evaluate_agent("edge-1", Utc::now())
            .await;
        assert!(!d.trusted);
        assert_eq!(d.reason, "authority_unavailable");
    }

    #[tokio::test]
    async fn storage_failure_admits_when_fail_open() {
        let mut store = MockAuthorityStore::new();
        store
            .expect_touch_agent()
            .returning(|_, _, _| Err(OutboxError::Internal("db down".into())));

        let config = AuthorityConfig {
            fail_open: true,
            ..AuthorityConfig::default()
        };
        let d = gate_with(store, config)
            .evaluate_agent("edge-1", Utc::now())
            .await;
        assert!(d.trusted);
        assert_eq!(d.reason, "authority_unavailable_fail_open");
    }

    #[tokio::test]
    async fn disabled_gate_never_touches_storage() {
        let store = MockAuthorityStore::new();
        let config = AuthorityConfig {
            enabled: false,
            ..AuthorityConfig::default()
        };
        let d = gate_with(store, config)
            .evaluate_agent("edge-1", Utc::now())
            .await;
        assert!(d.trusted);
        assert_eq!(d.reason, "authority_disabled");
    }
}
