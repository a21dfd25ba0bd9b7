//! Access predicates for the public API and the admin session gate.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::{AdminConfig, MAX_SESSION_TTL_SECS};
use crate::db::{Database, Op};
use crate::error::{DecetyError, Result};

pub struct AccessGate {
    db: Arc<Database>,
    admin: AdminConfig,
}

impl AccessGate {
    pub fn new(db: Arc<Database>, admin: AdminConfig) -> Self {
        Self { db, admin }
    }

    pub fn require_live_token(&self, token: &str) -> Result<()> {
        if !token.is_empty() && self.db.read(|t| t.token_is_live(token, Utc::now())) {
            Ok(())
        } else {
            Err(DecetyError::Unauthorized)
        }
    }

    pub fn require_session(&self, session_id: Option<&str>) -> Result<()> {
        let Some(id) = session_id.filter(|s| !s.is_empty()) else {
            return Err(DecetyError::Unauthorized);
        };
        let now = Utc::now();
        let valid = self
            .db
            .read(|t| t.sessions.get(id).is_some_and(|expires_at| now < *expires_at));
        if valid {
            Ok(())
        } else {
            Err(DecetyError::Unauthorized)
        }
    }

    /// Check admin credentials and open a new session, returning its id.
    #[instrument(skip(self, password))]
    pub async fn login(&self, login: &str, password: &str) -> Result<String> {
        if login != self.admin.login || password != self.admin.password {
            return Err(DecetyError::Unauthorized);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let ttl = self.admin.session_ttl_secs.min(MAX_SESSION_TTL_SECS) as i64;
        let expires_at = now + Duration::seconds(ttl);
        self.db
            .transaction(|t| {
                if t.sessions.values().any(|exp| *exp <= now) {
                    t.push(Op::PurgeSessions(now));
                }
                t.push(Op::OpenSession {
                    id: id.clone(),
                    expires_at,
                });
                Ok(())
            })
            .await?;

        info!(%expires_at, "admin session opened");
        Ok(id)
    }

    pub async fn logout(&self, session_id: &str) -> Result<()> {
        if !self.db.read(|t| t.sessions.contains_key(session_id)) {
            return Ok(());
        }
        self.db
            .transaction(|t| {
                t.push(Op::CloseSession(session_id.to_string()));
                Ok(())
            })
            .await
    }
}
