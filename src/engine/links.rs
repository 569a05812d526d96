use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_instant;
use super::{Engine, EngineError};

/// One-way, deterministic token digest. Only the digest is ever stored
/// or indexed; the secret exists in memory just long enough to hand to
/// the caller.
pub fn hash_token(secret: &str) -> TokenHash {
    let digest = Sha256::digest(secret.as_bytes());
    digest.into()
}

/// Cheap shape gate ahead of any hashing or lookup: exactly the length
/// and alphabet of a generated secret. Everything else is rejected
/// before it can probe the index.
fn token_shape_ok(secret: &str) -> bool {
    secret.len() == TOKEN_LEN
        && secret
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl Engine {
    /// The invite operation: mint a link and return the secret exactly
    /// once. The stored record keeps only the hash.
    pub async fn create_link(
        &self,
        id: Ulid,
        candidate_id: Ulid,
        kind: BookingKind,
        duration_min: Option<u32>,
        job: Option<String>,
        branch: Option<String>,
        expires_at: Ms,
        max_uses: u32,
    ) -> Result<String, EngineError> {
        validate_instant(expires_at)?;
        if max_uses == 0 {
            return Err(EngineError::InvalidInput("max_uses must be at least 1"));
        }
        if max_uses > MAX_LINK_USES {
            return Err(EngineError::LimitExceeded("max_uses too large"));
        }
        if let Some(d) = duration_min
            && (d == 0 || d > 24 * 60) {
                return Err(EngineError::InvalidInput("duration out of range"));
            }
        if job.as_deref().is_some_and(|s| s.len() > MAX_METADATA_LEN)
            || branch.as_deref().is_some_and(|s| s.len() > MAX_METADATA_LEN)
        {
            return Err(EngineError::LimitExceeded("metadata too long"));
        }
        if self.links.len() >= MAX_LINKS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many links"));
        }
        if self.links.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.candidates.contains_key(&candidate_id) {
            return Err(EngineError::NotFound(candidate_id));
        }

        let secret = generate_secret();
        let token_hash = hash_token(&secret);

        let event = Event::LinkCreated {
            id,
            token_hash,
            candidate_id,
            kind,
            duration_min,
            job: job.clone(),
            branch: branch.clone(),
            expires_at,
            max_uses,
        };
        self.wal_append(&event).await?;

        let link = BookingLink {
            id,
            token_hash,
            candidate_id,
            kind,
            duration_min,
            job,
            branch,
            status: LinkStatus::Active,
            expires_at,
            max_uses,
            use_count: 0,
        };
        self.token_index.insert(token_hash, id);
        self.links.insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(link)));
        self.notify.send(&event);

        Ok(secret)
    }

    /// Resolve a caller-supplied secret to a minimized grant. Every
    /// failure mode — bad shape, unknown hash, expired, revoked, used
    /// up — collapses into the same `InvalidToken`; an expired link is
    /// additionally transitioned as a side effect before failing.
    pub async fn validate_token(&self, secret: &str, now: Ms) -> Result<LinkGrant, EngineError> {
        if !token_shape_ok(secret) {
            return Err(EngineError::InvalidToken);
        }

        let hash = hash_token(secret);
        let link_id = self
            .token_index
            .get(&hash)
            .map(|e| *e.value())
            .ok_or(EngineError::InvalidToken)?;
        let link = self.link_handle(&link_id).ok_or(EngineError::InvalidToken)?;

        let mut guard = link.write().await;
        if guard.status != LinkStatus::Active {
            return Err(EngineError::InvalidToken);
        }
        if guard.expires_at <= now {
            let event = Event::LinkExpired { id: guard.id };
            self.wal_append(&event).await?;
            guard.status = LinkStatus::Expired;
            self.notify.send(&event);
            return Err(EngineError::InvalidToken);
        }
        if guard.exhausted() {
            return Err(EngineError::InvalidToken);
        }

        let candidate = self
            .candidate_handle(&guard.candidate_id)
            .ok_or(EngineError::InvalidToken)?;
        let first_name = candidate.read().await.first_name.clone();

        let config = self.config_for(guard.kind).await;
        Ok(LinkGrant {
            link_id: guard.id,
            candidate_id: guard.candidate_id,
            first_name,
            kind: guard.kind,
            duration_min: guard.kind.resolve_duration(guard.duration_min, &config),
            job: guard.job.clone(),
            branch: guard.branch.clone(),
        })
    }

    /// Operator revocation. Idempotent on already-terminal links.
    pub async fn revoke_link(&self, id: Ulid) -> Result<(), EngineError> {
        let link = self.link_handle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = link.write().await;
        if guard.status != LinkStatus::Active {
            return Ok(());
        }
        let event = Event::LinkRevoked { id };
        self.wal_append(&event).await?;
        guard.status = LinkStatus::Revoked;
        self.notify.send(&event);
        Ok(())
    }
}
