//! Access decisions and the pairing-code lifecycle.
//!
//! Pairing verification is the correctness-critical path: inbound webhooks
//! are retried by upstream protocols, so the same `/pair` message can arrive
//! twice. Verification therefore runs under a per-channel mutex and records
//! its outcome in an idempotency cache keyed by `(channel, user, code)`;
//! replays return the recorded outcome without touching user state again.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use {rand::Rng, serde::Serialize, tracing::{debug, info, warn}};

use {
    courier_common::{
        sync::{IdempotencyCache, KeyedMutex},
        time::now_ms,
        types::{AccessMode, IncomingMessage},
    },
    courier_store::{
        channels::ChannelRecord,
        users::{ChannelUserRecord, ChannelUserRepo},
    },
};

use crate::Result;

/// Code alphabet: 32 symbols, visually ambiguous characters excluded
/// (no `I`, `O`, `0`, `1`).
const PAIRING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generated code length.
const PAIRING_CODE_LEN: usize = 6;

/// How long a sender stays locked out after exhausting their attempts.
const LOCKOUT_WINDOW_MS: i64 = 15 * 60 * 1000;

/// How long completed verification outcomes are replayed to retries.
const VERIFY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Result of an access check for one inbound message.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub allowed: bool,
    pub user: ChannelUserRecord,
    pub reason: Option<String>,
    /// True when the sender could gain access by redeeming a pairing code.
    pub pairing_required: bool,
}

/// Outcome of a pairing-code verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// The code matched; the sender is now allowed.
    Success,
    /// The sender was already allowed; nothing changed.
    AlreadyPaired,
    /// No live code matched; `attempts_remaining` before lockout.
    Invalid { attempts_remaining: u32 },
    /// The code existed but its TTL had elapsed; it has been cleared.
    Expired,
    /// The sender is locked out for `remaining_secs` more seconds.
    LockedOut { remaining_secs: i64 },
}

impl VerifyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::AlreadyPaired)
    }
}

/// True when `text` plausibly is a bare pairing code: one 6–8 character
/// alphanumeric token with no whitespace.
pub fn looks_like_pairing_code(text: &str) -> bool {
    let token = text.trim();
    (6..=8).contains(&token.len()) && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

struct RateWindow {
    minute: i64,
    count: u32,
}

/// Decides, per inbound message, whether the sender may proceed, and manages
/// the pairing-code protocol.
pub struct SecurityManager {
    users: ChannelUserRepo,
    /// Serializes verification attempts per channel.
    pairing_locks: KeyedMutex,
    /// Replays completed verification outcomes to retried webhooks.
    verify_cache: IdempotencyCache<VerifyOutcome>,
    rate_windows: Mutex<HashMap<String, RateWindow>>,
}

impl SecurityManager {
    pub fn new(users: ChannelUserRepo) -> Self {
        Self {
            users,
            pairing_locks: KeyedMutex::new(),
            verify_cache: IdempotencyCache::new(VERIFY_CACHE_TTL),
            rate_windows: Mutex::new(HashMap::new()),
        }
    }

    // ── Access checks ───────────────────────────────────────────────────────

    /// Decide whether the sender of `message` may proceed on `channel`.
    ///
    /// Always upserts the sender's user row so that later pairing or
    /// allowlist promotion has a row to act on. Denials never mutate the
    /// `allowed` flag.
    pub async fn check_access(
        &self,
        channel: &ChannelRecord,
        message: &IncomingMessage,
    ) -> Result<AccessDecision> {
        let mode = channel.security.mode;
        let user = self
            .users
            .upsert(
                &channel.id,
                &message.user_id,
                message.user_name.as_deref(),
                mode == AccessMode::Open,
            )
            .await?;

        if self.rate_limited(channel, &message.user_id) {
            warn!(
                channel = %channel.channel_type,
                user = %message.user_id,
                "rate limit exceeded"
            );
            return Ok(AccessDecision {
                allowed: false,
                user,
                reason: Some("rate limit exceeded, try again in a minute".into()),
                pairing_required: false,
            });
        }

        match mode {
            AccessMode::Open => Ok(AccessDecision {
                allowed: true,
                user,
                reason: None,
                pairing_required: false,
            }),
            AccessMode::Allowlist => {
                if user.allowed {
                    return Ok(AccessDecision {
                        allowed: true,
                        user,
                        reason: None,
                        pairing_required: false,
                    });
                }
                let listed = on_allowlist(&channel.security.allowed_users, message);
                if listed {
                    // Promote the row so later checks short-circuit.
                    self.users.grant(&user.id).await?;
                    let user = self
                        .users
                        .get(&channel.id, &message.user_id)
                        .await?
                        .unwrap_or(user);
                    info!(
                        channel = %channel.channel_type,
                        user = %message.user_id,
                        "allowlisted sender promoted"
                    );
                    return Ok(AccessDecision {
                        allowed: true,
                        user,
                        reason: None,
                        pairing_required: false,
                    });
                }
                Ok(AccessDecision {
                    allowed: false,
                    user,
                    reason: Some("you are not on the allowlist for this channel".into()),
                    pairing_required: false,
                })
            },
            AccessMode::Pairing => {
                if user.allowed {
                    Ok(AccessDecision {
                        allowed: true,
                        user,
                        reason: None,
                        pairing_required: false,
                    })
                } else {
                    Ok(AccessDecision {
                        allowed: false,
                        user,
                        reason: Some("pairing required".into()),
                        pairing_required: true,
                    })
                }
            },
        }
    }

    fn rate_limited(&self, channel: &ChannelRecord, user_id: &str) -> bool {
        let limit = channel.security.rate_limit_per_minute;
        if limit == 0 {
            return false;
        }
        let minute = now_ms() / 60_000;
        let key = format!("{}:{user_id}", channel.id);
        let mut windows = self.rate_windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(key).or_insert(RateWindow { minute, count: 0 });
        if window.minute != minute {
            window.minute = minute;
            window.count = 0;
        }
        window.count += 1;
        window.count > limit
    }

    // ── Pairing codes ───────────────────────────────────────────────────────

    /// Generate a fresh single-use pairing code for `channel`.
    ///
    /// The code lives on a synthetic placeholder row until claimed or
    /// expired; multiple outstanding codes may coexist.
    pub async fn generate_pairing_code(&self, channel: &ChannelRecord) -> Result<String> {
        let code = random_code();
        let expires_at = now_ms() + channel.security.pairing_code_ttl_secs * 1000;
        self.users
            .insert_placeholder(&channel.id, &code, expires_at)
            .await?;
        info!(channel = %channel.channel_type, "pairing code generated");
        Ok(code)
    }

    /// Verify a submitted pairing code for the sender `user_id`.
    ///
    /// Safe against concurrent and repeated invocation: duplicate webhook
    /// deliveries of the same `(channel, user, code)` observe one recorded
    /// outcome and mutate user state at most once.
    pub async fn verify_pairing_code(
        &self,
        channel: &ChannelRecord,
        user_id: &str,
        user_name: Option<&str>,
        code: &str,
    ) -> Result<VerifyOutcome> {
        let normalized = code.trim().to_ascii_uppercase();
        let idem_key = format!("{}:{user_id}:{normalized}", channel.id);

        if let Some(outcome) = self.verify_cache.get(&idem_key) {
            debug!(channel = %channel.channel_type, user = %user_id, "verify replayed from cache");
            return Ok(outcome);
        }

        let _guard = self.pairing_locks.lock(&channel.id).await;

        // A concurrent holder of the lock may have completed the same
        // verification while we waited.
        if let Some(outcome) = self.verify_cache.get(&idem_key) {
            return Ok(outcome);
        }

        let outcome = self
            .verify_locked(channel, user_id, user_name, &normalized)
            .await?;
        self.verify_cache.insert(&idem_key, outcome.clone());
        Ok(outcome)
    }

    async fn verify_locked(
        &self,
        channel: &ChannelRecord,
        user_id: &str,
        user_name: Option<&str>,
        code: &str,
    ) -> Result<VerifyOutcome> {
        let user = self
            .users
            .upsert(&channel.id, user_id, user_name, false)
            .await?;

        if user.allowed {
            return Ok(VerifyOutcome::AlreadyPaired);
        }

        let now = now_ms();
        let max_attempts = channel.security.max_pairing_attempts.max(1) as i64;

        let mut attempts = user.pairing_attempts;
        if let Some(until) = user.lockout_until {
            if now < until {
                return Ok(VerifyOutcome::LockedOut {
                    remaining_secs: (until - now + 999) / 1000,
                });
            }
            // Lockout elapsed: the counter starts over.
            self.users.reset_attempts(&user.id).await?;
            attempts = 0;
        }

        // Codes are matched independently of who holds them: the holder may
        // be a placeholder row or another user entirely.
        let holder = self.users.find_by_code(&channel.id, code).await?;
        let Some(holder) = holder else {
            return self.fail_attempt(&user, attempts, max_attempts, now).await;
        };

        if holder.pairing_expires_at.is_some_and(|t| now >= t) {
            self.users.clear_pairing_code(&holder.id).await?;
            debug!(channel = %channel.channel_type, "expired pairing code cleared");
            return Ok(VerifyOutcome::Expired);
        }

        // Valid: promote the requester and consume the code, wherever it
        // was stored.
        self.users.grant(&user.id).await?;
        if holder.id != user.id {
            self.users.clear_pairing_code(&holder.id).await?;
        }
        info!(channel = %channel.channel_type, user = %user_id, "pairing succeeded");
        Ok(VerifyOutcome::Success)
    }

    async fn fail_attempt(
        &self,
        user: &ChannelUserRecord,
        attempts: i64,
        max_attempts: i64,
        now: i64,
    ) -> Result<VerifyOutcome> {
        let attempts = attempts + 1;
        if attempts >= max_attempts {
            let until = now + LOCKOUT_WINDOW_MS;
            self.users
                .record_failed_attempt(&user.id, attempts, Some(until))
                .await?;
            warn!(user = %user.channel_user_id, "pairing lockout armed");
            Ok(VerifyOutcome::LockedOut {
                remaining_secs: LOCKOUT_WINDOW_MS / 1000,
            })
        } else {
            self.users
                .record_failed_attempt(&user.id, attempts, None)
                .await?;
            Ok(VerifyOutcome::Invalid {
                attempts_remaining: (max_attempts - attempts) as u32,
            })
        }
    }

    // ── Administration ──────────────────────────────────────────────────────

    /// Directly allow a sender, creating the user row if needed.
    pub async fn grant_access(&self, channel: &ChannelRecord, user_id: &str) -> Result<()> {
        let user = self.users.upsert(&channel.id, user_id, None, false).await?;
        self.users.grant(&user.id).await?;
        Ok(())
    }

    /// Directly revoke a sender's access.
    pub async fn revoke_access(&self, channel: &ChannelRecord, user_id: &str) -> Result<()> {
        if let Some(user) = self.users.get(&channel.id, user_id).await? {
            self.users.revoke(&user.id).await?;
        }
        Ok(())
    }

    /// Drop expired unclaimed placeholder codes. Best-effort housekeeping;
    /// expiry is also enforced at verification time.
    pub async fn sweep_expired_codes(&self, channel: &ChannelRecord) -> Result<u64> {
        let removed = self.users.delete_expired_placeholders(&channel.id).await?;
        if removed > 0 {
            debug!(channel = %channel.channel_type, removed, "expired pairing placeholders removed");
        }
        Ok(removed)
    }
}

fn on_allowlist(allowed_users: &[String], message: &IncomingMessage) -> bool {
    let matches = |candidate: &str| {
        allowed_users
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(candidate))
    };
    matches(&message.user_id)
        || message
            .user_name
            .as_deref()
            .is_some_and(matches)
}

fn random_code() -> String {
    let mut rng = rand::rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| PAIRING_ALPHABET[rng.random_range(0..PAIRING_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_common::types::SecurityConfig;
    use courier_store::{channels::ChannelRepo, schema};

    use super::*;

    async fn setup(mode: AccessMode) -> (SecurityManager, ChannelRecord, ChannelUserRepo) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        schema::init(&pool).await.unwrap();
        let channels = ChannelRepo::new(pool.clone());
        let security_config = SecurityConfig {
            mode,
            allowed_users: vec!["alice".into()],
            ..Default::default()
        };
        let channel = channels
            .upsert("telegram", "Test bot", &serde_json::json!({}), &security_config)
            .await
            .unwrap();
        let users = ChannelUserRepo::new(pool);
        (SecurityManager::new(users.clone()), channel, users)
    }

    fn msg(user_id: &str, text: &str) -> IncomingMessage {
        IncomingMessage {
            message_id: "m1".into(),
            user_id: user_id.into(),
            user_name: None,
            chat_id: "chat1".into(),
            text: text.into(),
            timestamp: now_ms(),
            is_group: false,
            thread_id: None,
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn open_mode_allows_everyone() {
        let (mgr, channel, _) = setup(AccessMode::Open).await;
        let decision = mgr.check_access(&channel, &msg("stranger", "hi")).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.user.allowed);
    }

    #[tokio::test]
    async fn allowlist_denies_unknown_without_mutation() {
        let (mgr, channel, users) = setup(AccessMode::Allowlist).await;
        for _ in 0..3 {
            let decision = mgr.check_access(&channel, &msg("mallory", "hi")).await.unwrap();
            assert!(!decision.allowed);
            assert!(!decision.pairing_required);
            assert!(decision.reason.is_some());
        }
        // Repeated denials never flip the allowed flag.
        let row = users.get(&channel.id, "mallory").await.unwrap().unwrap();
        assert!(!row.allowed);
    }

    #[tokio::test]
    async fn allowlist_promotes_listed_sender() {
        let (mgr, channel, users) = setup(AccessMode::Allowlist).await;
        let decision = mgr.check_access(&channel, &msg("alice", "hi")).await.unwrap();
        assert!(decision.allowed);
        // The row is promoted so the list can later shrink without locking
        // out paired senders.
        assert!(users.get(&channel.id, "alice").await.unwrap().unwrap().allowed);
    }

    #[tokio::test]
    async fn pairing_mode_requires_pairing() {
        let (mgr, channel, _) = setup(AccessMode::Pairing).await;
        let decision = mgr.check_access(&channel, &msg("newbie", "hi")).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.pairing_required);
    }

    #[tokio::test]
    async fn generated_code_is_single_use() {
        let (mgr, channel, _) = setup(AccessMode::Pairing).await;
        let code = mgr.generate_pairing_code(&channel).await.unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| PAIRING_ALPHABET.contains(&b)));

        let outcome = mgr
            .verify_pairing_code(&channel, "newbie", Some("Newbie"), &code)
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Success);

        // A different user replaying the consumed code fails.
        let outcome = mgr
            .verify_pairing_code(&channel, "other", None, &code)
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Invalid { .. }));
    }

    #[tokio::test]
    async fn verification_is_case_insensitive() {
        let (mgr, channel, _) = setup(AccessMode::Pairing).await;
        let code = mgr.generate_pairing_code(&channel).await.unwrap();
        let outcome = mgr
            .verify_pairing_code(&channel, "newbie", None, &code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Success);
    }

    #[tokio::test]
    async fn expired_code_is_cleared_not_redeemed() {
        let (mgr, channel, users) = setup(AccessMode::Pairing).await;
        users
            .insert_placeholder(&channel.id, "GONE22", now_ms() - 1000)
            .await
            .unwrap();

        let outcome = mgr
            .verify_pairing_code(&channel, "newbie", None, "GONE22")
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Expired);
        // The code is gone from storage.
        assert!(users.find_by_code(&channel.id, "GONE22").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn brute_force_locks_out_and_resets() {
        let (mgr, channel, users) = setup(AccessMode::Pairing).await;

        for i in 1..=4u32 {
            let outcome = mgr
                .verify_pairing_code(&channel, "mallory", None, &format!("WRONG{i}"))
                .await
                .unwrap();
            assert_eq!(outcome, VerifyOutcome::Invalid {
                attempts_remaining: 5 - i,
            });
        }
        // Fifth wrong attempt arms the lockout.
        let outcome = mgr
            .verify_pairing_code(&channel, "mallory", None, "WRONG5")
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::LockedOut { .. }));

        // During the window no attempt is consumed.
        let outcome = mgr
            .verify_pairing_code(&channel, "mallory", None, "WRONG6")
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::LockedOut { .. }));
        let row = users.get(&channel.id, "mallory").await.unwrap().unwrap();
        assert_eq!(row.pairing_attempts, 5);

        // Simulate the window elapsing; the counter starts over.
        users
            .record_failed_attempt(&row.id, 5, Some(now_ms() - 1000))
            .await
            .unwrap();
        let outcome = mgr
            .verify_pairing_code(&channel, "mallory", None, "WRONG7")
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Invalid {
            attempts_remaining: 4,
        });
    }

    #[tokio::test]
    async fn duplicate_verification_replays_outcome() {
        let (mgr, channel, users) = setup(AccessMode::Pairing).await;
        let code = mgr.generate_pairing_code(&channel).await.unwrap();

        let mgr = std::sync::Arc::new(mgr);
        let channel = std::sync::Arc::new(channel);
        let mut handles = Vec::new();
        for _ in 0..2 {
            let mgr = std::sync::Arc::clone(&mgr);
            let channel = std::sync::Arc::clone(&channel);
            let code = code.clone();
            handles.push(tokio::spawn(async move {
                mgr.verify_pairing_code(&channel, "newbie", None, &code)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            // Both callers observe the same successful outcome; the second
            // must not see Invalid from a consumed code.
            assert_eq!(handle.await.unwrap(), VerifyOutcome::Success);
        }
        assert!(users.get(&channel.id, "newbie").await.unwrap().unwrap().allowed);
    }

    #[tokio::test]
    async fn already_paired_short_circuits() {
        let (mgr, channel, _) = setup(AccessMode::Pairing).await;
        mgr.grant_access(&channel, "vip").await.unwrap();
        let outcome = mgr
            .verify_pairing_code(&channel, "vip", None, "ZZZZZZ")
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::AlreadyPaired);
    }

    #[tokio::test]
    async fn rate_limit_denies_excess() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        schema::init(&pool).await.unwrap();
        let channels = ChannelRepo::new(pool.clone());
        let config = SecurityConfig {
            mode: AccessMode::Open,
            rate_limit_per_minute: 2,
            ..Default::default()
        };
        let channel = channels
            .upsert("telegram", "Test", &serde_json::json!({}), &config)
            .await
            .unwrap();
        let mgr = SecurityManager::new(ChannelUserRepo::new(pool));

        assert!(mgr.check_access(&channel, &msg("u", "1")).await.unwrap().allowed);
        assert!(mgr.check_access(&channel, &msg("u", "2")).await.unwrap().allowed);
        let third = mgr.check_access(&channel, &msg("u", "3")).await.unwrap();
        assert!(!third.allowed);
        assert!(third.reason.unwrap().contains("rate limit"));
    }

    #[test]
    fn pairing_code_shape() {
        assert!(looks_like_pairing_code("AB12CD"));
        assert!(looks_like_pairing_code(" ab12cd34 "));
        assert!(!looks_like_pairing_code("AB12C"));
        assert!(!looks_like_pairing_code("AB12CD345"));
        assert!(!looks_like_pairing_code("AB 2CD"));
        assert!(!looks_like_pairing_code("AB12C!"));
    }
}
