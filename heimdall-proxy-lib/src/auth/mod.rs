//! Authorization pipeline.
//!
//! `authorize` evaluates a fixed sequence of checks and short-circuits on
//! the first positive or fatal decision:
//!
//! 1. fully-allowed extension fast path
//! 2. fixed IP whitelist
//! 3. HMAC token gate (fatal on a present-but-invalid token)
//! 4. session reuse
//! 5. path-bound whitelist probe
//! 6. static-file-only whitelist probe
//! 7. adaptive m3u8 window gate
//! 8. safe-key-protect redirect for allowed `enc.key` requests
//!
//! Redis failures inside steps 4–7 deny with a transient reason; the
//! pipeline never panics a request.

pub mod browser;
pub mod cidr;
pub mod counter;
pub mod match_key;
pub mod session;
pub mod token;
pub mod whitelist;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use http::StatusCode;
use ipnet::IpNet;
use tracing::{debug, error, info, warn};

use crate::access_log::{AccessLog, ReplayLogEntry};
use crate::config::Config;
use crate::error::Result;
use crate::redis::RedisHandle;
use crate::util::{ends_with_any, now_secs, ua_hash};
use counter::M3u8Counter;
use match_key::extract_match_key;
use session::SessionStore;
use whitelist::WhitelistStore;

/// Why a request was denied. Maps onto the response status and the
/// `{error}` body; internal error text never reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    InvalidToken,
    NotInWhitelist,
    M3u8LimitExceeded,
    Transient,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::InvalidToken => "invalid_token",
            DenyReason::NotInWhitelist => "not_in_whitelist",
            DenyReason::M3u8LimitExceeded => "m3u8_limit_exceeded",
            DenyReason::Transient => "transient",
        }
    }
}

impl From<DenyReason> for StatusCode {
    fn from(r: DenyReason) -> StatusCode {
        match r {
            DenyReason::InvalidToken
            | DenyReason::NotInWhitelist
            | DenyReason::M3u8LimitExceeded => StatusCode::FORBIDDEN,
            DenyReason::Transient => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// A granted request: attribution uid (may be empty for fast-path
/// traffic) and the session that backs it, if any.
#[derive(Debug, Clone)]
pub struct AllowCtx {
    pub uid: String,
    pub session_id: Option<String>,
    pub new_session: bool,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Allow(AllowCtx),
    Deny(DenyReason),
    RedirectProtected(String),
}

/// The request fields the pipeline consumes.
pub struct AuthRequest<'a> {
    pub path: &'a str,
    pub query: &'a HashMap<String, String>,
    pub client_ip: IpAddr,
    pub user_agent: &'a str,
}

pub struct AuthPipeline {
    cfg: Arc<Config>,
    fixed_whitelist: Vec<IpNet>,
    pub sessions: SessionStore,
    pub whitelist: WhitelistStore,
    counter: M3u8Counter,
    replay_log: AccessLog,
}

impl AuthPipeline {
    pub fn new(cfg: Arc<Config>, redis: RedisHandle) -> Self {
        // Bare IPv4 entries widen to /24, same as admin inserts.
        let fixed_whitelist = cfg
            .auth
            .fixed_ip_whitelist
            .iter()
            .filter_map(|s| {
                if s.contains('/') {
                    cidr::parse_pattern(s)
                } else {
                    crate::net::parse_ip(s).map(cidr::widen_host)
                }
            })
            .collect();
        let sessions = SessionStore::new(redis.clone(), cfg.auth.session_ttl);
        let whitelist = WhitelistStore::new(
            redis.clone(),
            cfg.auth.ip_access_ttl,
            cfg.auth.max_paths_per_entry,
            cfg.auth.max_ua_ip_pairs_per_uid,
        );
        let counter = M3u8Counter::new(redis.clone(), cfg.m3u8.clone());
        let replay_log = AccessLog::new(redis);
        Self { cfg, fixed_whitelist, sessions, whitelist, counter, replay_log }
    }

    pub async fn authorize(&self, req: &AuthRequest<'_>) -> Outcome {
        match self.evaluate(req).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(path = req.path, error = %e, "authorization backend failure");
                Outcome::Deny(DenyReason::Transient)
            }
        }
    }

    async fn evaluate(&self, req: &AuthRequest<'_>) -> Result<Outcome> {
        let auth = &self.cfg.auth;
        let path_lower = req.path.to_lowercase();

        // 1. Fully-allowed extensions bypass everything, no Redis access.
        if ends_with_any(&path_lower, &auth.fully_allowed_extensions) {
            debug!(path = req.path, "fully-allowed extension");
            return Ok(Outcome::Allow(AllowCtx {
                uid: String::new(),
                session_id: None,
                new_session: false,
            }));
        }

        // 2. Fixed IP whitelist.
        if let Some(net) = self.fixed_whitelist.iter().find(|n| n.contains(&req.client_ip)) {
            info!(ip = %req.client_ip, pattern = %net, "fixed whitelist allow");
            return Ok(Outcome::Allow(AllowCtx {
                uid: String::new(),
                session_id: None,
                new_session: false,
            }));
        }

        // 3. Token gate. A present-but-invalid token is fatal; a fully
        // absent parameter trio continues as anonymous.
        let q_uid = req.query.get("uid").map(String::as_str);
        let q_expires = req.query.get("expires").map(String::as_str);
        let q_token = req.query.get("token").map(String::as_str);

        let token_uid: Option<String> = if self.cfg.test_flags.disable_session_validation {
            q_uid.map(str::to_owned)
        } else if q_uid.is_some() || q_expires.is_some() || q_token.is_some() {
            let (Some(uid), Some(expires), Some(token)) = (q_uid, q_expires, q_token) else {
                warn!(path = req.path, "incomplete token parameters");
                return Ok(Outcome::Deny(DenyReason::InvalidToken));
            };
            if !token::verify(
                auth.secret_key.as_bytes(),
                uid,
                req.path,
                expires,
                token,
                now_secs(),
            ) {
                warn!(path = req.path, uid, "token verification failed");
                return Ok(Outcome::Deny(DenyReason::InvalidToken));
            }
            Some(uid.to_string())
        } else {
            None
        };

        let ua_hash = ua_hash(req.user_agent);
        let key_path = extract_match_key(req.path);
        let mut allow: Option<AllowCtx> = None;

        // 4. Session reuse for a known uid.
        if let Some(uid) = token_uid.as_deref() {
            if !key_path.is_empty() {
                if let Some(sid) = self
                    .sessions
                    .reuse(uid, req.client_ip, req.user_agent, &ua_hash, &key_path)
                    .await?
                {
                    allow = Some(AllowCtx {
                        uid: uid.to_string(),
                        session_id: Some(sid),
                        new_session: false,
                    });
                }
            }
        }

        // 5./6. Whitelist probes: path-bound first, then the disjoint
        // static-file namespace for qualifying suffixes.
        if allow.is_none() && !self.cfg.test_flags.disable_ip_whitelist {
            let is_static = ends_with_any(&path_lower, &auth.static_file_extensions);
            let static_ip_only = is_static && auth.enable_static_file_ip_only_check;
            let skip_path_check =
                self.cfg.test_flags.disable_path_protection || static_ip_only;

            if let Some(hit) = self
                .whitelist
                .probe_path_bound(req.client_ip, &ua_hash, &key_path, skip_path_check)
                .await?
            {
                allow = Some(self.session_for_hit(req, &hit.uid, &ua_hash, &key_path).await?);
            }

            if allow.is_none() && static_ip_only {
                if let Some(hit) = self.whitelist.probe_static(req.client_ip, &ua_hash).await? {
                    allow = Some(self.session_for_hit(req, &hit.uid, &ua_hash, &key_path).await?);
                }
            }
        }

        // 7. Adaptive window gate for playlists. Applies to every
        // tentative allow, and admits a token-verified request on its own.
        if path_lower.ends_with(".m3u8") && (allow.is_some() || token_uid.is_some()) {
            let identity = allow
                .as_ref()
                .map(|a| a.uid.clone())
                .or_else(|| token_uid.clone())
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| req.client_ip.to_string());

            let decision = self.counter.check(&identity, req.path, req.user_agent).await?;
            self.replay_log
                .record_replay(ReplayLogEntry {
                    ts: now_secs(),
                    identity: identity.clone(),
                    path: req.path.to_string(),
                    browser_class: decision.browser_class.as_str().to_string(),
                    count: decision.current_count,
                    max_count: decision.max_count,
                    blocked: !decision.allowed,
                })
                .await;
            if !decision.allowed {
                return Ok(Outcome::Deny(DenyReason::M3u8LimitExceeded));
            }
            if allow.is_none() {
                let uid = token_uid.unwrap_or_default();
                allow = Some(self.session_for_hit(req, &uid, &ua_hash, &key_path).await?);
            }
        }

        let Some(ctx) = allow else {
            return Ok(Outcome::Deny(DenyReason::NotInWhitelist));
        };

        // 8. Safe-key-protect: allowed enc.key requests are redirected to
        // the external key route instead of served.
        if auth.safe_key_protect_enabled && path_lower.ends_with("enc.key") {
            let base = auth.safe_key_protect_base.trim_end_matches('/');
            let url = format!("{base}/{}", req.path.trim_start_matches('/'));
            info!(path = req.path, url, "safe-key-protect redirect");
            return Ok(Outcome::RedirectProtected(url));
        }

        Ok(Outcome::Allow(ctx))
    }

    /// Create (or reuse) the session backing an allow decision from the
    /// whitelist or counter steps.
    async fn session_for_hit(
        &self,
        req: &AuthRequest<'_>,
        uid: &str,
        ua_hash: &str,
        key_path: &str,
    ) -> Result<AllowCtx> {
        if uid.is_empty() || key_path.is_empty() {
            return Ok(AllowCtx { uid: uid.to_string(), session_id: None, new_session: false });
        }
        if let Some(sid) = self
            .sessions
            .reuse(uid, req.client_ip, req.user_agent, ua_hash, key_path)
            .await?
        {
            return Ok(AllowCtx {
                uid: uid.to_string(),
                session_id: Some(sid),
                new_session: false,
            });
        }
        let sid = self
            .sessions
            .create(uid, req.client_ip, req.user_agent, ua_hash, key_path)
            .await?;
        Ok(AllowCtx { uid: uid.to_string(), session_id: Some(sid), new_session: true })
    }
}
