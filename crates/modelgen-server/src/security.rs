use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::RateLimit;

const MAX_IDENTIFIER_LEN: usize = 128;

/// `[A-Za-z0-9_-]+`, bounded in length.
pub fn validate_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

/// An identifier with at most one alphanumeric extension, e.g. `m1.stl`.
pub fn validate_file_name(value: &str) -> bool {
    match value.split_once('.') {
        Some((stem, extension)) => {
            validate_identifier(stem)
                && !extension.is_empty()
                && extension.chars().all(|ch| ch.is_ascii_alphanumeric())
        }
        None => validate_identifier(value),
    }
}

/// Joins `components` under `base`, refusing anything that could escape it.
pub fn secure_join(base: &Path, components: &[&str]) -> Option<PathBuf> {
    let mut path = base.to_path_buf();
    for component in components {
        if !validate_file_name(component) {
            return None;
        }
        path.push(component);
    }
    Some(path)
}

const DEFAULT_IDLE: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct IssuedToken {
    token: String,
    last_seen: Instant,
}

/// One CSRF token per issued user id. Tokens unused for longer than the idle
/// timeout are forgotten and the user has to request a new session.
#[derive(Debug)]
pub struct CsrfTokens {
    tokens: Mutex<HashMap<String, IssuedToken>>,
    idle: Duration,
}

impl Default for CsrfTokens {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE)
    }
}

impl CsrfTokens {
    pub fn new(idle: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            idle,
        }
    }

    pub fn issue(&self, user_id: &str) -> String {
        self.issue_at(user_id, Instant::now())
    }

    pub fn issue_at(&self, user_id: &str, now: Instant) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut tokens = lock(&self.tokens);
        tokens.retain(|_, issued| now.saturating_duration_since(issued.last_seen) < self.idle);
        tokens.insert(
            user_id.to_string(),
            IssuedToken {
                token: token.clone(),
                last_seen: now,
            },
        );
        token
    }

    fn touch(&self, user_id: &str, now: Instant) -> Option<String> {
        let mut tokens = lock(&self.tokens);
        let issued = tokens.get_mut(user_id)?;
        if now.saturating_duration_since(issued.last_seen) >= self.idle {
            tokens.remove(user_id);
            return None;
        }
        issued.last_seen = now;
        Some(issued.token.clone())
    }

    pub fn is_known(&self, user_id: &str) -> bool {
        self.touch(user_id, Instant::now()).is_some()
    }

    pub fn verify(&self, user_id: &str, token: &str) -> bool {
        let matches = self
            .touch(user_id, Instant::now())
            .is_some_and(|expected| expected == token);
        if !matches {
            warn!(user_id, "CSRF token mismatch");
        }
        matches
    }

    pub fn len(&self) -> usize {
        lock(&self.tokens).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Window {
    span: Duration,
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl Window {
    fn new(span: Duration) -> Self {
        Self {
            span,
            hits: VecDeque::new(),
            blocked_until: None,
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.blocked_until.is_none_or(|until| until <= now)
            && self
                .hits
                .back()
                .is_none_or(|hit| now.saturating_duration_since(*hit) >= self.span)
    }
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<(&'static str, String), Window>,
    last_sweep: Option<Instant>,
}

/// Sliding-window limiter keyed by route and caller. Hitting the limit blocks
/// the key for twice the window. Windows with nothing left to remember are
/// swept at most once a minute.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn check(&self, route: &'static str, key: &str, limit: RateLimit) -> Result<(), Duration> {
        self.check_at(route, key, limit, Instant::now())
    }

    /// `Err` carries how long the caller has to wait.
    pub fn check_at(
        &self,
        route: &'static str,
        key: &str,
        limit: RateLimit,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut windows = lock(&self.windows);
        if windows
            .last_sweep
            .is_none_or(|swept| now.saturating_duration_since(swept) >= SWEEP_INTERVAL)
        {
            windows.by_key.retain(|_, window| !window.is_idle(now));
            windows.last_sweep = Some(now);
        }

        let span = limit.window();
        let window = windows
            .by_key
            .entry((route, key.to_string()))
            .or_insert_with(|| Window::new(span));
        window.span = span;

        if let Some(until) = window.blocked_until {
            if until > now {
                return Err(until - now);
            }
            window.blocked_until = None;
        }

        while window
            .hits
            .front()
            .is_some_and(|hit| now.saturating_duration_since(*hit) >= span)
        {
            window.hits.pop_front();
        }

        if window.hits.len() >= limit.limit {
            let block = span * 2;
            window.blocked_until = Some(now + block);
            window.hits.clear();
            warn!(route, key, "rate limit exceeded");
            return Err(block);
        }

        window.hits.push_back(now);
        Ok(())
    }

    /// Number of route and caller pairs currently tracked.
    pub fn tracked(&self) -> usize {
        lock(&self.windows).by_key.len()
    }
}
