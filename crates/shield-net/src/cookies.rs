//! Cookie Store
//!
//! Keeps cookies set by API responses so later requests through the tunnel
//! carry them (the API pins sessions with cookies). Shared across requests;
//! writers take the lock one at a time.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// A single stored cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lower-cased domain the cookie belongs to
    pub domain: String,
    /// `true` when set with a `Domain` attribute (matches subdomains too)
    pub include_subdomains: bool,
    pub secure: bool,
    expires_at: Option<Instant>,
}

impl Cookie {
    /// Build a host-only cookie
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into().to_ascii_lowercase(),
            include_subdomains: false,
            secure: false,
            expires_at: None,
        }
    }

    /// Parse one `Set-Cookie` value received from `url`.
    ///
    /// `Max-Age` is honoured; `Expires` is not parsed, so such cookies live
    /// for the lifetime of the store.
    pub fn parse(set_cookie: &str, url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_ascii_lowercase();
        let mut parts = set_cookie.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim(), host.clone());

        for attr in parts {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            let val = val.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    // Refuse cookies for unrelated domains
                    if !domain.is_empty() && domain_matches(&host, &domain) {
                        cookie.domain = domain;
                        cookie.include_subdomains = true;
                    }
                }
                "max-age" => {
                    if let Ok(secs) = val.parse::<i64>() {
                        cookie.expires_at = Some(if secs <= 0 {
                            Instant::now()
                        } else {
                            Instant::now() + Duration::from_secs(secs as u64)
                        });
                    }
                }
                "secure" => cookie.secure = true,
                _ => {}
            }
        }

        Some(cookie)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    fn applies_to(&self, host: &str, https: bool) -> bool {
        if self.secure && !https {
            return false;
        }
        if self.include_subdomains {
            domain_matches(host, &self.domain)
        } else {
            host == self.domain
        }
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Cookies keyed by domain
#[derive(Debug, Default)]
pub struct CookieStore {
    inner: RwLock<HashMap<String, Vec<Cookie>>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie, replacing one with the same name and domain
    pub fn insert(&self, cookie: Cookie) {
        let mut map = match self.inner.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let jar = map.entry(cookie.domain.clone()).or_default();
        jar.retain(|c| c.name != cookie.name);
        if !cookie.is_expired(Instant::now()) {
            jar.push(cookie);
        }
    }

    /// Record every `Set-Cookie` value from a response to `url`
    pub fn store_from_response<'a>(&self, url: &Url, set_cookies: impl IntoIterator<Item = &'a str>) {
        for raw in set_cookies {
            match Cookie::parse(raw, url) {
                Some(cookie) => {
                    debug!("Storing cookie {} for {}", cookie.name, cookie.domain);
                    self.insert(cookie);
                }
                None => debug!("Ignoring unparsable Set-Cookie from {}", url),
            }
        }
    }

    /// Cookies that should accompany a request to `url`
    pub fn cookies_for(&self, url: &Url) -> Vec<Cookie> {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return Vec::new();
        };
        let https = url.scheme() == "https";
        let now = Instant::now();

        let map = match self.inner.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.values()
            .flatten()
            .filter(|c| !c.is_expired(now) && c.applies_to(&host, https))
            .cloned()
            .collect()
    }

    /// `Cookie` header value for `url`, if any cookie applies
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies_for(url);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
