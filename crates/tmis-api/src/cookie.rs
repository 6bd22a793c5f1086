//! Refresh token cookie policy
//!
//! The refresh token only ever travels in an HttpOnly cookie scoped to the
//! auth path. `Secure` is dropped only when development explicitly opts into
//! insecure cookies, and never when `SameSite=None`.

use axum::http::HeaderValue;
use axum_extra::extract::CookieJar;
use tmis_core::{AppConfig, SameSitePolicy};

#[derive(Debug, Clone)]
pub struct RefreshCookiePolicy {
    name: String,
    path: String,
    same_site: SameSitePolicy,
    secure: bool,
    max_age_secs: i64,
}

impl RefreshCookiePolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        let same_site = config.cookie.same_site;
        let insecure_allowed = config.environment.is_development() && config.cookie.allow_insecure;

        Self {
            name: config.cookie.name.clone(),
            path: config.cookie.path.clone(),
            same_site,
            secure: same_site == SameSitePolicy::None || !insecure_allowed,
            max_age_secs: config.jwt.effective_refresh_days() * 24 * 60 * 60,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The refresh token carried by the request, if any
    pub fn read(&self, jar: &CookieJar) -> Option<String> {
        jar.get(&self.name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    }

    /// `Set-Cookie` value carrying a new refresh token
    pub fn issue(&self, token: &str) -> Option<HeaderValue> {
        self.header(token, self.max_age_secs)
    }

    /// `Set-Cookie` value that removes the cookie on the same path
    pub fn clear(&self) -> Option<HeaderValue> {
        self.header("", 0)
    }

    fn header(&self, value: &str, max_age_secs: i64) -> Option<HeaderValue> {
        let same_site = match self.same_site {
            SameSitePolicy::Lax => "Lax",
            SameSitePolicy::Strict => "Strict",
            SameSitePolicy::None => "None",
        };
        let secure = if self.secure { "; Secure" } else { "" };

        HeaderValue::from_str(&format!(
            "{}={}; Path={}; HttpOnly; SameSite={}; Max-Age={}{}",
            self.name, value, self.path, same_site, max_age_secs, secure
        ))
        .ok()
    }
}
