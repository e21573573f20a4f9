use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token creation failed: {0}")]
    TokenCreation(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    exp: usize,
}

/// The two independent login claims of one tenant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoginState {
    pub user: bool,
    pub admin: bool,
}

impl LoginState {
    pub fn any(&self) -> bool {
        self.user || self.admin
    }
}

/// Issues and checks the signed, time-limited login cookies `{key}#user` and `{key}#admin`.
pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl AuthService {
    pub fn new(secret: &[u8], login_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            lifetime: Duration::minutes(login_minutes),
        }
    }

    /// Uses a throwaway secret; logins do not survive a restart.
    pub fn with_random_secret(login_minutes: i64) -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::new(&secret, login_minutes)
    }

    pub fn cookie_name(key: &str, role: Role) -> String {
        format!("{key}#{}", role.as_str())
    }

    fn cookie_path(key: &str) -> String {
        format!("/{key}")
    }

    pub fn issue(&self, key: &str, role: Role) -> Result<Cookie<'static>, AuthError> {
        let claims = Claims {
            sub: key.to_string(),
            role,
            exp: (Utc::now() + self.lifetime).timestamp() as usize,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;

        Ok(Cookie::build((Self::cookie_name(key, role), token))
            .path(Self::cookie_path(key))
            .http_only(true)
            .same_site(SameSite::Lax)
            .build())
    }

    fn holds(&self, jar: &CookieJar, key: &str, role: Role) -> bool {
        let Some(cookie) = jar.get(&Self::cookie_name(key, role)) else {
            return false;
        };
        match decode::<Claims>(cookie.value(), &self.decoding, &Validation::default()) {
            Ok(data) => data.claims.sub == key && data.claims.role == role,
            Err(e) => {
                debug!(error = ?e, tenant = key, "Rejected login cookie.");
                false
            }
        }
    }

    pub fn login_state(&self, jar: &CookieJar, key: &str) -> LoginState {
        LoginState {
            user: self.holds(jar, key, Role::User),
            admin: self.holds(jar, key, Role::Admin),
        }
    }

    /// Expired replacements for both login cookies.
    pub fn logout_cookies(key: &str) -> [Cookie<'static>; 2] {
        [Role::User, Role::Admin].map(|role| {
            let mut cookie = Cookie::build((Self::cookie_name(key, role), ""))
                .path(Self::cookie_path(key))
                .http_only(true)
                .same_site(SameSite::Lax)
                .build();
            cookie.make_removal();
            cookie
        })
    }
}
