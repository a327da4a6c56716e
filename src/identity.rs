//! OpenID Connect client for the CDI identity manager.
//!
//! Logs in with the password grant, keeps the access/refresh token pair and
//! hands out a valid access token on demand. The realm is the tenant UUID.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::errors::{DriverError, Result};
use crate::logging::redact;

pub const API_PATH: &str = "/id_manager";

const MASTER_REALM: &str = "master";
const CLUSTER_CREATOR_ROLES: &[&str] = &["system_manager", "tenant_manager"];

pub trait IdentityClient {
    /// Log in and load the user's CDI privileges.
    fn init_connection(&mut self) -> Result<()>;

    /// Fail unless the logged-in user may create clusters in this realm.
    fn validate_user_authorization(&self) -> Result<()>;

    /// A non-expired access token, refreshing or logging in again as needed.
    fn token(&mut self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub realm: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Privileges {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub tenant: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct IntrospectResponse {
    pgcdi_privileges: Option<Privileges>,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

pub struct KeycloakClient {
    base_url: String,
    http: Client,
    credentials: Credentials,
    access_token: String,
    refresh_token: String,
    privileges: Privileges,
}

impl KeycloakClient {
    pub fn new(api_url: &str, credentials: Credentials) -> Result<Self> {
        if api_url.is_empty()
            || credentials.realm.is_empty()
            || credentials.username.is_empty()
            || credentials.password.is_empty()
        {
            return Err(DriverError::config(
                "none of the identity settings can be empty: api_url, tenant_uuid, credentials.username, credentials.password",
            ));
        }
        if credentials.client_id.is_empty() {
            return Err(DriverError::config(
                "environment variable 'CLIENT_ID' for the identity client id is empty",
            ));
        }
        if credentials.client_secret.is_empty() {
            return Err(DriverError::config(
                "environment variable 'CLIENT_SECRET' for the identity client secret is empty",
            ));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DriverError::config(format!("building HTTP client: {e}")))?;

        Ok(Self {
            base_url: format!("{}{}", api_url.trim_end_matches('/'), API_PATH),
            http,
            credentials,
            access_token: String::new(),
            refresh_token: String::new(),
            privileges: Privileges::default(),
        })
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.base_url, self.credentials.realm
        )
    }

    fn post_form<T: for<'de> Deserialize<'de>>(&self, url: &str, form: &[(&str, &str)]) -> Result<T> {
        debug!(url, "sending identity request");
        let resp = self
            .http
            .post(url)
            .form(form)
            .send()
            .map_err(|e| DriverError::Identity(format!("POST {url}: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .map_err(|e| DriverError::Identity(format!("reading response from {url}: {e}")))?;

        if status >= 400 {
            error!(url, status, response_body = %redact(&body), "identity request failed");
            return Err(DriverError::Identity(format!("POST {url} returned {status}: {body}")));
        }
        debug!(url, status, response_body = %redact(&body), "identity response");

        serde_json::from_str(&body)
            .map_err(|e| DriverError::Identity(format!("parsing response from {url}: {e}")))
    }

    fn store_tokens(&mut self, resp: TokenResponse) -> Result<()> {
        self.access_token = resp.access_token.ok_or_else(|| {
            DriverError::Identity("response body does not contain key 'access_token'".into())
        })?;
        self.refresh_token = resp.refresh_token.ok_or_else(|| {
            DriverError::Identity("response body does not contain key 'refresh_token'".into())
        })?;
        Ok(())
    }

    fn login(&mut self) -> Result<()> {
        let c = &self.credentials;
        let form = [
            ("client_id", c.client_id.as_str()),
            ("client_secret", c.client_secret.as_str()),
            ("username", c.username.as_str()),
            ("password", c.password.as_str()),
            ("scope", "openid"),
            ("response", "id_token token"),
            ("grant_type", "password"),
        ];
        let resp: TokenResponse = self.post_form(&self.token_endpoint(), &form)?;
        self.store_tokens(resp)
    }

    fn refresh(&mut self) -> Result<()> {
        let c = &self.credentials;
        let form = [
            ("client_id", c.client_id.as_str()),
            ("client_secret", c.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let resp: TokenResponse = self.post_form(&self.token_endpoint(), &form)?;
        self.store_tokens(resp)?;
        debug!("both tokens successfully refreshed");
        Ok(())
    }

    fn load_privileges(&mut self) -> Result<()> {
        let c = &self.credentials;
        let form = [
            ("client_id", c.client_id.as_str()),
            ("client_secret", c.client_secret.as_str()),
            ("token", self.access_token.as_str()),
        ];
        let url = format!("{}/introspect", self.token_endpoint());
        let resp: IntrospectResponse = self.post_form(&url, &form)?;

        self.privileges = resp.pgcdi_privileges.ok_or_else(|| {
            DriverError::Identity("response body does not contain key 'pgcdi_privileges'".into())
        })?;
        debug!(
            user = %self.credentials.username,
            roles = ?self.privileges.roles,
            clusters = ?self.privileges.clusters,
            tenant = %self.privileges.tenant,
            "loaded CDI privileges"
        );
        Ok(())
    }
}

impl IdentityClient for KeycloakClient {
    fn init_connection(&mut self) -> Result<()> {
        self.login()?;
        debug!("access and refresh tokens initialized");
        self.load_privileges()
    }

    fn validate_user_authorization(&self) -> Result<()> {
        check_authorization(
            &self.credentials.username,
            &self.credentials.realm,
            &self.privileges,
        )
    }

    fn token(&mut self) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        if !token_is_valid(&self.access_token, now) {
            info!("access token expired and needs to be refreshed");
            if let Err(e) = self.refresh() {
                warn!(error = %e, "token refresh failed, logging in again");
                self.init_connection()?;
            }
        }
        Ok(self.access_token.clone())
    }
}

/// Whether the JWT's `exp` claim lies in the future. Signatures are not
/// checked; the identity manager does that on every API call.
pub fn token_is_valid(token: &str, now_unix: i64) -> bool {
    let Some(payload) = token.split('.').nth(1) else {
        return false;
    };
    let claims = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Claims>(&bytes).ok());

    match claims.and_then(|c| c.exp) {
        Some(exp) => {
            debug!(expires_in_secs = exp - now_unix, "access token expiry");
            now_unix < exp
        }
        None => {
            error!("access token has no readable expiration time");
            false
        }
    }
}

pub fn check_authorization(username: &str, realm: &str, privileges: &Privileges) -> Result<()> {
    let allowed = privileges
        .roles
        .iter()
        .any(|r| CLUSTER_CREATOR_ROLES.contains(&r.as_str()));
    if !allowed {
        return Err(DriverError::Authorization(format!(
            "User '{}' is not allowed to create cluster. Only users assigned to role '{}' can create cluster. User roles: '{:?}'",
            username,
            CLUSTER_CREATOR_ROLES.join(","),
            privileges.roles
        )));
    }

    if realm != privileges.tenant {
        return Err(DriverError::Authorization(format!(
            "Cannot create cluster. User realm and tenant differ. Realm: '{}', tenant: '{}'",
            realm, privileges.tenant
        )));
    }

    if realm == MASTER_REALM {
        return Err(DriverError::Authorization(format!(
            "User '{username}' is not allowed to create cluster in master realm '{MASTER_REALM}'"
        )));
    }

    info!(user = username, realm, "user is allowed to create a cluster");
    Ok(())
}
