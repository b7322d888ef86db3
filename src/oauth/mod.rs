//! Third-party identity providers.
//!
//! Performs the authorization-code exchange and the profile lookup, and hands
//! the auth core nothing but a verified [`OAuthIdentity`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::{OAuthConfig, OAuthProviderConfig, ProviderKind};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("unknown identity provider: {0}")]
    UnknownProvider(String),

    #[error("identity provider returned no email")]
    MissingEmail,

    /// The provider refused the code or the access token.
    #[error("identity provider rejected the request: {0}")]
    Rejected(String),

    #[error("identity provider unreachable: {0}")]
    Transport(String),

    #[error("unexpected identity provider response: {0}")]
    InvalidResponse(String),

    #[error("identity provider misconfigured: {0}")]
    Misconfigured(String),
}

impl From<reqwest::Error> for OAuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OAuthError::InvalidResponse(err.to_string())
        } else {
            OAuthError::Transport(err.to_string())
        }
    }
}

/// What a provider vouches for after a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthIdentity {
    pub email: String,
    pub display_name: String,
    pub provider: String,
}

struct Endpoints {
    auth_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scopes: &'static str,
}

impl ProviderKind {
    fn endpoints(self) -> Endpoints {
        match self {
            ProviderKind::Google => Endpoints {
                auth_url: "https://accounts.google.com/o/oauth2/auth",
                token_url: "https://oauth2.googleapis.com/token",
                userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo",
                scopes: "https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile",
            },
            ProviderKind::Yandex => Endpoints {
                auth_url: "https://oauth.yandex.ru/authorize",
                token_url: "https://oauth.yandex.ru/token",
                userinfo_url: "https://login.yandex.ru/info?format=json",
                scopes: "login:email login:info",
            },
            ProviderKind::Vk => Endpoints {
                auth_url: "https://oauth.vk.com/authorize",
                token_url: "https://oauth.vk.com/access_token",
                userinfo_url: "https://api.vk.com/method/users.get?fields=first_name,last_name&v=5.131",
                scopes: "email",
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Provider {
    kind: ProviderKind,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    auth_url: Url,
    token_url: Url,
    userinfo_url: Url,
    scopes: String,
}

impl Provider {
    fn from_config(name: &str, config: &OAuthProviderConfig) -> Result<Self, OAuthError> {
        let defaults = config.kind.endpoints();
        let parse = |field: &str, value: Option<&String>, fallback: &str| {
            Url::parse(value.map(String::as_str).unwrap_or(fallback)).map_err(|e| {
                OAuthError::Misconfigured(format!("{}: invalid {}: {}", name, field, e))
            })
        };

        Ok(Self {
            kind: config.kind,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_url: config.redirect_url.clone(),
            auth_url: parse("auth_url", config.auth_url.as_ref(), defaults.auth_url)?,
            token_url: parse("token_url", config.token_url.as_ref(), defaults.token_url)?,
            userinfo_url: parse("userinfo_url", config.userinfo_url.as_ref(), defaults.userinfo_url)?,
            scopes: config.scopes.clone().unwrap_or_else(|| defaults.scopes.to_string()),
        })
    }
}

pub struct OAuthClient {
    http: reqwest::Client,
    providers: HashMap<String, Provider>,
}

impl OAuthClient {
    pub fn new(config: &OAuthConfig) -> Result<Self, OAuthError> {
        let providers = config
            .providers
            .iter()
            .map(|(name, cfg)| Ok((name.to_lowercase(), Provider::from_config(name, cfg)?)))
            .collect::<Result<HashMap<_, _>, OAuthError>>()?;

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| OAuthError::Misconfigured(e.to_string()))?;

        Ok(Self { http, providers })
    }

    fn provider(&self, name: &str) -> Result<&Provider, OAuthError> {
        self.providers
            .get(name)
            .ok_or_else(|| OAuthError::UnknownProvider(name.to_string()))
    }

    /// Random value tying a callback to the browser that started the flow.
    pub fn new_state() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn authorize_url(&self, provider: &str, state: &str) -> Result<String, OAuthError> {
        let p = self.provider(provider)?;
        let mut url = p.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &p.client_id)
            .append_pair("redirect_uri", &p.redirect_url)
            .append_pair("scope", &p.scopes)
            .append_pair("state", state);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, provider: &str, code: &str) -> Result<OAuthIdentity, OAuthError> {
        let p = self.provider(provider)?;
        let token_response = self.exchange_code_for_token(p, code).await?;
        let access_token = token_response["access_token"]
            .as_str()
            .ok_or_else(|| OAuthError::InvalidResponse("token response has no access_token".into()))?;

        let userinfo = self.fetch_userinfo(p, access_token).await?;
        let identity = parse_identity(p.kind, provider, &token_response, &userinfo)?;
        debug!(provider = %provider, "identity provider exchange complete");
        Ok(identity)
    }

    async fn exchange_code_for_token(&self, p: &Provider, code: &str) -> Result<Value, OAuthError> {
        let res = self
            .http
            .post(p.token_url.clone())
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", p.client_id.as_str()),
                ("client_secret", p.client_secret.as_str()),
                ("redirect_uri", p.redirect_url.as_str()),
            ])
            .send()
            .await?;

        check_status(res.status(), "token")?;
        Ok(res.json().await?)
    }

    async fn fetch_userinfo(&self, p: &Provider, access_token: &str) -> Result<Value, OAuthError> {
        let request = match p.kind {
            ProviderKind::Google => self.http.get(p.userinfo_url.clone()).bearer_auth(access_token),
            ProviderKind::Yandex => self
                .http
                .get(p.userinfo_url.clone())
                .header(AUTHORIZATION, format!("OAuth {}", access_token)),
            ProviderKind::Vk => {
                let mut url = p.userinfo_url.clone();
                url.query_pairs_mut().append_pair("access_token", access_token);
                self.http.get(url)
            }
        };

        let res = request.send().await?;
        check_status(res.status(), "userinfo")?;
        Ok(res.json().await?)
    }
}

fn check_status(status: reqwest::StatusCode, endpoint: &str) -> Result<(), OAuthError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        warn!(status = %status, endpoint, "identity provider rejected request");
        Err(OAuthError::Rejected(format!("{} endpoint returned {}", endpoint, status)))
    } else {
        Err(OAuthError::Transport(format!("{} endpoint returned {}", endpoint, status)))
    }
}

fn non_empty(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Pulls email and display name out of a provider's responses.
fn parse_identity(
    kind: ProviderKind,
    provider: &str,
    token_response: &Value,
    userinfo: &Value,
) -> Result<OAuthIdentity, OAuthError> {
    let (email, display_name) = match kind {
        ProviderKind::Google => {
            let email = non_empty(&userinfo["email"]);
            // v2 userinfo says `verified_email`, the OpenID endpoint `email_verified`.
            let verified = userinfo["verified_email"].as_bool() == Some(true)
                || userinfo["email_verified"].as_bool() == Some(true);
            if email.is_some() && !verified {
                return Err(OAuthError::Rejected("email address is not verified".into()));
            }
            (email, non_empty(&userinfo["name"]).map(str::to_string))
        }
        ProviderKind::Yandex => (
            non_empty(&userinfo["default_email"]),
            non_empty(&userinfo["display_name"])
                .or_else(|| non_empty(&userinfo["real_name"]))
                .or_else(|| non_empty(&userinfo["login"]))
                .map(str::to_string),
        ),
        ProviderKind::Vk => {
            // VK returns API errors with a 200 status.
            if let Some(message) = non_empty(&userinfo["error"]["error_msg"]) {
                return Err(OAuthError::Rejected(message.to_string()));
            }
            let profile = &userinfo["response"][0];
            let name = [non_empty(&profile["first_name"]), non_empty(&profile["last_name"])]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            (non_empty(&token_response["email"]), Some(name).filter(|n| !n.is_empty()))
        }
    };

    let email = email.ok_or(OAuthError::MissingEmail)?;
    Ok(OAuthIdentity {
        email: email.to_string(),
        display_name: display_name.unwrap_or_default(),
        provider: provider.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider_config(kind: ProviderKind) -> OAuthProviderConfig {
        OAuthProviderConfig {
            kind,
            client_id: "client-id".into(),
            client_secret: "client-secret".into(),
            redirect_url: "http://localhost:8080/api/v1/auth/oauth/google/callback".into(),
            auth_url: None,
            token_url: None,
            userinfo_url: None,
            scopes: None,
        }
    }

    fn client(name: &str, kind: ProviderKind) -> OAuthClient {
        let mut providers = HashMap::new();
        providers.insert(name.to_string(), provider_config(kind));
        OAuthClient::new(&OAuthConfig { providers }).unwrap()
    }

    #[test]
    fn test_authorize_url_carries_state_and_client() {
        let client = client("google", ProviderKind::Google);
        let url = Url::parse(&client.authorize_url("google", "xyz").unwrap()).unwrap();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["state"], "xyz");
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["response_type"], "code");
        assert!(params["scope"].contains("userinfo.email"));
    }

    #[test]
    fn test_unknown_provider() {
        let client = client("google", ProviderKind::Google);
        assert!(matches!(
            client.authorize_url("github", "xyz"),
            Err(OAuthError::UnknownProvider(name)) if name == "github"
        ));
    }

    #[test]
    fn test_invalid_endpoint_is_misconfigured() {
        let mut cfg = provider_config(ProviderKind::Yandex);
        cfg.token_url = Some("not a url".into());
        let mut providers = HashMap::new();
        providers.insert("yandex".to_string(), cfg);
        assert!(matches!(
            OAuthClient::new(&OAuthConfig { providers }),
            Err(OAuthError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_state_is_random() {
        let a = OAuthClient::new_state();
        assert_eq!(a.len(), 43);
        assert_ne!(a, OAuthClient::new_state());
    }

    #[test]
    fn test_parse_google() {
        let identity = parse_identity(
            ProviderKind::Google,
            "google",
            &json!({"access_token": "t"}),
            &json!({"email": "jane@gmail.com", "verified_email": true, "name": "Jane Doe"}),
        )
        .unwrap();
        assert_eq!(identity.email, "jane@gmail.com");
        assert_eq!(identity.display_name, "Jane Doe");
        assert_eq!(identity.provider, "google");
    }

    #[test]
    fn test_parse_google_requires_verified_email() {
        for userinfo in [
            json!({"email": "victim@shop.example", "verified_email": false}),
            json!({"email": "victim@shop.example"}),
        ] {
            let result = parse_identity(ProviderKind::Google, "google", &json!({}), &userinfo);
            assert!(matches!(result, Err(OAuthError::Rejected(_))), "{}", userinfo);
        }

        let identity = parse_identity(
            ProviderKind::Google,
            "google",
            &json!({}),
            &json!({"email": "jane@gmail.com", "email_verified": true}),
        )
        .unwrap();
        assert_eq!(identity.email, "jane@gmail.com");
    }

    #[test]
    fn test_parse_yandex_name_fallbacks() {
        let identity = parse_identity(
            ProviderKind::Yandex,
            "yandex",
            &json!({}),
            &json!({"default_email": "oleg@yandex.ru", "display_name": "", "login": "oleg"}),
        )
        .unwrap();
        assert_eq!(identity.email, "oleg@yandex.ru");
        assert_eq!(identity.display_name, "oleg");
    }

    #[test]
    fn test_parse_vk_email_from_token_response() {
        let identity = parse_identity(
            ProviderKind::Vk,
            "vk",
            &json!({"access_token": "t", "email": "ivan@mail.ru"}),
            &json!({"response": [{"first_name": "Ivan", "last_name": "Petrov"}]}),
        )
        .unwrap();
        assert_eq!(identity.email, "ivan@mail.ru");
        assert_eq!(identity.display_name, "Ivan Petrov");
    }

    #[test]
    fn test_parse_vk_api_error() {
        let result = parse_identity(
            ProviderKind::Vk,
            "vk",
            &json!({"email": "ivan@mail.ru"}),
            &json!({"error": {"error_code": 5, "error_msg": "User authorization failed"}}),
        );
        assert!(matches!(result, Err(OAuthError::Rejected(_))));
    }

    #[test]
    fn test_missing_email() {
        let result = parse_identity(
            ProviderKind::Google,
            "google",
            &json!({}),
            &json!({"name": "No Mail"}),
        );
        assert!(matches!(result, Err(OAuthError::MissingEmail)));
    }
}
