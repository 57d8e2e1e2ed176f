use crate::{
    backend::{BackendKind, BackendOptions, BackendRegistry, CacheBackend, SessionBackend},
    cookie::CookieSession,
    env_var,
};
use actix_web::http::header::HeaderName;
use oauth2::url::Url;
use serde::Deserialize;
use std::{env, fmt, fs, str::FromStr, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown {kind} backend type {type_name:?}.")]
    UnknownBackendType {
        kind: BackendKind,
        type_name: String,
    },
    #[error("Invalid options for {kind} backend {type_name:?}: {reason}.")]
    InvalidOptions {
        kind: BackendKind,
        type_name: String,
        reason: String,
    },
    #[error("Invalid {directive} value: {reason}.")]
    InvalidDirective {
        directive: &'static str,
        reason: String,
    },
    #[error("{} must be set.", env_var::PASSPHRASE)]
    MissingPassphrase,
    #[error("Passphrase must be exactly 32 bytes long, got {length}.")]
    InvalidPassphrase { length: usize },
}

impl ConfigError {
    pub(crate) fn unknown_backend(kind: BackendKind, type_name: &str) -> Self {
        ConfigError::UnknownBackendType {
            kind,
            type_name: type_name.to_string(),
        }
    }

    fn directive(directive: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidDirective {
            directive,
            reason: reason.into(),
        }
    }
}

/// Secret used to seal session and challenge state. Never has a default.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    const LENGTH: usize = 32;

    pub fn new(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        if value.len() != Self::LENGTH {
            return Err(ConfigError::InvalidPassphrase {
                length: value.len(),
            });
        }
        Ok(Self(value))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

/// Client registration and provider location, as given to `ProviderResolver`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProviderSettings {
    pub issuer: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Space separated list of scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

impl ProviderSettings {
    const SCOPE_OPENID: &'static str = "openid";

    /// Requested scopes; `openid` is always included.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if !scopes.iter().any(|s| s == Self::SCOPE_OPENID) {
            scopes.insert(0, Self::SCOPE_OPENID.to_string());
        }
        scopes
    }

    pub(crate) fn cache_key(&self) -> String {
        format!("{}#{}", self.issuer, self.client_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverKind {
    /// Provider JSON given inline.
    String,
    /// Provider JSON read from a file when the directive is applied.
    File,
}

impl FromStr for ResolverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(ResolverKind::String),
            "file" => Ok(ResolverKind::File),
            other => Err(ConfigError::directive(
                ScopeConfig::PROVIDER_RESOLVER,
                format!("unknown resolver type {other:?}"),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderResolver {
    pub kind: ResolverKind,
    pub value: String,
    pub provider: ProviderSettings,
}

/// Settings handed to the identity engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OidcSettings {
    redirect_uri: Option<String>,
    provider: Option<Arc<ProviderResolver>>,
}

impl OidcSettings {
    const DEFAULT_REDIRECT_URI: &'static str = "/openid-connect";

    pub fn redirect_uri(&self) -> &str {
        self.redirect_uri
            .as_deref()
            .unwrap_or(Self::DEFAULT_REDIRECT_URI)
    }

    /// Path part of the redirect URI, which is where callbacks arrive.
    pub fn redirect_path(&self) -> String {
        let uri = self.redirect_uri();
        if uri.starts_with('/') {
            return uri.split('?').next().unwrap_or(uri).to_string();
        }
        Url::parse(uri)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| Self::DEFAULT_REDIRECT_URI.to_string())
    }

    pub fn provider(&self) -> Option<&ProviderResolver> {
        self.provider.as_deref()
    }

    fn merge(base: &Self, overlay: &Self) -> Self {
        Self {
            redirect_uri: overlay
                .redirect_uri
                .clone()
                .or_else(|| base.redirect_uri.clone()),
            provider: overlay.provider.clone().or_else(|| base.provider.clone()),
        }
    }
}

/// How verified claims are handed to the protected application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetPassConfig {
    prefix: Option<String>,
    as_headers: Option<bool>,
    as_envvars: Option<bool>,
    remote_user_claim: Option<String>,
    authn_header: Option<String>,
    json_payload: Option<bool>,
}

impl TargetPassConfig {
    const DEFAULT_PREFIX: &'static str = "OIDC_CLAIM_";
    const DEFAULT_REMOTE_USER_CLAIM: &'static str = "sub";
    const OPTIONS: [&'static str; 6] = [
        "prefix",
        "as_headers",
        "as_envvars",
        "remote_user_claim",
        "authn_header",
        "json_payload",
    ];

    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(Self::DEFAULT_PREFIX)
    }

    pub fn as_headers(&self) -> bool {
        self.as_headers.unwrap_or(true)
    }

    pub fn as_envvars(&self) -> bool {
        self.as_envvars.unwrap_or(true)
    }

    pub fn remote_user_claim(&self) -> &str {
        self.remote_user_claim
            .as_deref()
            .unwrap_or(Self::DEFAULT_REMOTE_USER_CLAIM)
    }

    pub fn authn_header(&self) -> Option<&str> {
        self.authn_header.as_deref()
    }

    pub fn json_payload(&self) -> bool {
        self.json_payload.unwrap_or(false)
    }

    /// Applies `key=value&...` options; keys not given keep their value.
    pub fn set_options(&mut self, options: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::directive(ScopeConfig::TARGET_PASS, reason);
        let options = options.parse::<BackendOptions>().map_err(invalid)?;
        options.ensure_known(&Self::OPTIONS).map_err(invalid)?;

        // Validate everything before touching self so a rejected directive
        // leaves the scope unchanged.
        let prefix = options
            .get("prefix")
            .map(|prefix| Self::validate_header_name(prefix).map(|_| prefix.to_string()))
            .transpose()
            .map_err(invalid)?;
        let authn_header = options
            .get("authn_header")
            .map(|header| Self::validate_header_name(header).map(|_| header.to_string()))
            .transpose()
            .map_err(invalid)?;
        let remote_user_claim = match options.get("remote_user_claim") {
            Some("") => {
                return Err(invalid("remote_user_claim must not be empty".to_string()));
            }
            claim => claim.map(str::to_string),
        };
        let flag = |key: &str| {
            options
                .get(key)
                .map(|value| parse_flag(key, value))
                .transpose()
                .map_err(invalid)
        };
        let as_headers = flag("as_headers")?;
        let as_envvars = flag("as_envvars")?;
        let json_payload = flag("json_payload")?;

        self.prefix = prefix.or(self.prefix.take());
        self.authn_header = authn_header.or(self.authn_header.take());
        self.remote_user_claim = remote_user_claim.or(self.remote_user_claim.take());
        self.as_headers = as_headers.or(self.as_headers);
        self.as_envvars = as_envvars.or(self.as_envvars);
        self.json_payload = json_payload.or(self.json_payload);
        Ok(())
    }

    fn validate_header_name(name: &str) -> Result<(), String> {
        HeaderName::from_bytes(name.as_bytes())
            .map(|_| ())
            .map_err(|_| format!("{name:?} is not usable as a header name"))
    }

    fn merge(base: &Self, overlay: &Self) -> Self {
        Self {
            prefix: overlay.prefix.clone().or_else(|| base.prefix.clone()),
            as_headers: overlay.as_headers.or(base.as_headers),
            as_envvars: overlay.as_envvars.or(base.as_envvars),
            remote_user_claim: overlay
                .remote_user_claim
                .clone()
                .or_else(|| base.remote_user_claim.clone()),
            authn_header: overlay
                .authn_header
                .clone()
                .or_else(|| base.authn_header.clone()),
            json_payload: overlay.json_payload.or(base.json_payload),
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        _ => Err(format!("{key}={value:?} is not a boolean")),
    }
}

/// Directory or server level settings. Every field starts unset and falls back
/// to a default when read, so a fresh scope is always complete.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeConfig {
    auth_type: Option<String>,
    openidc: OidcSettings,
    target_pass: TargetPassConfig,
}

impl ScopeConfig {
    const PROVIDER_RESOLVER: &'static str = "ProviderResolver";
    const TARGET_PASS: &'static str = "TargetPass";
    const AUTH_TYPE: &'static str = "AuthType";
    const REDIRECT_URI: &'static str = "RedirectURI";

    pub fn create() -> Self {
        Self::default()
    }

    /// Field-by-field merge where anything `overlay` sets wins.
    pub fn merge(base: &Self, overlay: &Self) -> Self {
        Self {
            auth_type: overlay.auth_type.clone().or_else(|| base.auth_type.clone()),
            openidc: OidcSettings::merge(&base.openidc, &overlay.openidc),
            target_pass: TargetPassConfig::merge(&base.target_pass, &overlay.target_pass),
        }
    }

    /// Tears the scope down. Provider settings inherited from a parent are
    /// shared and outlive this call.
    pub fn release(self) {
        log::debug!("releasing scope configuration.");
        drop(self);
    }

    pub fn auth_type(&self) -> Option<&str> {
        self.auth_type.as_deref()
    }

    pub fn openidc(&self) -> &OidcSettings {
        &self.openidc
    }

    pub fn target_pass(&self) -> &TargetPassConfig {
        &self.target_pass
    }

    pub fn set_auth_type(&mut self, auth_type: &str) -> Result<(), ConfigError> {
        let auth_type = auth_type.trim();
        if auth_type.is_empty() {
            return Err(ConfigError::directive(Self::AUTH_TYPE, "must not be empty"));
        }
        self.auth_type = Some(auth_type.to_string());
        Ok(())
    }

    pub fn set_redirect_uri(&mut self, uri: &str) -> Result<(), ConfigError> {
        if !uri.starts_with('/') {
            let url = Url::parse(uri).map_err(|err| ConfigError::directive(Self::REDIRECT_URI, err.to_string()))?;
            if url.scheme() != "https" && url.scheme() != "http" {
                return Err(ConfigError::directive(
                    Self::REDIRECT_URI,
                    format!("unsupported scheme {:?}", url.scheme()),
                ));
            }
        }
        self.openidc.redirect_uri = Some(uri.to_string());
        Ok(())
    }

    pub fn set_provider_resolver(
        &mut self,
        resolver_type: &str,
        value: &str,
        options: Option<&str>,
    ) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::directive(Self::PROVIDER_RESOLVER, reason);
        let kind = resolver_type.parse::<ResolverKind>()?;

        let json = match kind {
            ResolverKind::String => value.to_string(),
            ResolverKind::File => fs::read_to_string(value)
                .map_err(|err| invalid(format!("reading {value:?}: {err}")))?,
        };
        let mut provider: ProviderSettings =
            serde_json::from_str(&json).map_err(|err| invalid(err.to_string()))?;
        if provider.issuer.is_empty() || provider.client_id.is_empty() {
            return Err(invalid("issuer and client_id are required".to_string()));
        }

        let options = options
            .unwrap_or_default()
            .parse::<BackendOptions>()
            .map_err(invalid)?;
        for (key, option) in options.iter() {
            match key {
                "scope" => provider.scope = Some(option.to_string()),
                _ => log::warn!("ignoring unknown {} option {:?}.", Self::PROVIDER_RESOLVER, key),
            }
        }

        log::debug!("provider resolver set for issuer {}.", provider.issuer);
        self.openidc.provider = Some(Arc::new(ProviderResolver {
            kind,
            value: value.to_string(),
            provider,
        }));
        Ok(())
    }

    pub fn set_target_pass(&mut self, options: &str) -> Result<(), ConfigError> {
        self.target_pass.set_options(options)
    }
}

/// Listener wide settings. Read only once [`ServerConfigBuilder::finalize`]
/// returns.
#[derive(Debug)]
pub struct ServerConfig {
    scope: ScopeConfig,
    cache: Option<Arc<dyn CacheBackend>>,
    session: Arc<dyn SessionBackend>,
    passphrase: Passphrase,
    redirect_domain: Option<String>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn scope(&self) -> &ScopeConfig {
        &self.scope
    }

    /// Effective settings for a directory: server defaults overridden by `dir`.
    pub fn scope_for(&self, dir: &ScopeConfig) -> ScopeConfig {
        ScopeConfig::merge(&self.scope, dir)
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    pub fn session(&self) -> &Arc<dyn SessionBackend> {
        &self.session
    }

    pub fn passphrase(&self) -> &Passphrase {
        &self.passphrase
    }

    /// Base for relative redirect URIs. When unset they are resolved against
    /// the request's own host.
    pub fn redirect_domain(&self) -> Option<&str> {
        self.redirect_domain.as_deref()
    }
}

#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    scope: ScopeConfig,
    cache: Option<(String, String)>,
    session: Option<(String, String)>,
    passphrase: Option<String>,
    redirect_domain: Option<String>,
}

impl ServerConfigBuilder {
    const REDIRECT_DOMAIN: &'static str = "RedirectDomain";

    pub fn cache(mut self, type_name: &str, options: &str) -> Self {
        self.cache = Some((type_name.to_string(), options.to_string()));
        self
    }

    pub fn session(mut self, type_name: &str, options: &str) -> Self {
        self.session = Some((type_name.to_string(), options.to_string()));
        self
    }

    pub fn passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(passphrase.to_string());
        self
    }

    pub fn redirect_domain(mut self, domain: &str) -> Self {
        self.redirect_domain = Some(domain.to_string());
        self
    }

    /// Server level defaults for every directory scope.
    pub fn scope_mut(&mut self) -> &mut ScopeConfig {
        &mut self.scope
    }

    /// Resolves the selected backends, each exactly once. Any error here must
    /// stop the server from starting.
    pub fn finalize(self, registry: &BackendRegistry) -> Result<ServerConfig, ConfigError> {
        let passphrase = self
            .passphrase
            .or_else(|| env::var(env_var::PASSPHRASE).ok())
            .ok_or(ConfigError::MissingPassphrase)
            .and_then(Passphrase::new)?;

        let redirect_domain = self
            .redirect_domain
            .or_else(|| env::var(env_var::REDIRECT_DOMAIN).ok())
            .map(|domain| Self::parse_redirect_domain(&domain))
            .transpose()?;

        let (session_type, session_options) = self
            .session
            .unwrap_or_else(|| (CookieSession::TYPE_NAME.to_string(), String::new()));
        let session = registry.resolve_session(&session_type, &session_options)?;

        let cache = self
            .cache
            .map(|(cache_type, cache_options)| registry.resolve_cache(&cache_type, &cache_options))
            .transpose()?;

        log::info!(
            "server configuration finalized with session backend {:?} and cache backend {:?}.",
            session.type_name(),
            cache.as_ref().map(|c| c.type_name().to_string())
        );

        Ok(ServerConfig {
            scope: self.scope,
            cache,
            session,
            passphrase,
            redirect_domain,
        })
    }

    fn parse_redirect_domain(domain: &str) -> Result<String, ConfigError> {
        let invalid = |reason: String| ConfigError::directive(Self::REDIRECT_DOMAIN, reason);
        let url = Url::parse(domain).map_err(|err| invalid(err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(invalid(format!("{domain:?} must not carry a path")));
        }
        Ok(domain.trim_end_matches('/').to_string())
    }
}
