use crate::{
    backend::{CacheBackend, SessionBackend},
    claims::ClaimSet,
    config::{ProviderSettings, ScopeConfig, ServerConfig},
    cookie::{CookieChunker, CookieCrypto, CookieHelper},
    engine::{EngineError, EngineResponse, IdentityEngine},
    gate::RequestContext,
    types::{AuthCallbackParams, ChallengeState, SessionState},
    COOKIE_AUTH_CHALLENGE_STATE_PREFIX,
};
use actix_web::{cookie::Expiration, http::header, web, HttpRequest, HttpResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oauth2::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, Scope,
};
use openidconnect::{
    core::{CoreAuthenticationFlow, CoreClient, CoreProviderMetadata},
    reqwest::async_http_client,
    AccessTokenHash, IssuerUrl, Nonce, OAuth2TokenResponse, TokenResponse,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

/// OpenID Connect relying party: logs users in with the authorization code
/// flow and keeps the verified ID token claims as their session.
pub struct OidcEngine {
    crypto: CookieCrypto,
    session: Arc<dyn SessionBackend>,
    cache: Option<Arc<dyn CacheBackend>>,
    clients: RwLock<HashMap<String, Arc<CoreClient>>>,
    redirect_domain: Option<String>,
}

impl fmt::Debug for OidcEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcEngine")
            .field("session", &self.session)
            .field("cache", &self.cache)
            .field("redirect_domain", &self.redirect_domain)
            .finish_non_exhaustive()
    }
}

#[async_trait(?Send)]
impl IdentityEngine for OidcEngine {
    async fn authenticate(
        &self,
        scope: &ScopeConfig,
        ctx: &RequestContext,
    ) -> Result<EngineResponse, EngineError> {
        if self.is_redirect_target(scope, ctx) {
            return self.callback(scope, ctx).await;
        }

        if let Some(claims) = self.session_claims(ctx)? {
            return Ok(EngineResponse::authenticated(claims));
        }

        self.login(scope, ctx).await
    }

    fn is_redirect_target(&self, scope: &ScopeConfig, ctx: &RequestContext) -> bool {
        ctx.request().path() == scope.openidc().redirect_path()
    }
}

impl OidcEngine {
    const METADATA_CACHE_PREFIX: &'static str = "provider-metadata:";
    const METADATA_TTL: Duration = Duration::from_secs(60 * 60 * 24);
    const SCOPE_OPENID: &'static str = "openid";

    pub fn new(config: &ServerConfig) -> Self {
        Self {
            crypto: CookieCrypto::new(config.passphrase()),
            session: Arc::clone(config.session()),
            cache: config.cache().cloned(),
            clients: RwLock::new(HashMap::new()),
            redirect_domain: config.redirect_domain().map(str::to_string),
        }
    }

    fn session_claims(&self, ctx: &RequestContext) -> Result<Option<ClaimSet>, EngineError> {
        let sealed = match self.session.load(ctx.request()) {
            Ok(Some(sealed)) => sealed,
            Ok(None) => {
                log::debug!("[{}] no session found.", ctx.tag());
                return Ok(None);
            }
            Err(err) => {
                log::warn!("[{}] discarding unloadable session: {}", ctx.tag(), err);
                return Ok(None);
            }
        };

        let state = match self.unseal_session(&sealed) {
            Ok(state) => state,
            Err(err) => {
                log::warn!("[{}] discarding unreadable session: {}", ctx.tag(), err);
                return Ok(None);
            }
        };

        let expired = Self::session_expiry(state.created, self.session.max_age())
            .map_or(true, |expiry| Utc::now() >= expiry);
        if expired {
            log::debug!("[{}] session expired.", ctx.tag());
            return Ok(None);
        }

        Ok(Some(ClaimSet::new(state.claims)))
    }

    /// `None` when the expiry is not representable.
    fn session_expiry(created: DateTime<Utc>, max_age: Duration) -> Option<DateTime<Utc>> {
        let max_age = i64::try_from(max_age.as_secs()).ok()?;
        created.checked_add_signed(chrono::Duration::try_seconds(max_age)?)
    }

    fn seal_session(&self, state: &SessionState) -> Result<String, EngineError> {
        Ok(self.crypto.encrypt(&serde_json::to_string(state)?)?)
    }

    fn unseal_session(&self, sealed: &str) -> Result<SessionState, EngineError> {
        Ok(serde_json::from_str(&self.crypto.decrypt(sealed)?)?)
    }

    async fn login(
        &self,
        scope: &ScopeConfig,
        ctx: &RequestContext,
    ) -> Result<EngineResponse, EngineError> {
        let provider = Self::provider(scope)?;
        let client = self.client_for_request(provider, scope, ctx.request()).await?;

        // The client always requests openid itself.
        let scopes = provider
            .scopes()
            .into_iter()
            .filter(|scope| scope != Self::SCOPE_OPENID)
            .map(Scope::new);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, csrf_token, nonce) = client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                CsrfToken::new_random,
                Nonce::new_random,
            )
            .add_scopes(scopes)
            .set_pkce_challenge(pkce_challenge)
            .url();

        let path = ctx
            .request()
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let challenge = ChallengeState::new(pkce_verifier, csrf_token, nonce, path);
        let sealed = self.crypto.encrypt(&serde_json::to_string(&challenge)?)?;

        let chunker = CookieChunker::from_string(
            &sealed,
            COOKIE_AUTH_CHALLENGE_STATE_PREFIX,
            Expiration::Session,
            &scope.openidc().redirect_path(),
        )?;

        let mut response = HttpResponse::TemporaryRedirect();
        for c in chunker.cookies {
            response.cookie(c);
        }

        log::debug!(
            "[{}] redirecting to provider {}.",
            ctx.tag(),
            provider.issuer
        );
        response.append_header((header::LOCATION, auth_url.to_string()));
        Ok(EngineResponse::respond(response.finish()))
    }

    async fn callback(
        &self,
        scope: &ScopeConfig,
        ctx: &RequestContext,
    ) -> Result<EngineResponse, EngineError> {
        let req = ctx.request();
        let params = web::Query::<AuthCallbackParams>::from_query(req.query_string())
            .map_err(|err| EngineError::Callback(err.to_string()))?
            .into_inner();

        if let Some(error) = params.error {
            return Err(EngineError::Provider(
                params.error_description.unwrap_or(error),
            ));
        }
        let (Some(code), Some(state)) = (params.code, params.state) else {
            return Err(EngineError::Callback(
                "code and state are required".to_string(),
            ));
        };

        let challenge = self.challenge_state(req)?;
        if challenge.csrf_token != state {
            return Err(EngineError::Callback("CSRF token doesn't match".to_string()));
        }

        let provider = Self::provider(scope)?;
        let client = self.client_for_request(provider, scope, req).await?;

        let token_response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(PkceCodeVerifier::new(challenge.pkce_verifier))
            .request_async(async_http_client)
            .await
            .map_err(|err| EngineError::ExchangeCode(err.to_string()))?;

        let id_token = token_response
            .id_token()
            .ok_or_else(|| EngineError::IdToken("server did not return an ID token".to_string()))?;
        let claims = id_token
            .claims(&client.id_token_verifier(), &Nonce::new(challenge.nonce))
            .map_err(|err| EngineError::IdToken(err.to_string()))?;

        if let Some(expected_access_token_hash) = claims.access_token_hash() {
            let signing_alg = id_token
                .signing_alg()
                .map_err(|err| EngineError::IdToken(err.to_string()))?;
            let actual_access_token_hash =
                AccessTokenHash::from_token(token_response.access_token(), &signing_alg)
                    .map_err(|err| EngineError::IdToken(err.to_string()))?;
            if actual_access_token_hash != *expected_access_token_hash {
                return Err(EngineError::IdToken("invalid access token hash".to_string()));
            }
        }

        let Value::Object(claims) = serde_json::to_value(claims)? else {
            return Err(EngineError::IdToken("claims are not an object".to_string()));
        };
        let sealed = self.seal_session(&SessionState {
            created: Utc::now(),
            claims,
        })?;

        let mut response = HttpResponse::TemporaryRedirect();
        self.session.store(req, &sealed, &mut response)?;
        CookieHelper::remove_cookies(
            req,
            &mut response,
            COOKIE_AUTH_CHALLENGE_STATE_PREFIX,
            &scope.openidc().redirect_path(),
        );

        log::debug!("[{}] login completed, returning to {}.", ctx.tag(), challenge.path);
        response.append_header((header::LOCATION, challenge.path));
        Ok(EngineResponse::respond(response.finish()))
    }

    fn challenge_state(&self, req: &HttpRequest) -> Result<ChallengeState, EngineError> {
        let cookies = req
            .cookies()
            .map_err(|err| EngineError::Callback(err.to_string()))?;
        let sealed = CookieChunker::from_cookies(&cookies, COOKIE_AUTH_CHALLENGE_STATE_PREFIX)?
            .join()?;
        Ok(serde_json::from_str(&self.crypto.decrypt(&sealed)?)?)
    }

    fn provider(scope: &ScopeConfig) -> Result<&ProviderSettings, EngineError> {
        scope
            .openidc()
            .provider()
            .map(|resolver| &resolver.provider)
            .ok_or(EngineError::MissingProvider)
    }

    /// Client bound to the absolute redirect URL for this request.
    async fn client_for_request(
        &self,
        provider: &ProviderSettings,
        scope: &ScopeConfig,
        req: &HttpRequest,
    ) -> Result<CoreClient, EngineError> {
        let redirect_url = self.redirect_url(scope, req)?;
        let client = self.client(provider).await?;
        Ok(client.as_ref().clone().set_redirect_uri(redirect_url))
    }

    /// Relative redirect URIs are resolved against the configured redirect
    /// domain, or the request's own host when none is set.
    fn redirect_url(
        &self,
        scope: &ScopeConfig,
        req: &HttpRequest,
    ) -> Result<RedirectUrl, EngineError> {
        let uri = scope.openidc().redirect_uri();
        let absolute = match (uri.starts_with('/'), &self.redirect_domain) {
            (false, _) => uri.to_string(),
            (true, Some(domain)) => format!("{domain}{uri}"),
            (true, None) => {
                let connection_info = req.connection_info();
                log::debug!(
                    "no redirect domain configured, using request host {}",
                    connection_info.host()
                );
                format!(
                    "{}://{}{}",
                    connection_info.scheme(),
                    connection_info.host(),
                    uri
                )
            }
        };
        RedirectUrl::new(absolute).map_err(|err| EngineError::RedirectUri(err.to_string()))
    }

    async fn client(&self, provider: &ProviderSettings) -> Result<Arc<CoreClient>, EngineError> {
        let key = provider.cache_key();
        if let Some(client) = self
            .clients
            .read()
            .map_err(|err| EngineError::Lock(err.to_string()))?
            .get(&key)
        {
            return Ok(Arc::clone(client));
        }

        let metadata = self.provider_metadata(provider).await?;
        let client = Arc::new(CoreClient::from_provider_metadata(
            metadata,
            ClientId::new(provider.client_id.clone()),
            provider.client_secret.clone().map(ClientSecret::new),
        ));

        self.clients
            .write()
            .map_err(|err| EngineError::Lock(err.to_string()))?
            .insert(key, Arc::clone(&client));
        Ok(client)
    }

    async fn provider_metadata(
        &self,
        provider: &ProviderSettings,
    ) -> Result<CoreProviderMetadata, EngineError> {
        let cache_key = format!("{}{}", Self::METADATA_CACHE_PREFIX, provider.issuer);

        if let Some(cache) = &self.cache {
            match cache.get(&cache_key) {
                Ok(Some(json)) => match serde_json::from_str(&json) {
                    Ok(metadata) => return Ok(metadata),
                    Err(err) => log::warn!("ignoring cached metadata for {}: {}", provider.issuer, err),
                },
                Ok(None) => (),
                Err(err) => log::warn!("cache lookup failed: {}", err),
            }
        }

        log::debug!("discovering provider {}.", provider.issuer);
        let issuer = IssuerUrl::new(provider.issuer.clone())
            .map_err(|err| EngineError::Discovery(err.to_string()))?;
        let metadata = CoreProviderMetadata::discover_async(issuer, async_http_client)
            .await
            .map_err(|err| EngineError::Discovery(err.to_string()))?;

        if let Some(cache) = &self.cache {
            let stored = serde_json::to_string(&metadata)
                .map_err(EngineError::from)
                .and_then(|json| Ok(cache.set(&cache_key, &json, Self::METADATA_TTL)?));
            if let Err(err) = stored {
                log::warn!("not able to cache metadata for {}: {}", provider.issuer, err);
            }
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::{test::registry_with_memory_cache, BackendRegistry},
        cookie::test::TEST_PASSPHRASE,
        OPENIDC_AUTH_TYPE,
    };
    use actix_web::{cookie::Cookie, http::StatusCode, test::TestRequest};
    use serde_json::{json, Map};
    use serial_test::serial;

    const ISSUER: &str = "https://idp.example.com";

    fn server() -> ServerConfig {
        ServerConfig::builder()
            .passphrase(TEST_PASSPHRASE)
            .finalize(&BackendRegistry::default())
            .unwrap()
    }

    fn scope(with_provider: bool) -> Arc<ScopeConfig> {
        let mut scope = ScopeConfig::create();
        scope.set_auth_type(OPENIDC_AUTH_TYPE).unwrap();
        if with_provider {
            scope
                .set_provider_resolver(
                    "string",
                    &json!({"issuer": ISSUER, "client_id": "gate"}).to_string(),
                    Some("scope=email"),
                )
                .unwrap();
        }
        Arc::new(scope)
    }

    fn context(req: TestRequest, scope: &Arc<ScopeConfig>) -> RequestContext {
        RequestContext::new(req.to_srv_request(), Arc::clone(scope))
    }

    fn session_cookie(engine: &OidcEngine, created: chrono::DateTime<Utc>) -> Cookie<'static> {
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!("alice"));
        let sealed = engine
            .seal_session(&SessionState { created, claims })
            .unwrap();
        Cookie::new("oidc_session_1", sealed)
    }

    fn challenge_cookie(engine: &OidcEngine, csrf_token: &str) -> Cookie<'static> {
        let challenge = ChallengeState {
            pkce_verifier: "verifier".to_string(),
            csrf_token: csrf_token.to_string(),
            nonce: "nonce".to_string(),
            path: "/app".to_string(),
        };
        let sealed = engine
            .crypto
            .encrypt(&serde_json::to_string(&challenge).unwrap())
            .unwrap();
        Cookie::new(format!("{}_1", COOKIE_AUTH_CHALLENGE_STATE_PREFIX), sealed)
    }

    fn provider_metadata_json() -> String {
        json!({
            "issuer": ISSUER,
            "authorization_endpoint": format!("{ISSUER}/authorize"),
            "token_endpoint": format!("{ISSUER}/token"),
            "jwks_uri": format!("{ISSUER}/jwks"),
            "response_types_supported": ["code"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"]
        })
        .to_string()
    }

    #[test]
    fn test_is_redirect_target() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(false);

        // Act & Assert
        let callback = context(TestRequest::with_uri("/openid-connect?code=1"), &scope);
        assert!(engine.is_redirect_target(&scope, &callback));
        let app = context(TestRequest::with_uri("/app"), &scope);
        assert!(!engine.is_redirect_target(&scope, &app));
    }

    #[test]
    fn test_is_redirect_target_with_absolute_redirect_uri() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let mut scope = ScopeConfig::create();
        scope
            .set_redirect_uri("https://app.example.com/auth/callback")
            .unwrap();
        let scope = Arc::new(scope);

        // Act
        let ctx = context(TestRequest::with_uri("/auth/callback?state=x"), &scope);

        // Assert
        assert!(engine.is_redirect_target(&scope, &ctx));
    }

    #[actix_web::test]
    async fn given_valid_session_when_authenticate_then_claims() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(false);
        let cookie = session_cookie(&engine, Utc::now());
        let ctx = context(TestRequest::with_uri("/app").cookie(cookie), &scope);

        // Act
        let response = engine.authenticate(&scope, &ctx).await.unwrap();

        // Assert
        assert_eq!(response.response.status(), StatusCode::OK);
        assert_eq!(response.claims.unwrap().subject(), Some("alice"));
    }

    #[actix_web::test]
    async fn given_expired_session_when_authenticate_then_login_is_attempted() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(false);
        let cookie = session_cookie(&engine, Utc::now() - chrono::Duration::days(4));
        let ctx = context(TestRequest::with_uri("/app").cookie(cookie), &scope);

        // Act
        let result = engine.authenticate(&scope, &ctx).await;

        // Assert
        assert!(matches!(result, Err(EngineError::MissingProvider)));
    }

    #[test]
    fn test_session_expiry_out_of_range_is_none() {
        // Arrange
        let now = Utc::now();

        // Act & Assert
        assert_eq!(
            OidcEngine::session_expiry(now, Duration::from_secs(60)),
            Some(now + chrono::Duration::seconds(60))
        );
        assert_eq!(
            OidcEngine::session_expiry(now, Duration::from_secs(100_000_000_000_000)),
            None
        );
        assert_eq!(OidcEngine::session_expiry(now, Duration::MAX), None);
    }

    #[actix_web::test]
    async fn given_foreign_cookie_sharing_session_prefix_when_authenticate_then_login_is_attempted()
    {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(false);
        let ctx = context(
            TestRequest::with_uri("/app").cookie(Cookie::new("oidc_session_id", "x")),
            &scope,
        );

        // Act
        let result = engine.authenticate(&scope, &ctx).await;

        // Assert
        assert!(matches!(result, Err(EngineError::MissingProvider)));
    }

    #[actix_web::test]
    async fn given_session_with_foreign_cookie_when_authenticate_then_claims() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(false);
        let cookie = session_cookie(&engine, Utc::now());
        let ctx = context(
            TestRequest::with_uri("/app")
                .cookie(cookie)
                .cookie(Cookie::new("oidc_sessionX", "x")),
            &scope,
        );

        // Act
        let response = engine.authenticate(&scope, &ctx).await.unwrap();

        // Assert
        assert_eq!(response.claims.unwrap().subject(), Some("alice"));
    }

    #[actix_web::test]
    async fn given_tampered_session_when_authenticate_then_session_ignored() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(false);
        let ctx = context(
            TestRequest::with_uri("/app").cookie(Cookie::new("oidc_session_1", "00ff00ff")),
            &scope,
        );

        // Act
        let result = engine.authenticate(&scope, &ctx).await;

        // Assert
        assert!(matches!(result, Err(EngineError::MissingProvider)));
    }

    fn server_with_cached_metadata(redirect_domain: Option<&str>) -> ServerConfig {
        let mut builder = ServerConfig::builder()
            .passphrase(TEST_PASSPHRASE)
            .cache("memory", "");
        if let Some(domain) = redirect_domain {
            builder = builder.redirect_domain(domain);
        }
        let server = builder.finalize(&registry_with_memory_cache()).unwrap();
        server
            .cache()
            .unwrap()
            .set(
                &format!("{}{}", OidcEngine::METADATA_CACHE_PREFIX, ISSUER),
                &provider_metadata_json(),
                Duration::from_secs(60),
            )
            .unwrap();
        server
    }

    #[actix_web::test]
    async fn given_redirect_domain_when_no_session_then_host_header_is_ignored() {
        // Arrange
        let engine = OidcEngine::new(&server_with_cached_metadata(Some("https://gate.example.com")));
        let scope = scope(true);
        let ctx = context(
            TestRequest::with_uri("/app/page").insert_header((header::HOST, "evil.example.com")),
            &scope,
        );

        // Act
        let response = engine.authenticate(&scope, &ctx).await.unwrap().response;

        // Assert
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.contains("redirect_uri=https%3A%2F%2Fgate.example.com%2Fopenid-connect"));
        assert!(!location.contains("evil.example.com"));
    }

    #[actix_web::test]
    #[serial(redirect_domain_env)]
    async fn given_cached_metadata_when_no_session_then_redirect_to_provider() {
        // Arrange
        let server = server_with_cached_metadata(None);
        let engine = OidcEngine::new(&server);
        let scope = scope(true);
        let ctx = context(
            TestRequest::with_uri("/app/page?tab=1").insert_header((header::HOST, "app.example.com")),
            &scope,
        );

        // Act
        let response = engine.authenticate(&scope, &ctx).await.unwrap();

        // Assert
        assert!(response.claims.is_none());
        let response = response.response;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with(&format!("{ISSUER}/authorize?")));
        assert!(location.contains("code_challenge_method=S256"));
        assert!(location.contains("scope=openid+email"));
        assert!(location.contains("redirect_uri=http%3A%2F%2Fapp.example.com%2Fopenid-connect"));

        let challenge = response
            .cookies()
            .find(|c| c.name() == format!("{}_1", COOKIE_AUTH_CHALLENGE_STATE_PREFIX))
            .unwrap();
        assert_eq!(challenge.path(), Some("/openid-connect"));
        let state: ChallengeState =
            serde_json::from_str(&engine.crypto.decrypt(challenge.value()).unwrap()).unwrap();
        assert_eq!(state.path, "/app/page?tab=1");
    }

    #[actix_web::test]
    async fn given_provider_error_when_callback_then_error() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(true);
        let ctx = context(
            TestRequest::with_uri(
                "/openid-connect?error=access_denied&error_description=User%20cancelled",
            ),
            &scope,
        );

        // Act
        let result = engine.authenticate(&scope, &ctx).await;

        // Assert
        assert!(matches!(result, Err(EngineError::Provider(description)) if description == "User cancelled"));
    }

    #[actix_web::test]
    async fn given_missing_challenge_when_callback_then_error() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(true);
        let ctx = context(
            TestRequest::with_uri("/openid-connect?code=abc&state=xyz"),
            &scope,
        );

        // Act
        let result = engine.authenticate(&scope, &ctx).await;

        // Assert
        assert!(matches!(result, Err(EngineError::Chunker(_))));
    }

    #[actix_web::test]
    async fn given_forged_state_when_callback_then_error() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(true);
        let cookie = challenge_cookie(&engine, "expected");
        let ctx = context(
            TestRequest::with_uri("/openid-connect?code=abc&state=forged").cookie(cookie),
            &scope,
        );

        // Act
        let result = engine.authenticate(&scope, &ctx).await;

        // Assert
        assert!(matches!(result, Err(EngineError::Callback(reason)) if reason.contains("CSRF")));
    }

    #[actix_web::test]
    async fn given_missing_code_when_callback_then_error() {
        // Arrange
        let engine = OidcEngine::new(&server());
        let scope = scope(true);
        let ctx = context(TestRequest::with_uri("/openid-connect?state=x"), &scope);

        // Act
        let result = engine.authenticate(&scope, &ctx).await;

        // Assert
        assert!(matches!(result, Err(EngineError::Callback(_))));
    }
}
