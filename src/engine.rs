use crate::{
    backend::BackendError, claims::ClaimSet, config::ScopeConfig, cookie::ChunkerError,
    gate::RequestContext,
};
use actix_web::HttpResponse;
use async_trait::async_trait;

/// What the identity engine made of a request.
#[derive(Debug)]
pub struct EngineResponse {
    /// Response produced by the engine: a redirect to the provider, a page of
    /// its own, or an empty `200 OK` carrying headers for the backend response.
    pub response: HttpResponse,
    /// Present only when the request is authenticated.
    pub claims: Option<ClaimSet>,
}

impl EngineResponse {
    pub fn respond(response: HttpResponse) -> Self {
        Self {
            response,
            claims: None,
        }
    }

    pub fn authenticated(claims: ClaimSet) -> Self {
        Self::with_claims(HttpResponse::Ok().finish(), claims)
    }

    pub fn with_claims(response: HttpResponse, claims: ClaimSet) -> Self {
        Self {
            response,
            claims: Some(claims),
        }
    }
}

/// The call-out boundary to the engine speaking the OpenID Connect protocol.
#[async_trait(?Send)]
pub trait IdentityEngine {
    async fn authenticate(
        &self,
        scope: &ScopeConfig,
        ctx: &RequestContext,
    ) -> Result<EngineResponse, EngineError>;

    /// Whether the request targets the engine's own callback endpoint.
    fn is_redirect_target(&self, scope: &ScopeConfig, ctx: &RequestContext) -> bool;
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("No provider resolver configured for this scope.")]
    MissingProvider,
    #[error("Provider discovery failed: {0}.")]
    Discovery(String),
    #[error("Invalid redirect URI: {0}.")]
    RedirectUri(String),
    #[error("Provider returned an error: {0}.")]
    Provider(String),
    #[error("Invalid callback: {0}.")]
    Callback(String),
    #[error("Not able to exchange code for token: {0}.")]
    ExchangeCode(String),
    #[error("ID token verification failed: {0}.")]
    IdToken(String),
    #[error("{0}")]
    Session(#[from] BackendError),
    #[error("{0}")]
    Chunker(#[from] ChunkerError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("Issue when getting lock: {0}")]
    Lock(String),
}
