use crate::claims::ClaimSet;
use actix_web::{
    http::StatusCode, FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use std::{
    future::{ready, Ready},
    sync::Arc,
};
use thiserror::Error;

/// The verified identity of a request tree, attached to the request
/// extensions once the gate authenticated it.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthenticatedIdentity {
    pub principal: String,
    pub claims: Arc<ClaimSet>,
}

impl AuthenticatedIdentity {
    pub fn new(principal: String, claims: ClaimSet) -> Self {
        Self {
            principal,
            claims: Arc::new(claims),
        }
    }

    pub fn of(req: &HttpRequest) -> Option<Self> {
        req.extensions().get::<AuthenticatedIdentity>().cloned()
    }
}

impl FromRequest for AuthenticatedIdentity {
    type Error = IdentityError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut actix_web::dev::Payload) -> Self::Future {
        ready(AuthenticatedIdentity::of(req).ok_or(IdentityError::Missing))
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Request has not been authenticated.")]
    Missing,
}

impl ResponseError for IdentityError {
    fn status_code(&self) -> StatusCode {
        match self {
            IdentityError::Missing => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_response(&self) -> HttpResponse<actix_web::body::BoxBody> {
        HttpResponse::build(self.status_code()).body(self.to_string())
    }
}

/// Where a request came from. Hosts that dispatch requests internally insert
/// this into the extensions of the generated request; a request without it is
/// treated as [`RequestOrigin::Initial`].
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestOrigin {
    #[default]
    Initial,
    /// Generated while serving `main`, e.g. for included content.
    SubRequest { main: Option<AuthenticatedIdentity> },
    /// An internal redirect replacing `previous`.
    Redispatch {
        previous: Option<AuthenticatedIdentity>,
    },
}

impl RequestOrigin {
    pub fn sub_request_of(main: &HttpRequest) -> Self {
        RequestOrigin::SubRequest {
            main: Self::tree_identity(main),
        }
    }

    pub fn redispatch_of(previous: &HttpRequest) -> Self {
        RequestOrigin::Redispatch {
            previous: Self::tree_identity(previous),
        }
    }

    pub fn of(req: &HttpRequest) -> Self {
        req.extensions()
            .get::<RequestOrigin>()
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, RequestOrigin::Initial)
    }

    /// Identity already established for the request tree, if any.
    pub fn parent_identity(&self) -> Option<&AuthenticatedIdentity> {
        match self {
            RequestOrigin::Initial => None,
            RequestOrigin::SubRequest { main } => main.as_ref(),
            RequestOrigin::Redispatch { previous } => previous.as_ref(),
        }
    }

    // A parent that is itself a sub-request may not have been through the
    // gate, so fall back to whatever its own parent established.
    fn tree_identity(req: &HttpRequest) -> Option<AuthenticatedIdentity> {
        AuthenticatedIdentity::of(req)
            .or_else(|| Self::of(req).parent_identity().cloned())
    }
}
