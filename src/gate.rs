use crate::{
    claims::ClaimsPropagator,
    config::ScopeConfig,
    engine::{EngineError, EngineResponse, IdentityEngine},
    identity::{AuthenticatedIdentity, RequestOrigin},
    OPENIDC_AUTH_TYPE, OPENIDC_AUTH_TYPE_ALIAS,
};
use actix_web::{
    dev::ServiceRequest,
    http::{header::HeaderMap, StatusCode},
    HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use std::{fmt, sync::Arc};

/// Per request scratch state, dropped with the request.
pub struct RequestContext {
    req: ServiceRequest,
    scope: Arc<ScopeConfig>,
    origin: RequestOrigin,
    tag: String,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request", &self.tag)
            .field("origin", &self.origin)
            .finish()
    }
}

impl RequestContext {
    pub fn new(req: ServiceRequest, scope: Arc<ScopeConfig>) -> Self {
        let origin = RequestOrigin::of(req.request());
        let tag = format!("{} {}", req.method(), req.path());
        Self {
            req,
            scope,
            origin,
            tag,
        }
    }

    pub fn request(&self) -> &HttpRequest {
        self.req.request()
    }

    pub fn scope(&self) -> &ScopeConfig {
        &self.scope
    }

    pub fn origin(&self) -> &RequestOrigin {
        &self.origin
    }

    /// Prefix for this request's log lines.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.req.headers_mut()
    }

    pub fn into_inner(self) -> ServiceRequest {
        self.req
    }
}

#[derive(Debug)]
pub enum GateState {
    Start,
    SubRequestCheck,
    TypeCheck,
    Authenticating,
    Done(AuthOutcome),
}

#[derive(Debug)]
pub enum AuthOutcome {
    /// The gate does not apply; let the request through untouched.
    Declined,
    Authenticated {
        identity: AuthenticatedIdentity,
        /// Headers in here belong on the backend's response. `None` when the
        /// identity was recycled from a parent request.
        engine_response: Option<HttpResponse>,
    },
    /// The engine wrote the response; do not run the backend.
    Responded(HttpResponse),
    Error(GateError),
}

impl AuthOutcome {
    fn describe(&self) -> String {
        match self {
            AuthOutcome::Declined => "declined".to_string(),
            AuthOutcome::Authenticated { identity, .. } => {
                format!("authenticated {:?}", identity.principal)
            }
            AuthOutcome::Responded(response) => format!("responded {}", response.status()),
            AuthOutcome::Error(err) => format!("error: {err}"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GateError {
    #[error("Identity engine failed: {0}")]
    EngineFailure(#[from] EngineError),
}

impl ResponseError for GateError {
    fn status_code(&self) -> StatusCode {
        match self {
            GateError::EngineFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Decides per request whether OpenID Connect authentication applies and
/// drives the identity engine when it does.
pub struct RequestGate<E: IdentityEngine> {
    engine: Arc<E>,
}

impl<E: IdentityEngine> Clone for RequestGate<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E: IdentityEngine> RequestGate<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    pub fn is_handled_type(auth_type: &str) -> bool {
        [OPENIDC_AUTH_TYPE, OPENIDC_AUTH_TYPE_ALIAS]
            .iter()
            .any(|handled| auth_type.eq_ignore_ascii_case(handled))
    }

    /// Runs the request from `Start` to `Done`.
    pub async fn run(&self, ctx: &mut RequestContext) -> AuthOutcome {
        let mut state = GateState::Start;
        loop {
            state = match state {
                GateState::Start => self.start(ctx),
                GateState::SubRequestCheck => self.check_sub_request(ctx),
                GateState::TypeCheck => self.check_type(ctx),
                GateState::Authenticating => self.authenticate(ctx).await,
                GateState::Done(outcome) => {
                    log::debug!("[{}] {}.", ctx.tag(), outcome.describe());
                    return outcome;
                }
            };
        }
    }

    fn start(&self, ctx: &mut RequestContext) -> GateState {
        let scope = Arc::clone(&ctx.scope);

        let removed = ClaimsPropagator::new(scope.target_pass()).scrub(ctx.headers_mut());
        if !removed.is_empty() {
            log::warn!(
                "[{}] removed inbound claim headers {:?}.",
                ctx.tag(),
                removed
            );
        }

        if scope.auth_type().is_none() {
            return GateState::Done(AuthOutcome::Declined);
        }

        log::debug!(
            "[{}] incoming request, initial={}.",
            ctx.tag(),
            ctx.origin().is_initial()
        );
        if ctx.origin().is_initial() {
            GateState::TypeCheck
        } else {
            GateState::SubRequestCheck
        }
    }

    fn check_sub_request(&self, ctx: &mut RequestContext) -> GateState {
        let Some(identity) = ctx.origin().parent_identity().cloned() else {
            return GateState::TypeCheck;
        };

        log::debug!(
            "[{}] recycling user {:?} from initial request for sub-request.",
            ctx.tag(),
            identity.principal
        );
        self.attach(ctx, &identity);
        GateState::Done(AuthOutcome::Authenticated {
            identity,
            engine_response: None,
        })
    }

    fn check_type(&self, ctx: &RequestContext) -> GateState {
        let handled = ctx.scope().auth_type().is_some_and(Self::is_handled_type);

        if handled || self.engine.is_redirect_target(ctx.scope(), ctx) {
            GateState::Authenticating
        } else {
            GateState::Done(AuthOutcome::Declined)
        }
    }

    async fn authenticate(&self, ctx: &mut RequestContext) -> GateState {
        let scope = Arc::clone(&ctx.scope);

        let (response, claims) = match self.engine.authenticate(&scope, ctx).await {
            Ok(EngineResponse { response, claims }) => (response, claims),
            Err(err) => {
                log::error!("[{}] identity engine failed: {}", ctx.tag(), err);
                return GateState::Done(AuthOutcome::Error(GateError::EngineFailure(err)));
            }
        };

        let Some(claims) = claims else {
            return GateState::Done(AuthOutcome::Responded(response));
        };

        // Claims decide, whatever status the engine attached to them.
        if !response.status().is_success() {
            log::warn!(
                "[{}] engine returned claims with status {}, treating request as authenticated.",
                ctx.tag(),
                response.status()
            );
        }
        log::debug!("[{}] claims: {}", ctx.tag(), claims);

        let principal = ClaimsPropagator::new(scope.target_pass()).derive_principal(&claims);
        let identity = AuthenticatedIdentity::new(principal, claims);
        self.attach(ctx, &identity);

        GateState::Done(AuthOutcome::Authenticated {
            identity,
            engine_response: Some(response),
        })
    }

    fn attach(&self, ctx: &mut RequestContext, identity: &AuthenticatedIdentity) {
        let scope = Arc::clone(&ctx.scope);
        let vars = ClaimsPropagator::new(scope.target_pass()).inject(
            &identity.claims,
            &identity.principal,
            ctx.headers_mut(),
        );

        let mut extensions = ctx.req.extensions_mut();
        if let Some(vars) = vars {
            extensions.insert(vars);
        }
        extensions.insert(identity.clone());
    }
}
