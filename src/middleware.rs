use crate::{
    config::ScopeConfig,
    engine::IdentityEngine,
    gate::{AuthOutcome, RequestContext, RequestGate},
};
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error, HttpResponse, ResponseError,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    rc::Rc,
    sync::Arc,
};

/// Puts a scope behind the request gate.
///
/// Every request has forged claim headers removed. Requests the gate
/// authenticates reach the wrapped service with verified claims injected and
/// an [`crate::identity::AuthenticatedIdentity`] in their extensions; requests
/// the identity engine answers itself (provider redirects, callbacks) never
/// reach it.
pub struct OidcGate<E: IdentityEngine> {
    gate: RequestGate<E>,
    scope: Arc<ScopeConfig>,
}

impl<E: IdentityEngine> OidcGate<E> {
    pub fn new(engine: Arc<E>, scope: ScopeConfig) -> Self {
        Self {
            gate: RequestGate::new(engine),
            scope: Arc::new(scope),
        }
    }
}

impl<E: IdentityEngine> Clone for OidcGate<E> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            scope: Arc::clone(&self.scope),
        }
    }
}

impl<S, B, E> Transform<S, ServiceRequest> for OidcGate<E>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
    E: IdentityEngine + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = OidcGateMiddleware<S, E>;

    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(OidcGateMiddleware {
            service: Rc::new(service),
            gate: self.gate.clone(),
            scope: Arc::clone(&self.scope),
        }))
    }
}

pub struct OidcGateMiddleware<S, E: IdentityEngine> {
    service: Rc<S>,
    gate: RequestGate<E>,
    scope: Arc<ScopeConfig>,
}

/// Copies the engine's headers, typically session cookies, onto the
/// backend's response.
fn forward_engine_headers<B>(engine_response: &HttpResponse, res: &mut ServiceResponse<B>) {
    for (name, value) in engine_response.headers().iter() {
        if *name == header::CONTENT_TYPE || *name == header::CONTENT_LENGTH {
            continue;
        }
        res.headers_mut().append(name.clone(), value.clone());
    }
}

impl<S, B, E> Service<ServiceRequest> for OidcGateMiddleware<S, E>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
    E: IdentityEngine + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;

    type Error = Error;

    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let gate = self.gate.clone();
        let scope = Arc::clone(&self.scope);

        Box::pin(async move {
            let mut ctx = RequestContext::new(req, scope);
            let outcome = gate.run(&mut ctx).await;
            let req = ctx.into_inner();

            match outcome {
                AuthOutcome::Declined => {
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                AuthOutcome::Authenticated {
                    engine_response, ..
                } => {
                    let mut res = service.call(req).await?;
                    if let Some(engine_response) = engine_response {
                        forward_engine_headers(&engine_response, &mut res);
                    }
                    Ok(res.map_into_left_body())
                }
                AuthOutcome::Responded(response) => {
                    Ok(req.into_response(response).map_into_right_body())
                }
                AuthOutcome::Error(err) => {
                    Ok(req.into_response(err.error_response()).map_into_right_body())
                }
            }
        })
    }
}
