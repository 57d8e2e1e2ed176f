#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = r#"
# actix-oidc-gate

An OpenID Connect authentication gate for the [Actix web framework](https://actix.rs), acting as a relying party in front of the services it wraps.

actix-oidc-gate decides per request whether OpenID Connect authentication applies, runs the login flow with the provider when it does, and hands the verified claims to the wrapped service as request headers, request variables and an extractable identity. Claim headers sent by clients are always removed first, so a service behind the gate can trust every claim header it sees.

The protocol itself is handled by the excellent [openidconnect](https://docs.rs/openidconnect) crate.

# Getting started

```rust,ignore
use actix_oidc_gate::{
    backend::BackendRegistry,
    config::ServerConfig,
    identity::AuthenticatedIdentity,
    middleware::OidcGate,
    oidc::OidcEngine,
};
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use std::sync::Arc;

#[get("/whoami")]
async fn whoami(identity: AuthenticatedIdentity) -> impl Responder {
    HttpResponse::Ok().body(identity.principal)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let mut builder = ServerConfig::builder();
    builder.scope_mut().set_auth_type("openid-connect").unwrap();
    builder
        .scope_mut()
        .set_provider_resolver("file", "provider.json", None)
        .unwrap();
    // Reads PASSPHRASE from the environment.
    let config = builder.finalize(&BackendRegistry::default()).unwrap();

    let engine = Arc::new(OidcEngine::new(&config));
    let scope = config.scope().clone();

    HttpServer::new(move || {
        App::new()
            .wrap(OidcGate::new(Arc::clone(&engine), scope.clone()))
            .service(whoami)
    })
    .bind(("127.0.0.1", 8123))?
    .run()
    .await
}
```

## Configuration

Settings come in two layers. [`config::ServerConfig`] holds the listener wide
choices, made once at startup:

- the cache backend, used for provider metadata, selected by type name and
  `key=value&key=value` options,
- the session backend, `cookie` unless another one is registered and chosen,
- the passphrase sealing sessions and login challenges, exactly 32 bytes, from
  the builder or the `PASSPHRASE` environment variable,
- the redirect domain, e.g. `https://app.example.com`, that relative redirect
  URIs are resolved against, from the builder or `REDIRECT_DOMAIN`. Without it
  the request's Host header is used, which is only safe when a trusted proxy
  sets it.

Unknown backend types and bad options fail `finalize`, so a misconfigured
server never starts.

[`config::ScopeConfig`] holds the per directory settings: the auth type
(`openid-connect` or `auth-openidc`), redirect URI, provider resolver and the
target pass options. Scopes merge field by field, the more specific scope
winning.

## Sub-requests

Hosts that dispatch internal requests insert an [`identity::RequestOrigin`]
into the extensions of the generated request. Sub-requests and internal
redirects reuse the identity established for their parent instead of running
the identity engine again.
"#]

pub mod backend;
pub mod claims;
pub mod config;
pub(crate) mod cookie;
pub mod engine;
pub(crate) mod env_var;
pub mod gate;
pub mod identity;
pub mod middleware;
pub mod oidc;
pub(crate) mod types;

pub const OPENIDC_AUTH_TYPE: &str = "openid-connect";
/// Legacy spelling, accepted for existing configurations.
pub const OPENIDC_AUTH_TYPE_ALIAS: &str = "auth-openidc";

const COOKIE_AUTH_CHALLENGE_STATE_PREFIX: &str = "oidc_challenge_";
