use actix_oidc_gate::{
    backend::BackendRegistry,
    claims::TargetVars,
    config::{ScopeConfig, ServerConfig},
    identity::AuthenticatedIdentity,
    middleware::OidcGate,
    oidc::OidcEngine,
};
use actix_web::{get, web, App, HttpMessage, HttpRequest, HttpResponse, HttpServer, Responder};
use dotenv::dotenv;
use env_logger::Env;
use serde_json::json;
use std::{env, io, sync::Arc};

#[get("/public")]
async fn public() -> impl Responder {
    HttpResponse::Ok().body("I can always be called.")
}

#[get("/whoami")]
async fn whoami(req: HttpRequest, identity: AuthenticatedIdentity) -> impl Responder {
    let vars = req
        .extensions()
        .get::<TargetVars>()
        .map(|vars| {
            vars.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    HttpResponse::Ok().body(format!("Hey there {}!\n\n{}", identity.principal, vars))
}

fn invalid(err: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv().ok();

    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let issuer = env::var("AUTHORITY").map_err(|_| invalid("AUTHORITY must be set"))?;
    let client_id = env::var("CLIENT_ID").map_err(|_| invalid("CLIENT_ID must be set"))?;
    let provider = json!({
        "issuer": issuer,
        "client_id": client_id,
        "client_secret": env::var("CLIENT_SECRET").ok(),
    });

    let mut builder = ServerConfig::builder();
    builder
        .scope_mut()
        .set_provider_resolver("string", &provider.to_string(), Some("scope=email%20profile"))
        .map_err(invalid)?;
    builder
        .scope_mut()
        .set_target_pass("authn_header=X-Remote-User")
        .map_err(invalid)?;
    // Passphrase is taken from PASSPHRASE, the redirect domain from REDIRECT_DOMAIN.
    let config = builder
        .session("cookie", "max_age=3600")
        .finalize(&BackendRegistry::default())
        .map_err(invalid)?;

    let engine = Arc::new(OidcEngine::new(&config));

    // Only the protected scope turns authentication on, so the callback has
    // to arrive inside it.
    let mut protected = ScopeConfig::create();
    protected.set_auth_type("openid-connect").map_err(invalid)?;
    protected
        .set_redirect_uri("/app/openid-connect")
        .map_err(invalid)?;
    let protected = config.scope_for(&protected);

    HttpServer::new(move || {
        App::new().service(public).service(
            web::scope("/app")
                .wrap(OidcGate::new(Arc::clone(&engine), protected.clone()))
                .service(whoami),
        )
    })
    .bind(("127.0.0.1", 8123))?
    .run()
    .await
}
