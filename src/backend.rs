use crate::{
    config::ConfigError,
    cookie::{ChunkerError, CookieSession},
};
use actix_web::{HttpRequest, HttpResponseBuilder};
use percent_encoding::percent_decode_str;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cache,
    Session,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cache => write!(f, "cache"),
            BackendKind::Session => write!(f, "session"),
        }
    }
}

/// Parsed `key=value&key=value` options handed to a backend constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    params: BTreeMap<String, String>,
}

impl BackendOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses `key` into `T` when present.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, String>
    where
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|err| format!("{key}={value:?}: {err}"))
            })
            .transpose()
    }

    /// Fails on the first key not in `known`.
    pub fn ensure_known(&self, known: &[&str]) -> Result<(), String> {
        match self.params.keys().find(|k| !known.contains(&k.as_str())) {
            Some(key) => Err(format!("unknown option {key:?}")),
            None => Ok(()),
        }
    }

    fn decode(raw: &str) -> Result<String, String> {
        let raw = raw.replace('+', " ");
        percent_decode_str(&raw)
            .decode_utf8()
            .map(|s| s.into_owned())
            .map_err(|err| err.to_string())
    }
}

impl FromStr for BackendOptions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut params = BTreeMap::new();
        for pair in s.trim().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("option {pair:?} is not of the form key=value"))?;
            let key = Self::decode(key)?;
            if key.is_empty() {
                return Err(format!("option {pair:?} has an empty key"));
            }
            let value = Self::decode(value)?;
            if params.insert(key.clone(), value).is_some() {
                return Err(format!("option {key:?} given more than once"));
            }
        }
        Ok(Self { params })
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{0}")]
    Chunker(#[from] ChunkerError),
    #[error("Failed to parse cookies: {0}")]
    CookieParse(String),
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Storage the identity engine uses for shared protocol state such as
/// provider metadata.
pub trait CacheBackend: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &str;
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;
}

/// Storage for a user's sealed session. Implementations never see plaintext.
pub trait SessionBackend: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &str;
    fn max_age(&self) -> Duration;
    fn load(&self, req: &HttpRequest) -> Result<Option<String>, BackendError>;
    fn store(
        &self,
        req: &HttpRequest,
        sealed: &str,
        response: &mut HttpResponseBuilder,
    ) -> Result<(), BackendError>;
    fn clear(&self, req: &HttpRequest, response: &mut HttpResponseBuilder);
}

#[derive(Clone, Debug)]
pub enum BackendHandle {
    Cache(Arc<dyn CacheBackend>),
    Session(Arc<dyn SessionBackend>),
}

type CacheFactory =
    Box<dyn Fn(&BackendOptions) -> Result<Arc<dyn CacheBackend>, String> + Send + Sync>;
type SessionFactory =
    Box<dyn Fn(&BackendOptions) -> Result<Arc<dyn SessionBackend>, String> + Send + Sync>;

/// Registration table from backend type name to constructor.
///
/// Lookups only happen while a [`crate::config::ServerConfigBuilder`] is
/// finalized, so a misspelled backend stops the server from starting.
pub struct BackendRegistry {
    caches: HashMap<String, CacheFactory>,
    sessions: HashMap<String, SessionFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("caches", &self.caches.keys().collect::<Vec<_>>())
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_session(CookieSession::TYPE_NAME, |options| {
            CookieSession::from_options(options).map(|s| Arc::new(s) as Arc<dyn SessionBackend>)
        });
        registry
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            caches: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn register_cache<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&BackendOptions) -> Result<Arc<dyn CacheBackend>, String> + Send + Sync + 'static,
    {
        self.caches.insert(type_name.to_string(), Box::new(factory));
        self
    }

    pub fn register_session<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&BackendOptions) -> Result<Arc<dyn SessionBackend>, String>
            + Send
            + Sync
            + 'static,
    {
        self.sessions.insert(type_name.to_string(), Box::new(factory));
        self
    }

    pub fn resolve(
        &self,
        kind: BackendKind,
        type_name: &str,
        options: &str,
    ) -> Result<BackendHandle, ConfigError> {
        match kind {
            BackendKind::Cache => self.resolve_cache(type_name, options).map(BackendHandle::Cache),
            BackendKind::Session => self
                .resolve_session(type_name, options)
                .map(BackendHandle::Session),
        }
    }

    pub fn resolve_cache(
        &self,
        type_name: &str,
        options: &str,
    ) -> Result<Arc<dyn CacheBackend>, ConfigError> {
        let factory = self
            .caches
            .get(type_name)
            .ok_or_else(|| ConfigError::unknown_backend(BackendKind::Cache, type_name))?;
        Self::construct(BackendKind::Cache, type_name, options, factory)
    }

    pub fn resolve_session(
        &self,
        type_name: &str,
        options: &str,
    ) -> Result<Arc<dyn SessionBackend>, ConfigError> {
        let factory = self
            .sessions
            .get(type_name)
            .ok_or_else(|| ConfigError::unknown_backend(BackendKind::Session, type_name))?;
        Self::construct(BackendKind::Session, type_name, options, factory)
    }

    fn construct<T: ?Sized>(
        kind: BackendKind,
        type_name: &str,
        options: &str,
        factory: impl Fn(&BackendOptions) -> Result<Arc<T>, String>,
    ) -> Result<Arc<T>, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidOptions {
            kind,
            type_name: type_name.to_string(),
            reason,
        };
        let parsed = options.parse::<BackendOptions>().map_err(invalid)?;
        let backend = factory(&parsed).map_err(invalid)?;
        log::debug!("{} backend {:?} resolved.", kind, type_name);
        Ok(backend)
    }
}
