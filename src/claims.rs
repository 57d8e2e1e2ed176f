use crate::config::TargetPassConfig;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{utf8_percent_encode, CONTROLS};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt};

/// Principal used when the claim set carries no usable subject.
pub const FALLBACK_PRINCIPAL: &str = "(unknown)";

/// Verified claims in the order the identity engine returned them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClaimSet(Map<String, Value>);

impl ClaimSet {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    /// `None` unless `value` is a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(claims) => Some(Self(claims)),
            _ => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl fmt::Display for ClaimSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// Claims handed to the application as request variables rather than headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetVars(BTreeMap<String, String>);

impl TargetVars {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Removes forged claim headers and writes verified ones, as configured by
/// the scope's target pass settings.
pub struct ClaimsPropagator<'a> {
    target_pass: &'a TargetPassConfig,
}

impl<'a> ClaimsPropagator<'a> {
    const JSON_SUFFIX: &'static str = "JSON";

    pub fn new(target_pass: &'a TargetPassConfig) -> Self {
        Self { target_pass }
    }

    /// Header names are matched case-insensitively and with `-` equal to `_`,
    /// since CGI style gateways fold the two together.
    pub fn is_reserved(&self, name: &str) -> bool {
        let name = Self::normalize(name);
        if name.starts_with(&Self::normalize(self.target_pass.prefix())) {
            return true;
        }
        self.target_pass
            .authn_header()
            .is_some_and(|header| name == Self::normalize(header))
    }

    /// Returns the names of the removed headers.
    pub fn scrub(&self, headers: &mut HeaderMap) -> Vec<HeaderName> {
        let reserved: Vec<HeaderName> = headers
            .keys()
            .filter(|name| self.is_reserved(name.as_str()))
            .cloned()
            .collect();

        for name in &reserved {
            headers.remove(name.clone());
        }
        reserved
    }

    pub fn derive_principal(&self, claims: &ClaimSet) -> String {
        let claim = self.target_pass.remote_user_claim();
        match claims.get(claim).and_then(Value::as_str) {
            Some(principal) if !principal.is_empty() => principal.to_string(),
            _ => {
                log::warn!(
                    "claim {:?} missing from claim set, using {} as principal.",
                    claim,
                    FALLBACK_PRINCIPAL
                );
                FALLBACK_PRINCIPAL.to_string()
            }
        }
    }

    /// Writes the claims into `headers` and returns the request variables to
    /// attach, if variables are enabled.
    pub fn inject(
        &self,
        claims: &ClaimSet,
        principal: &str,
        headers: &mut HeaderMap,
    ) -> Option<TargetVars> {
        let prefix = self.target_pass.prefix();
        let encoded: Vec<(String, String)> = claims
            .iter()
            .filter_map(|(name, value)| {
                Self::claim_value(value).map(|v| (format!("{prefix}{name}"), v))
            })
            .collect();

        if self.target_pass.as_headers() {
            for (name, value) in &encoded {
                Self::set_header(headers, name, value);
            }
        }

        if self.target_pass.json_payload() {
            let name = format!("{prefix}{}", Self::JSON_SUFFIX);
            Self::set_header(headers, &name, &claims.to_string());
        }

        if let Some(header) = self.target_pass.authn_header() {
            Self::set_header(headers, header, principal);
        }

        self.target_pass
            .as_envvars()
            .then(|| TargetVars(encoded.into_iter().collect()))
    }

    fn claim_value(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Array(items) => Some(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            Value::Object(_) => Some(value.to_string()),
        }
    }

    fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            log::warn!("skipping claim with invalid header name {:?}.", name);
            return;
        };
        let header_value = HeaderValue::from_str(value).or_else(|_| {
            HeaderValue::from_str(&utf8_percent_encode(value, CONTROLS).to_string())
        });
        match header_value {
            Ok(header_value) => {
                headers.insert(header_name, header_value);
            }
            Err(err) => log::warn!("skipping claim header {:?}: {}.", name, err),
        }
    }

    fn normalize(name: &str) -> String {
        name.to_ascii_lowercase().replace('-', "_")
    }
}
