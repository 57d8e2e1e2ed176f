use crate::{
    backend::{BackendError, BackendOptions, SessionBackend},
    config::Passphrase,
};
use actix_web::{
    cookie::{
        time::{Duration as CookieDuration, OffsetDateTime},
        Cookie, Expiration,
    },
    HttpRequest, HttpResponseBuilder,
};
use aes_gcm::{
    aead::{Aead, OsRng},
    AeadCore, Aes256Gcm, Key, KeyInit, Nonce,
};
use hex::FromHexError;
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    string::FromUtf8Error,
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("No cookies found which matched {prefix:?}")]
    Empty { prefix: String },
    #[error("Invalid slice occurred during cookie creation")]
    InvalidSlice,
    #[error("Not able to get part number from cookie name: {cookie_name:?}")]
    InvalidPartNumber { cookie_name: String },
    #[error("{0}")]
    AesGcm(String),
    #[error("{0}")]
    HexDecode(#[from] FromHexError),
    #[error("{0}")]
    FromUtf8Error(#[from] FromUtf8Error),
}

impl From<aes_gcm::aead::Error> for ChunkerError {
    fn from(value: aes_gcm::aead::Error) -> Self {
        ChunkerError::AesGcm(value.to_string())
    }
}

/// Splits a long value over numbered cookies `<prefix>_1`, `<prefix>_2`, ...
pub(crate) struct CookieChunker {
    cookie_name_prefix: String,
    pub(crate) cookies: Vec<Cookie<'static>>,
}

impl CookieChunker {
    const MAX_SIZE: usize = 3_500;

    pub(crate) fn get_dead_cookies(&self, cookies: &[Cookie<'_>]) -> Vec<Cookie<'static>> {
        let chunker_cookie_names: HashSet<&str> = self.cookies.iter().map(|c| c.name()).collect();

        cookies
            .iter()
            .filter(|cookie| Self::is_part(cookie.name(), &self.cookie_name_prefix))
            .filter(|cookie| !chunker_cookie_names.contains(cookie.name()))
            .map(|cookie| cookie.clone().into_owned())
            .collect()
    }

    pub(crate) fn from_cookies(
        cookies: &[Cookie<'_>],
        cookie_name_prefix: &str,
    ) -> Result<Self, ChunkerError> {
        let matching_cookies: Vec<Cookie<'static>> = cookies
            .iter()
            .filter(|cookie| Self::is_part(cookie.name(), cookie_name_prefix))
            .map(|cookie| cookie.clone().into_owned())
            .collect();

        if matching_cookies.is_empty() {
            return Err(ChunkerError::Empty {
                prefix: cookie_name_prefix.to_string(),
            });
        };

        Ok(Self {
            cookies: matching_cookies,
            cookie_name_prefix: cookie_name_prefix.to_string(),
        })
    }

    pub(crate) fn join(&self) -> Result<String, ChunkerError> {
        let mut parts: BTreeMap<usize, &str> = BTreeMap::new();

        for cookie in &self.cookies {
            let part_number = Self::extract_part_number(cookie.name(), &self.cookie_name_prefix)?;
            parts.insert(part_number, cookie.value());
        }

        Ok(parts.values().cloned().collect::<Vec<_>>().concat())
    }

    pub(crate) fn from_string(
        long_string: &str,
        cookie_name_prefix: &str,
        expiry: Expiration,
        path: &str,
    ) -> Result<Self, ChunkerError> {
        Self::from_string_with_size(long_string, cookie_name_prefix, Self::MAX_SIZE, expiry, path)
    }

    fn from_string_with_size(
        long_string: &str,
        cookie_name_prefix: &str,
        max_cookie_size: usize,
        expiry: Expiration,
        path: &str,
    ) -> Result<Self, ChunkerError> {
        let byte_string = long_string.as_bytes();
        let mut cookies: Vec<Cookie<'static>> = Vec::new();
        let mut part_number = 1;
        let mut start_index = 0;

        while start_index < byte_string.len() {
            let mut end_index = start_index + max_cookie_size;

            if end_index > byte_string.len() {
                end_index = byte_string.len();
            } else {
                // Ensure we do not split in the middle of a multibyte character
                while end_index > start_index
                    && !byte_string[end_index].is_ascii()
                    && (byte_string[end_index] & 0b1100_0000) == 0b1000_0000
                {
                    end_index -= 1;
                }
            }

            if end_index <= start_index {
                return Err(ChunkerError::InvalidSlice);
            }

            let chunk = &long_string[start_index..end_index];

            let cookie_name = format!("{}_{}", cookie_name_prefix, part_number);

            let cookie = Cookie::build(cookie_name, chunk.to_string())
                .http_only(true)
                .same_site(actix_web::cookie::SameSite::Lax)
                .expires(expiry)
                .secure(true)
                .path(path.to_string())
                .finish();

            cookies.push(cookie);

            start_index = end_index;
            part_number += 1;
        }

        Ok(Self {
            cookies,
            cookie_name_prefix: cookie_name_prefix.to_string(),
        })
    }

    /// Only `<prefix>_<n>` names are parts; other cookies sharing the prefix
    /// belong to someone else.
    fn is_part(cookie_name: &str, prefix: &str) -> bool {
        cookie_name
            .strip_prefix(prefix)
            .is_some_and(|suffix| suffix.starts_with('_'))
            && Self::extract_part_number(cookie_name, prefix).is_ok()
    }

    fn extract_part_number(cookie_name: &str, prefix: &str) -> Result<usize, ChunkerError> {
        if let Some(suffix) = cookie_name.strip_prefix(prefix) {
            if let Ok(part) = suffix.trim_start_matches('_').parse::<usize>() {
                return Ok(part);
            }
        }
        Err(ChunkerError::InvalidPartNumber {
            cookie_name: String::from(cookie_name),
        })
    }
}

pub(crate) struct CookieHelper {}

impl CookieHelper {
    pub(crate) fn remove_cookies(
        req: &HttpRequest,
        response: &mut HttpResponseBuilder,
        prefix: &str,
        path: &str,
    ) {
        let dead_cookies = req
            .cookies()
            .map(|cookies| {
                cookies
                    .iter()
                    .filter(|cookie| cookie.name().starts_with(prefix))
                    .cloned()
                    .collect::<Vec<Cookie>>()
            })
            .unwrap_or_default();

        for dead_cookie in dead_cookies {
            response.cookie(Self::removal(dead_cookie, path));
        }
    }

    fn removal(mut cookie: Cookie<'static>, path: &str) -> Cookie<'static> {
        cookie.make_removal();
        cookie.set_path(path.to_string());
        cookie
    }
}

/// AES-256-GCM sealing of cookie payloads, keyed by the server passphrase.
#[derive(Clone)]
pub(crate) struct CookieCrypto {
    key: Key<Aes256Gcm>,
}

impl fmt::Debug for CookieCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieCrypto { .. }")
    }
}

impl CookieCrypto {
    const NONCE_SIZE: usize = 12;

    pub(crate) fn new(passphrase: &Passphrase) -> Self {
        Self {
            key: *Key::<Aes256Gcm>::from_slice(passphrase.as_bytes()),
        }
    }

    pub(crate) fn encrypt(&self, plaintext: &str) -> Result<String, ChunkerError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let cipher = Aes256Gcm::new(&self.key);

        let ciphered_data = cipher.encrypt(&nonce, plaintext.as_bytes())?;

        let mut encrypted_data = nonce.to_vec();
        encrypted_data.extend_from_slice(&ciphered_data);
        Ok(hex::encode(encrypted_data))
    }

    pub(crate) fn decrypt(&self, ciphertext: &str) -> Result<String, ChunkerError> {
        let encrypted_data = hex::decode(ciphertext)?;
        if encrypted_data.len() < Self::NONCE_SIZE {
            return Err(ChunkerError::AesGcm("ciphertext too short".to_string()));
        }

        let (nonce_vec, ciphered_text) = encrypted_data.split_at(Self::NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_vec);

        let cipher = Aes256Gcm::new(&self.key);

        let plaintext = cipher.decrypt(nonce, ciphered_text)?;

        String::from_utf8(plaintext).map_err(ChunkerError::FromUtf8Error)
    }
}

/// Session backend keeping the sealed session in the browser, split over
/// as many cookies as needed.
#[derive(Debug, Clone)]
pub(crate) struct CookieSession {
    cookie_name: String,
    max_age: Duration,
    path: String,
}

impl CookieSession {
    pub(crate) const TYPE_NAME: &'static str = "cookie";
    const DEFAULT_COOKIE_NAME: &'static str = "oidc_session";
    const DEFAULT_MAX_AGE_SECONDS: u64 = 60 * 60 * 24 * 3;
    const DEFAULT_PATH: &'static str = "/";
    const MAX_MAX_AGE_SECONDS: u64 = i32::MAX as u64;

    pub(crate) fn from_options(options: &BackendOptions) -> Result<Self, String> {
        options.ensure_known(&["cookie_name", "max_age", "path"])?;

        let cookie_name = options
            .get("cookie_name")
            .unwrap_or(Self::DEFAULT_COOKIE_NAME)
            .to_string();
        if cookie_name.is_empty() || !cookie_name.chars().all(|c| c.is_ascii_graphic()) {
            return Err(format!("invalid cookie_name {cookie_name:?}"));
        }

        let max_age = options
            .parse::<u64>("max_age")?
            .unwrap_or(Self::DEFAULT_MAX_AGE_SECONDS);
        if max_age == 0 {
            return Err("max_age must be positive".to_string());
        }
        if max_age > Self::MAX_MAX_AGE_SECONDS {
            return Err(format!(
                "max_age must not exceed {} seconds",
                Self::MAX_MAX_AGE_SECONDS
            ));
        }

        let path = options.get("path").unwrap_or(Self::DEFAULT_PATH).to_string();
        if !path.starts_with('/') {
            return Err(format!("path {path:?} must start with '/'"));
        }

        Ok(Self {
            cookie_name,
            max_age: Duration::from_secs(max_age),
            path,
        })
    }
}

impl SessionBackend for CookieSession {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn max_age(&self) -> Duration {
        self.max_age
    }

    fn load(&self, req: &HttpRequest) -> Result<Option<String>, BackendError> {
        let cookies = req
            .cookies()
            .map_err(|err| BackendError::CookieParse(err.to_string()))?;

        match CookieChunker::from_cookies(&cookies, &self.cookie_name) {
            Ok(chunker) => Ok(Some(chunker.join()?)),
            Err(ChunkerError::Empty { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(
        &self,
        req: &HttpRequest,
        sealed: &str,
        response: &mut HttpResponseBuilder,
    ) -> Result<(), BackendError> {
        let lifetime = CookieDuration::seconds(self.max_age.as_secs() as i64);
        let chunker = CookieChunker::from_string(
            sealed,
            &self.cookie_name,
            Expiration::DateTime(OffsetDateTime::now_utc().saturating_add(lifetime)),
            &self.path,
        )?;

        let prior_cookies = req.cookies().map(|c| c.to_vec()).unwrap_or_default();
        for dead_cookie in chunker.get_dead_cookies(&prior_cookies) {
            response.cookie(CookieHelper::removal(dead_cookie, &self.path));
        }
        for c in chunker.cookies {
            response.cookie(c);
        }
        Ok(())
    }

    fn clear(&self, req: &HttpRequest, response: &mut HttpResponseBuilder) {
        CookieHelper::remove_cookies(req, response, &self.cookie_name, &self.path);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use actix_web::{cookie::SameSite, http::header, test::TestRequest, HttpResponse};

    pub(crate) const TEST_PASSPHRASE: &str = "0123456789abcdef0123456789abcdef";

    pub(crate) fn test_crypto() -> CookieCrypto {
        CookieCrypto::new(&Passphrase::new(TEST_PASSPHRASE).unwrap())
    }

    fn set_cookie_headers(response: HttpResponse) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .map(|header_value| header_value.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_remove_cookies() {
        // Create a TestRequest with some cookies
        let req = TestRequest::default()
            .cookie(Cookie::new("oidc_session_1", "value1"))
            .cookie(Cookie::new("oidc_session_2", "value2"))
            .cookie(Cookie::new("session_id", "session_value"))
            .to_http_request();

        let mut response = HttpResponse::Ok();

        // Act
        CookieHelper::remove_cookies(&req, &mut response, "oidc_session", "/");

        // Assert that only the prefixed cookies are marked for removal
        let response_cookies = set_cookie_headers(response.finish());
        assert!(response_cookies
            .iter()
            .any(|c| c.starts_with("oidc_session_1=; Path=/; Max-Age=0")));
        assert!(response_cookies
            .iter()
            .any(|c| c.starts_with("oidc_session_2=; Path=/; Max-Age=0")));
        assert!(!response_cookies.iter().any(|c| c.starts_with("session_id=")));
    }

    #[test]
    fn test_get_dead_cookies() {
        // Arrange
        let chunker = CookieChunker {
            cookie_name_prefix: "test_cookie".to_string(),
            cookies: vec![
                Cookie::new("test_cookie_1", "chunker_value1"),
                Cookie::new("test_cookie_2", "chunker_value2"),
                Cookie::new("test_cookie_3", "chunker_value3"),
            ],
        };

        let prior_cookies = vec![
            Cookie::new("test_cookie_1", "passed_value1"),
            Cookie::new("test_cookie_2", "passed_value2"),
            Cookie::new("test_cookie_4", "passed_value4"),
            Cookie::new("test_cookie_5", "passed_value5"),
            Cookie::new("other_cookie_1", "passed_value3"),
        ];

        // Act
        let dead_cookies = chunker.get_dead_cookies(&prior_cookies);

        // Assert
        assert_eq!(dead_cookies.len(), 2, "Expected two dead cookies");
        assert_eq!(dead_cookies[0].name(), "test_cookie_4");
        assert_eq!(dead_cookies[1].name(), "test_cookie_5");
    }

    #[test]
    fn test_cookie_attributes() {
        // Arrange
        let long_string = "This is a test string that will be split into multiple cookies.";
        let expiry = Expiration::DateTime(OffsetDateTime::now_utc());

        // Act
        let chunker = CookieChunker::from_string_with_size(
            long_string,
            "test_cookie",
            10,
            expiry,
            "/openid-connect",
        )
        .unwrap();

        // Assert
        for cookie in chunker.cookies {
            assert_eq!(cookie.http_only(), Some(true), "Cookie should be HTTP-only");
            assert_eq!(cookie.same_site(), Some(SameSite::Lax));
            assert_eq!(cookie.secure(), Some(true), "Cookie should be Secure");
            assert_eq!(cookie.path().unwrap(), "/openid-connect");
            assert_eq!(
                cookie.expires().unwrap().datetime().unwrap(),
                expiry.datetime().unwrap(),
            );
        }
    }

    #[macro_export]
    macro_rules! test_from_string_with_size {
        ($name:ident, $long_string:expr, $max_cookie_size:expr, $expected_values:expr) => {
            #[test]
            fn $name() {
                let cookie_name_prefix = "test_cookie";

                let result = CookieChunker::from_string_with_size(
                    $long_string,
                    cookie_name_prefix,
                    $max_cookie_size,
                    Expiration::DateTime(OffsetDateTime::now_utc()),
                    "/",
                );

                assert!(result.is_ok(), "Expected successful cookie chunking");

                let cookie_chunker = result.unwrap();

                assert_eq!(cookie_chunker.cookies.len(), $expected_values.len());

                for (i, cookie) in cookie_chunker.cookies.iter().enumerate() {
                    assert_eq!(cookie.name(), format!("{}_{}", cookie_name_prefix, i + 1));
                    assert_eq!(cookie.value(), $expected_values[i]);
                }
            }
        };
    }

    test_from_string_with_size!(
        test_ascii_string,
        "Hello, world! This is a test string.",
        5,
        vec!["Hello", ", wor", "ld! T", "his i", "s a t", "est s", "tring", "."]
    );

    test_from_string_with_size!(
        test_multibyte_string,
        "こんにちは世界",
        8,
        vec!["こん", "にち", "は世", "界"]
    );

    #[test]
    fn test_join_orders_by_part_number() {
        // Arrange
        let chunker = CookieChunker {
            cookie_name_prefix: "test_cookie".to_string(),
            cookies: vec![
                Cookie::new("test_cookie_2", "part 2."),
                Cookie::new("test_cookie_1", "part 1."),
                Cookie::new("test_cookie_10", "part 10."),
            ],
        };

        // Act
        let joined = chunker.join().unwrap();

        // Assert
        assert_eq!(joined, "part 1.part 2.part 10.");
    }

    #[test]
    fn test_join_invalid_part_number() {
        // Arrange
        let chunker = CookieChunker {
            cookie_name_prefix: "test_cookie".to_string(),
            cookies: vec![
                Cookie::new("test_cookie_1", "This is part 1."),
                Cookie::new("test_cookie_foo", "Invalid part number"),
            ],
        };

        // Act
        let result = chunker.join();

        // Assert
        assert!(matches!(
            result,
            Err(ChunkerError::InvalidPartNumber { cookie_name }) if cookie_name == "test_cookie_foo"
        ));
    }

    #[test]
    fn test_from_cookies_no_matches() {
        // Arrange
        let cookies = [
            Cookie::new("other_cookie_1", "value1"),
            Cookie::new("another_cookie_2", "value2"),
        ];

        // Act
        let chunker = CookieChunker::from_cookies(&cookies, "test_cookie");

        // Assert
        assert!(matches!(chunker, Err(ChunkerError::Empty { prefix }) if prefix == "test_cookie"));
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        // Arrange
        let crypto = test_crypto();

        // Act
        let sealed = crypto.encrypt("{\"sub\":\"alice\"}").unwrap();
        let opened = crypto.decrypt(&sealed).unwrap();

        // Assert
        assert!(!sealed.contains("alice"));
        assert_eq!(opened, "{\"sub\":\"alice\"}");
    }

    #[test]
    fn test_decrypt_with_other_passphrase_fails() {
        // Arrange
        let sealed = test_crypto().encrypt("secret").unwrap();
        let other = CookieCrypto::new(&Passphrase::new("fedcba9876543210fedcba9876543210").unwrap());

        // Act
        let result = other.decrypt(&sealed);

        // Assert
        assert!(matches!(result, Err(ChunkerError::AesGcm(_))));
    }

    #[test]
    fn test_decrypt_short_input_fails() {
        let result = test_crypto().decrypt("abcd");

        assert!(matches!(result, Err(ChunkerError::AesGcm(_))));
    }

    #[test]
    fn test_cookie_session_defaults() {
        let session = CookieSession::from_options(&BackendOptions::default()).unwrap();

        assert_eq!(session.cookie_name, "oidc_session");
        assert_eq!(session.path, "/");
        assert_eq!(session.max_age(), Duration::from_secs(60 * 60 * 24 * 3));
    }

    #[test]
    fn test_cookie_session_rejects_bad_options() {
        let unknown: BackendOptions = "secure=false".parse().unwrap();
        let zero: BackendOptions = "max_age=0".parse().unwrap();
        let relative: BackendOptions = "path=app".parse().unwrap();

        assert!(CookieSession::from_options(&unknown).is_err());
        assert!(CookieSession::from_options(&zero).is_err());
        assert!(CookieSession::from_options(&relative).is_err());
    }

    #[test]
    fn test_cookie_session_caps_max_age() {
        let at_cap: BackendOptions = format!("max_age={}", i32::MAX).parse().unwrap();
        let too_long: BackendOptions = "max_age=100000000000000".parse().unwrap();

        assert!(CookieSession::from_options(&at_cap).is_ok());
        assert!(
            matches!(CookieSession::from_options(&too_long), Err(reason) if reason.contains("max_age"))
        );
    }

    #[test]
    fn test_from_cookies_skips_foreign_cookies_sharing_prefix() {
        // Arrange
        let cookies = [
            Cookie::new("oidc_session_id", "other app"),
            Cookie::new("oidc_sessionX", "other app"),
            Cookie::new("oidc_session_1", "sealed"),
        ];

        // Act
        let joined = CookieChunker::from_cookies(&cookies, "oidc_session")
            .unwrap()
            .join();

        // Assert
        assert_eq!(joined.unwrap(), "sealed");
    }

    #[test]
    fn test_cookie_session_load_with_only_foreign_cookie_is_none() {
        let session = CookieSession::from_options(&BackendOptions::default()).unwrap();
        let req = TestRequest::default()
            .cookie(Cookie::new("oidc_session_id", "x"))
            .to_http_request();

        assert!(session.load(&req).unwrap().is_none());
    }

    #[test]
    fn test_cookie_session_load_without_cookies_is_none() {
        let session = CookieSession::from_options(&BackendOptions::default()).unwrap();
        let req = TestRequest::default().to_http_request();

        assert!(session.load(&req).unwrap().is_none());
    }

    #[test]
    fn test_cookie_session_store_then_load() {
        // Arrange
        let session = CookieSession::from_options(&BackendOptions::default()).unwrap();
        let sealed = "a".repeat(4_000);
        let req = TestRequest::default()
            .cookie(Cookie::new("oidc_session_3", "stale"))
            .to_http_request();
        let mut response = HttpResponse::Ok();

        // Act
        session.store(&req, &sealed, &mut response).unwrap();
        let response = response.finish();

        // Assert
        let written: Vec<Cookie> = response.cookies().collect();
        assert!(written
            .iter()
            .any(|c| c.name() == "oidc_session_3" && c.value().is_empty()));

        let mut next = TestRequest::default();
        for c in written.iter().filter(|c| !c.value().is_empty()) {
            next = next.cookie(c.clone().into_owned());
        }
        let loaded = session.load(&next.to_http_request()).unwrap();
        assert_eq!(loaded, Some(sealed));
    }
}
