/// Passphrase used to seal session and challenge state. Must be 32 bytes.
pub(crate) const PASSPHRASE: &str = "PASSPHRASE";

/// Scheme and host prepended to relative redirect URIs, e.g. `https://app.example.com`.
pub(crate) const REDIRECT_DOMAIN: &str = "REDIRECT_DOMAIN";
