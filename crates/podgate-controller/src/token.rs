use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use hmac::{Hmac, Mac};

use parking_lot::RwLock;

use sha2::Sha256;

use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Validity window of a freshly signed credential.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Minimum remaining validity a cached credential must have to be reused.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// A source of the current time, expressed as seconds since the Unix epoch.
pub trait Clock: std::fmt::Debug + Send + Sync {
    /// Returns the current Unix time in seconds.
    fn now(&self) -> u64;
}

/// A [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

/// A signed, time-bounded credential presented on each registry call.
///
/// A credential is never mutated: a refresh replaces it with a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCredential {
    token: String,
    issued_at: u64,
    expires_at: u64,
}

impl SignedCredential {
    /// Returns the credential string to place in the `Authorization` header.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the Unix time at which the credential has been signed.
    #[must_use]
    pub const fn issued_at(&self) -> u64 {
        self.issued_at
    }

    /// Returns the Unix time at which the credential expires.
    #[must_use]
    pub const fn expires_at(&self) -> u64 {
        self.expires_at
    }

    // Still usable only if it outlives the safety margin.
    fn is_fresh_at(&self, now: u64) -> bool {
        now < self.expires_at.saturating_sub(SAFETY_MARGIN.as_secs())
    }
}

/// A cache of [`SignedCredential`]s for the remote registry.
///
/// Reads of a still-fresh credential only take a shared lock. A refresh takes
/// the exclusive lock and checks freshness again, so concurrent callers never
/// install two different credentials.
pub struct TokenCache {
    resource_uri: String,
    policy_name: String,
    mac: HmacSha256,
    clock: Arc<dyn Clock>,
    cached: RwLock<Option<SignedCredential>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("resource_uri", &self.resource_uri)
            .field("policy_name", &self.policy_name)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Creates a [`TokenCache`] driven by the system clock.
    ///
    /// # Errors
    ///
    /// A configuration error is returned if any registry setting is missing
    /// or if the policy key is not valid base64.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a [`TokenCache`] driven by the given [`Clock`].
    ///
    /// # Errors
    ///
    /// A configuration error is returned if any registry setting is missing
    /// or if the policy key is not valid base64.
    pub fn with_clock(config: &RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let key = config.validate()?;
        let mac = <HmacSha256 as Mac>::new_from_slice(&key)
            .map_err(|e| Error::configuration(format!("Invalid registry policy key: {e}")))?;

        Ok(Self {
            resource_uri: config.host.trim().to_string(),
            policy_name: config.policy_name.trim().to_string(),
            mac,
            clock,
            cached: RwLock::new(None),
        })
    }

    /// Returns a credential string with at least [`SAFETY_MARGIN`] of
    /// remaining validity, signing a new one if needed.
    pub fn token(&self) -> String {
        self.credential().token
    }

    /// Returns a [`SignedCredential`] with at least [`SAFETY_MARGIN`] of
    /// remaining validity, signing a new one if needed.
    pub fn credential(&self) -> SignedCredential {
        let now = self.clock.now();

        if let Some(credential) = self.cached.read().as_ref()
            && credential.is_fresh_at(now)
        {
            return credential.clone();
        }

        let mut cached = self.cached.write();

        // Another caller may have refreshed it while waiting for the lock.
        if let Some(credential) = cached.as_ref()
            && credential.is_fresh_at(now)
        {
            return credential.clone();
        }

        let credential = self.sign(now);
        debug!(
            "Signed a new registry credential, expiring at {}",
            credential.expires_at
        );
        *cached = Some(credential.clone());
        credential
    }

    fn sign(&self, now: u64) -> SignedCredential {
        let expires_at = now + TOKEN_LIFETIME.as_secs();
        let token = sign_token(
            self.mac.clone(),
            &self.resource_uri,
            &self.policy_name,
            expires_at,
        );

        SignedCredential {
            token,
            issued_at: now,
            expires_at,
        }
    }
}

/// Generates a shared access signature for `resource_uri` which expires at
/// the `expiry` Unix time.
///
/// # Errors
///
/// A configuration error is returned if the key is not valid base64.
pub fn generate_sas_token(
    resource_uri: &str,
    key: &str,
    policy_name: &str,
    expiry: u64,
) -> Result<String> {
    let key = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::configuration(format!("Registry policy key is not base64: {e}")))?;
    let mac = <HmacSha256 as Mac>::new_from_slice(&key)
        .map_err(|e| Error::configuration(format!("Invalid registry policy key: {e}")))?;

    Ok(sign_token(mac, resource_uri, policy_name, expiry))
}

fn sign_token(mut mac: HmacSha256, resource_uri: &str, policy_name: &str, expiry: u64) -> String {
    let encoded_uri = quote_plus(resource_uri);

    mac.update(format!("{encoded_uri}\n{expiry}").as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}&skn={policy_name}",
        quote_plus(&signature)
    )
}

// Form-style percent encoding: unreserved characters are kept,
// spaces become `+`.
pub(crate) fn quote_plus(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    use crate::config::RegistryConfig;

    use super::{
        Clock, SAFETY_MARGIN, TOKEN_LIFETIME, TokenCache, generate_sas_token, quote_plus,
    };

    pub(crate) const HOST: &str = "myhub.azure-devices.net";
    pub(crate) const POLICY_NAME: &str = "iothubowner";
    pub(crate) const POLICY_KEY: &str = "cG9kZ2F0ZS10ZXN0LXNoYXJlZC1zZWNyZXQtMDAwMQ==";

    const START: u64 = 1_700_000_000;
    const EXPECTED_TOKEN: &str = "SharedAccessSignature sr=myhub.azure-devices.net\
        &sig=CiYq6ZSpekPLR%2F95O6L%2FKbXAafe3NU3%2BbgsTb%2F4Je7M%3D\
        &se=1700003600&skn=iothubowner";

    #[derive(Debug)]
    pub(crate) struct ManualClock(AtomicU64);

    impl ManualClock {
        pub(crate) fn new(now: u64) -> Self {
            Self(AtomicU64::new(now))
        }

        pub(crate) fn advance(&self, seconds: u64) {
            let _ = self.0.fetch_add(seconds, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn registry_config() -> RegistryConfig {
        RegistryConfig::new(HOST, POLICY_NAME, POLICY_KEY)
    }

    fn cache_at(now: u64) -> (Arc<ManualClock>, TokenCache) {
        let clock = Arc::new(ManualClock::new(now));
        let cache = TokenCache::with_clock(&registry_config(), clock.clone()).unwrap();
        (clock, cache)
    }

    #[test]
    fn known_signature() {
        assert_eq!(
            generate_sas_token(HOST, POLICY_KEY, POLICY_NAME, START + 3600).unwrap(),
            EXPECTED_TOKEN
        );

        let (_, cache) = cache_at(START);
        assert_eq!(cache.token(), EXPECTED_TOKEN);
    }

    #[test]
    fn reuse_within_window() {
        let (clock, cache) = cache_at(START);

        let first = cache.credential();
        assert_eq!(first.issued_at(), START);
        assert_eq!(first.expires_at(), START + TOKEN_LIFETIME.as_secs());

        // Last second before entering the safety margin.
        clock.advance(TOKEN_LIFETIME.as_secs() - SAFETY_MARGIN.as_secs() - 1);
        assert_eq!(cache.credential(), first);
        assert_eq!(cache.token(), first.token());
    }

    #[test]
    fn refresh_inside_safety_margin() {
        let (clock, cache) = cache_at(START);
        let first = cache.credential();

        clock.advance(TOKEN_LIFETIME.as_secs() - SAFETY_MARGIN.as_secs());
        let now = clock.now();

        let second = cache.credential();
        assert_ne!(second.token(), first.token());
        assert_eq!(second.issued_at(), now);
        assert!(second.expires_at() >= now + TOKEN_LIFETIME.as_secs());

        // The refreshed credential is cached in turn.
        assert_eq!(cache.credential(), second);
    }

    #[test]
    fn concurrent_callers_share_one_credential() {
        let (_, cache) = cache_at(START);
        let cache = Arc::new(cache);

        let tokens: Vec<String> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.token())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert!(tokens.iter().all(|token| token == EXPECTED_TOKEN));
    }

    #[test]
    fn missing_secret() {
        let config = RegistryConfig::new(HOST, POLICY_NAME, "");
        assert!(TokenCache::new(&config).is_err());
    }

    #[test]
    fn quote_plus_encoding() {
        assert_eq!(quote_plus("my-hub.azure_devices.net~"), "my-hub.azure_devices.net~");
        assert_eq!(quote_plus("a+b/c=="), "a%2Bb%2Fc%3D%3D");
        assert_eq!(quote_plus("a b"), "a+b");
        assert_eq!(quote_plus("sb://hub/devices?x"), "sb%3A%2F%2Fhub%2Fdevices%3Fx");
    }
}
