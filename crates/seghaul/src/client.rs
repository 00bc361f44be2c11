// HTTP clients: a pool of reqwest clients keyed by profile name, and the text
// fetcher used for manifests.
//
// Clients are built lazily and tagged with the pool's configuration version;
// replacing profiles bumps the version so stale clients are rebuilt on next use.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DEFAULT_PROFILE, HttpProfile};
use crate::error::DownloadError;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Convert a name/value map into request headers.
pub fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, DownloadError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            DownloadError::configuration(format!("invalid header name `{name}`: {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            DownloadError::configuration(format!("invalid value for header {name}: {e}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Build a client for one profile.
pub fn build_client(profile: &HttpProfile) -> Result<reqwest::Client, DownloadError> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(&profile.user_agent)
        .default_headers(header_map(&profile.headers)?)
        .redirect(if profile.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        })
        .danger_accept_invalid_certs(profile.danger_accept_invalid_certs);

    if profile.connect_timeout_secs > 0 {
        builder = builder.connect_timeout(Duration::from_secs(profile.connect_timeout_secs));
    }
    if profile.pool_max_idle_per_host > 0 {
        builder = builder.pool_max_idle_per_host(profile.pool_max_idle_per_host);
    }

    if let Some(proxy_config) = &profile.proxy {
        let mut proxy = reqwest::Proxy::all(&proxy_config.url).map_err(|e| {
            DownloadError::configuration(format!("invalid proxy URL `{}`: {e}", proxy_config.url))
        })?;
        if let (Some(username), Some(password)) = (&proxy_config.username, &proxy_config.password)
        {
            proxy = proxy.basic_auth(username, password);
        }
        builder = builder.proxy(proxy);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy");
    } else if !profile.use_system_proxy {
        builder = builder.no_proxy();
        debug!("Proxy disabled");
    }

    builder.build().map_err(DownloadError::from)
}

/// Reference-counted (via `Arc`) pool of HTTP clients keyed by profile name.
#[derive(Debug)]
pub struct ClientPool {
    profiles: RwLock<HashMap<String, HttpProfile>>,
    clients: RwLock<HashMap<String, (u64, reqwest::Client)>>,
    version: AtomicU64,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl ClientPool {
    /// A [`DEFAULT_PROFILE`] entry is added when `profiles` lacks one.
    pub fn new(mut profiles: HashMap<String, HttpProfile>) -> Self {
        profiles
            .entry(DEFAULT_PROFILE.to_string())
            .or_default();
        Self {
            profiles: RwLock::new(profiles),
            clients: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace every profile. Built clients become stale.
    pub fn replace_profiles(&self, profiles: HashMap<String, HttpProfile>) {
        let mut current = self.profiles.write();
        *current = profiles;
        current.entry(DEFAULT_PROFILE.to_string()).or_default();
        self.version.fetch_add(1, Ordering::AcqRel);
        self.clients.write().clear();
    }

    /// Add or replace one profile. Built clients become stale.
    pub fn upsert_profile(&self, name: impl Into<String>, profile: HttpProfile) {
        self.profiles.write().insert(name.into(), profile);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// The client for `name`, built on first use or after a configuration change.
    pub fn client(&self, name: &str) -> Result<reqwest::Client, DownloadError> {
        let version = self.version();
        if let Some((built_at, client)) = self.clients.read().get(name)
            && *built_at == version
        {
            return Ok(client.clone());
        }

        let profile = self.profiles.read().get(name).cloned().ok_or_else(|| {
            DownloadError::configuration(format!("unknown HTTP client profile `{name}`"))
        })?;
        let client = build_client(&profile)?;
        debug!(profile = name, version, "Built HTTP client");
        self.clients
            .write()
            .insert(name.to_string(), (version, client.clone()));
        Ok(client)
    }

    #[cfg(test)]
    fn cached_version(&self, name: &str) -> Option<u64> {
        self.clients.read().get(name).map(|(v, _)| *v)
    }
}

/// Fetches text documents (pages, manifests).
#[async_trait]
pub trait HttpHelper: Send + Sync {
    async fn get_text(&self, url: &Url, token: &CancellationToken) -> Result<String, DownloadError>;
}

/// [`HttpHelper`] over a reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestHelper {
    client: reqwest::Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl ReqwestHelper {
    pub fn new(client: reqwest::Client, headers: HeaderMap, timeout: Option<Duration>) -> Self {
        Self {
            client,
            headers,
            timeout,
        }
    }
}

#[async_trait]
impl HttpHelper for ReqwestHelper {
    async fn get_text(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let mut request = self.client.get(url.clone()).headers(self.headers.clone());
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let fetch = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                warn!(%url, %status, "Manifest request failed");
                return Err(DownloadError::http_status(status, url.as_str(), "fetch text"));
            }
            Ok::<_, DownloadError>(response.text().await?)
        };

        tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            result = fetch => result,
        }
    }
}
