// Segment decryption: key resolution with a per-URI cache and AES-128-CBC
// decryption offloaded to the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use async_trait::async_trait;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use moka::future::Cache;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::DownloadError;
use crate::manifest::{KeyMethod, SegmentKey};
use crate::retry::{RetryAction, RetryPolicy, retry_with_delay};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

/// Where key bytes come from.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch_key(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<[u8; KEY_LEN], DownloadError>;
}

// --- KeyFetcher ---
// Fetches raw key bytes over HTTP, retrying transient failures. Once its own
// attempts are spent the key is reported unavailable, which the segment retry
// loop does not repeat.
pub struct KeyFetcher {
    client: reqwest::Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
    policy: RetryPolicy,
}

impl KeyFetcher {
    pub fn new(
        client: reqwest::Client,
        headers: HeaderMap,
        timeout: Option<Duration>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            headers,
            timeout,
            policy,
        }
    }

    async fn fetch_once(&self, uri: &str) -> Result<[u8; KEY_LEN], DownloadError> {
        let mut request = self.client.get(uri).headers(self.headers.clone());
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, uri, "key fetch"));
        }
        let bytes = response.bytes().await?;
        <[u8; KEY_LEN]>::try_from(bytes.as_ref()).map_err(|_| {
            DownloadError::transient(
                uri,
                format!("key has {} bytes, expected {KEY_LEN}", bytes.len()),
            )
        })
    }
}

#[async_trait]
impl KeySource for KeyFetcher {
    async fn fetch_key(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<[u8; KEY_LEN], DownloadError> {
        retry_with_delay(&self.policy, token, |_, _| {}, |_| async {
            tokio::select! {
                _ = token.cancelled() => RetryAction::Fail(DownloadError::Cancelled),
                result = self.fetch_once(uri) => RetryAction::from_result(result),
            }
        })
        .await
        .map_err(|failure| match failure.error {
            DownloadError::Cancelled => DownloadError::Cancelled,
            error => DownloadError::KeyUnavailable {
                uri: uri.to_string(),
                reason: format!("{error} (after {} attempts)", failure.attempts),
            },
        })
    }
}

/// Keys known up front.
#[derive(Debug, Default, Clone)]
pub struct StaticKeySource {
    keys: std::collections::HashMap<String, [u8; KEY_LEN]>,
}

impl StaticKeySource {
    pub fn new(keys: impl IntoIterator<Item = (String, [u8; KEY_LEN])>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch_key(
        &self,
        uri: &str,
        _token: &CancellationToken,
    ) -> Result<[u8; KEY_LEN], DownloadError> {
        self.keys
            .get(uri)
            .copied()
            .ok_or_else(|| DownloadError::configuration(format!("no key registered for {uri}")))
    }
}

/// HLS default IV: the sequence number as a 128-bit big-endian integer.
pub fn sequence_iv(index: u64) -> [u8; BLOCK_LEN] {
    let mut iv = [0u8; BLOCK_LEN];
    iv[8..].copy_from_slice(&index.to_be_bytes());
    iv
}

/// The declared IV, or the sequence-number IV when none is declared.
pub fn iv_for(key: &SegmentKey, index: u64) -> [u8; BLOCK_LEN] {
    key.iv.unwrap_or_else(|| sequence_iv(index))
}

/// AES-128-CBC decryption with PKCS#7 padding removal.
///
/// A ciphertext that is not a whole number of blocks is reported as corrupt
/// (likely truncated in transit); a padding failure on a well-sized
/// ciphertext points at a wrong key or IV and is not.
pub fn decrypt(
    mut data: Vec<u8>,
    key: &[u8; KEY_LEN],
    iv: &[u8; BLOCK_LEN],
    index: u64,
) -> Result<Vec<u8>, DownloadError> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(DownloadError::Decryption {
            index,
            reason: format!(
                "ciphertext length {} is not a positive multiple of {BLOCK_LEN}",
                data.len()
            ),
            corrupt: true,
        });
    }

    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| DownloadError::Decryption {
        index,
        reason: format!("failed to initialize AES decryptor: {e}"),
        corrupt: false,
    })?;

    let plain_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut data)
        .map_err(|_| DownloadError::Decryption {
            index,
            reason: "invalid PKCS#7 padding".to_string(),
            corrupt: false,
        })?
        .len();
    data.truncate(plain_len);
    Ok(data)
}

/// Resolves keys (fetched once per URI) and decrypts segment payloads.
pub struct SegmentDecryptor {
    source: Arc<dyn KeySource>,
    keys: Cache<String, [u8; KEY_LEN]>,
}

impl SegmentDecryptor {
    pub fn new(source: Arc<dyn KeySource>) -> Self {
        Self {
            source,
            keys: Cache::builder().max_capacity(1024).build(),
        }
    }

    /// Key bytes for `key`, or `None` for unencrypted segments.
    ///
    /// Concurrent callers asking for the same URI share a single fetch.
    pub async fn resolve_key(
        &self,
        key: &SegmentKey,
        token: &CancellationToken,
    ) -> Result<Option<[u8; KEY_LEN]>, DownloadError> {
        match &key.method {
            KeyMethod::None => Ok(None),
            KeyMethod::Aes128 => {
                let uri = key.uri.clone().ok_or_else(|| DownloadError::UnsupportedEncryption {
                    method: "AES-128 without key URI".to_string(),
                })?;
                let source = self.source.clone();
                let fetch_uri = uri.clone();
                let token = token.clone();
                self.keys
                    .try_get_with(uri.clone(), async move {
                        debug!(uri = %fetch_uri, "Fetching decryption key");
                        source.fetch_key(&fetch_uri, &token).await
                    })
                    .await
                    .map(Some)
                    .map_err(|shared| {
                        // Waiters that shared the fetch see the same
                        // retryability as the caller that ran it.
                        Arc::try_unwrap(shared).unwrap_or_else(|shared| match shared.as_ref() {
                            DownloadError::Cancelled => DownloadError::Cancelled,
                            other if other.is_retryable() => {
                                DownloadError::transient(uri, other.to_string())
                            }
                            other => DownloadError::KeyUnavailable {
                                uri,
                                reason: other.to_string(),
                            },
                        })
                    })
            }
            other => Err(DownloadError::UnsupportedEncryption {
                method: other.as_str().to_string(),
            }),
        }
    }

    /// Decrypt `data` for the segment with sequence number `index`.
    /// Unencrypted segments are returned unchanged.
    pub async fn decrypt_segment(
        &self,
        data: Vec<u8>,
        key: &SegmentKey,
        index: u64,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, DownloadError> {
        let Some(key_bytes) = self.resolve_key(key, token).await? else {
            return Ok(data);
        };
        let iv = iv_for(key, index);
        trace!(index, iv = %hex::encode(iv), "Decrypting segment");
        tokio::task::spawn_blocking(move || decrypt(data, &key_bytes, &iv, index))
            .await
            .map_err(|e| DownloadError::Internal {
                reason: format!("decryption task failed: {e}"),
            })?
    }
}
