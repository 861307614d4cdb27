//! Author avatar cache.
//!
//! Menu lines can carry an inline image as base64. Avatars are fetched over
//! HTTP once, stored as base64 text under `avatars/<login>.b64`, and reused
//! until they are older than the configured TTL. Any failure just means the
//! line renders without an image.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use color_eyre::eyre::{Result, WrapErr, bail};

use crate::pool;
use crate::state;

/// Requested avatar edge length in pixels.
const AVATAR_SIZE: u32 = 32;

pub struct AvatarCache {
    dir: PathBuf,
    client: reqwest::Client,
    ttl: Duration,
}

impl AvatarCache {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build HTTP client")?;
        Ok(Self {
            dir: dir.into(),
            client,
            ttl,
        })
    }

    fn path_for(&self, login: &str) -> PathBuf {
        let safe: String = login
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.b64"))
    }

    fn read_fresh(&self, login: &str) -> Option<String> {
        let path = self.path_for(login);
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > self.ttl {
            return None;
        }
        let encoded = std::fs::read_to_string(&path).ok()?;
        let encoded = encoded.trim();
        (!encoded.is_empty()).then(|| encoded.to_string())
    }

    async fn download(&self, url: &str) -> Result<String> {
        let sep = if url.contains('?') { '&' } else { '?' };
        let url = format!("{url}{sep}s={AVATAR_SIZE}");
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            bail!("avatar request returned {}", resp.status());
        }
        let bytes = resp.bytes().await?;
        Ok(STANDARD.encode(&bytes))
    }

    /// Base64 image for `login`, from cache or fetched from `url`.
    pub async fn get(&self, login: &str, url: &str) -> Option<String> {
        if let Some(cached) = self.read_fresh(login) {
            return Some(cached);
        }
        match self.download(url).await {
            Ok(encoded) => {
                if let Err(e) = state::write_atomic(&self.path_for(login), encoded.as_bytes()) {
                    tracing::debug!("could not cache avatar for {login}: {e}");
                }
                Some(encoded)
            }
            Err(e) => {
                tracing::debug!("avatar for {login} unavailable: {e}");
                None
            }
        }
    }

    /// Resolve avatars for many authors in parallel. Missing ones are left out.
    pub async fn get_many(
        self: Arc<Self>,
        authors: Vec<(String, String)>,
        workers: usize,
    ) -> HashMap<String, String> {
        let results = pool::bounded(authors, workers, move |(login, url)| {
            let cache = Arc::clone(&self);
            async move {
                let image = cache.get(&login, &url).await;
                (login, image)
            }
        })
        .await;

        results
            .into_iter()
            .filter_map(|(login, image)| image.map(|i| (login, i)))
            .collect()
    }
}
