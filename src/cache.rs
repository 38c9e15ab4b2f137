//! Short-lived cache of rendered images
//!
//! Keys are `<tenant>:<digest>:<settings>` where the digest covers the
//! template id and data (or the raw HTML), so a tenant's renders can be
//! dropped by prefix.
//!
//! Every invalidation bumps a generation. A render reads it before it starts
//! and hands it back to [`RenderCache::insert`], which drops the image if an
//! invalidation happened in between.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;
use sha2::{Digest, Sha256};

use crate::renderer::RenderedImage;
use crate::ChannelDefaults;

/// Bytes of the SHA-256 digest kept in the key
const DIGEST_PREFIX_LEN: usize = 8;

struct Entry {
    image: RenderedImage,
    stored_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    generation: u64,
}

/// TTL cache of [`RenderedImage`]s; a zero TTL disables it
pub struct RenderCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl RenderCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Cache key for rendering `subject` (template id) with `payload` (data
    /// or HTML) under `settings`.
    pub fn key(tenant_id: &str, subject: &str, payload: &[u8], settings: &ChannelDefaults) -> String {
        let mut hasher = Sha256::new();
        hasher.update(subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload);
        let digest = hasher.finalize();

        format!(
            "{}:{}:{}x{}:{}:{}:{}",
            tenant_id,
            hex::encode(&digest[..DIGEST_PREFIX_LEN]),
            settings.width,
            settings.max_height,
            settings.format,
            settings.quality,
            settings.scale
        )
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current invalidation generation; pass it to [`RenderCache::insert`].
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn get(&self, key: &str) -> Option<RenderedImage> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state();
        let expired = match state.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                debug!("Render cache hit: {}", key);
                return Some(entry.image.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
        }
        None
    }

    /// Store `image` unless the cache was invalidated after `generation`
    /// was read. Returns whether it was stored.
    pub fn insert(&self, key: String, image: RenderedImage, generation: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.state();
        if state.generation != generation {
            debug!("Discarding render started before an invalidation: {}", key);
            return false;
        }
        let ttl = self.ttl;
        state.entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        state.entries.insert(
            key,
            Entry {
                image,
                stored_at: Instant::now(),
            },
        );
        true
    }

    /// Drop every render of one tenant.
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        let prefix = format!("{}:", tenant_id);
        let mut state = self.state();
        state.entries.retain(|key, _| !key.starts_with(&prefix));
        state.generation += 1;
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
