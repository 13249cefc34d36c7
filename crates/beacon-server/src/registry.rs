//! The site registry: a concurrency-safe map of live sites with explicit
//! acquire/release reference accounting and idle eviction.
//!
//! Sessions hold a [`SiteHandle`] for as long as they are attached; a site
//! becomes an eviction candidate only when its last handle is released and
//! it has sat idle past the configured window.

use beacon_types::SiteId;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::site::Site;

struct Slot {
    site: Arc<Site>,
    refs: usize,
    idle_since: Option<Instant>,
}

/// Owns every live site.
pub struct SiteRegistry {
    inner: Mutex<HashMap<SiteId, Slot>>,
    weak_self: Weak<SiteRegistry>,
}

impl SiteRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SiteRegistry>| Self {
            inner: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }

    /// Acquires a handle on an existing site.
    pub fn acquire(&self, site_id: SiteId) -> Option<SiteHandle> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.get_mut(&site_id)?;
        slot.refs += 1;
        slot.idle_since = None;
        Some(SiteHandle {
            registry: self.weak_self.clone(),
            site: slot.site.clone(),
        })
    }

    /// Acquires a handle, materializing the site through `init` when it is
    /// not resident.
    pub fn acquire_or_insert(
        &self,
        site_id: SiteId,
        init: impl FnOnce() -> Arc<Site>,
    ) -> SiteHandle {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.entry(site_id).or_insert_with(|| {
            tracing::info!(site_id, "materializing site");
            Slot {
                site: init(),
                refs: 0,
                idle_since: None,
            }
        });
        slot.refs += 1;
        slot.idle_since = None;
        SiteHandle {
            registry: self.weak_self.clone(),
            site: slot.site.clone(),
        }
    }

    fn release(&self, site_id: SiteId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.get_mut(&site_id) {
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 {
                slot.idle_since = Some(Instant::now());
            }
        }
    }

    /// Evicts sites whose last handle was released longer than `max_idle`
    /// ago. Returns how many were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|site_id, slot| {
            let keep = slot.refs > 0
                || slot
                    .idle_since
                    .is_none_or(|idle_since| now < idle_since + max_idle);
            if !keep {
                tracing::info!(site_id, "evicting idle site");
            }
            keep
        });
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// A reference-counted lease on a site. Releasing the last handle starts
/// the idle clock.
pub struct SiteHandle {
    registry: Weak<SiteRegistry>,
    site: Arc<Site>,
}

impl SiteHandle {
    pub fn site(&self) -> &Arc<Site> {
        &self.site
    }
}

impl Deref for SiteHandle {
    type Target = Site;

    fn deref(&self) -> &Site {
        &self.site
    }
}

impl Drop for SiteHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.site.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::SiteKind;

    fn make_site(id: SiteId) -> Arc<Site> {
        Site::new(id, SiteKind::MultiService, 30)
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_miss_then_insert() {
        let registry = SiteRegistry::new();
        assert!(registry.acquire(4).is_none());

        let handle = registry.acquire_or_insert(4, || make_site(4));
        assert_eq!(handle.id(), 4);
        assert_eq!(registry.len(), 1);

        // A second acquire sees the same site.
        let again = registry.acquire(4).expect("site resident");
        assert!(Arc::ptr_eq(again.site(), handle.site()));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_spares_held_and_recently_released_sites() {
        let registry = SiteRegistry::new();
        let held = registry.acquire_or_insert(1, || make_site(1));
        {
            let _released = registry.acquire_or_insert(2, || make_site(2));
        }

        // Site 2 just went idle; nothing is old enough yet.
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(registry.len(), 1);
        drop(held);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_clears_the_idle_clock() {
        let registry = SiteRegistry::new();
        {
            let _handle = registry.acquire_or_insert(1, || make_site(1));
        }
        tokio::time::sleep(Duration::from_secs(50)).await;

        // Touching the site resets idleness.
        let _handle = registry.acquire(1).expect("site resident");
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 0);
    }
}
