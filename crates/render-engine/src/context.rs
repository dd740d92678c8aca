//! Process-wide headless rendering context.
//!
//! Batch units acquire the context before rendering and release it when
//! done. The first acquirer creates it; it is torn down when the last
//! holder releases it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use montage_common::clock::PlaybackClock;
use montage_common::logging::PACKAGE_TARGET;

static CONTEXT: Mutex<Weak<RenderContext>> = Mutex::new(Weak::new());

/// Shared state of headless rendering.
#[derive(Debug)]
pub struct RenderContext {
    clock: PlaybackClock,
    frames: AtomicU64,
}

impl RenderContext {
    /// Return the live context, creating it if nobody holds one.
    pub fn acquire() -> Arc<RenderContext> {
        let mut slot = CONTEXT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(context) = slot.upgrade() {
            return context;
        }
        let context = Arc::new(RenderContext {
            clock: PlaybackClock::start(),
            frames: AtomicU64::new(0),
        });
        tracing::debug!(
            target: PACKAGE_TARGET,
            epoch = %context.clock.epoch_wall(),
            "Render context created"
        );
        *slot = Arc::downgrade(&context);
        context
    }

    /// Give up a holder's reference.
    pub fn release(context: Arc<RenderContext>) {
        let holders = Arc::strong_count(&context);
        if holders == 1 {
            tracing::debug!(
                target: PACKAGE_TARGET,
                frames = context.frames(),
                secs = context.clock.elapsed_secs(),
                "Render context released"
            );
        }
        drop(context);
    }

    /// Whether any holder keeps the context alive.
    pub fn is_live() -> bool {
        CONTEXT
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .strong_count()
            > 0
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames rendered by every holder since the context was created.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}
