//! Live exchange client registry.
//!
//! Anything that can talk to a live exchange registers itself here for as long
//! as it exists. Replay refuses to start while any registration is alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error};

use super::ReplayError;

static LIVE_CLIENTS: AtomicUsize = AtomicUsize::new(0);

/// Held by a live client; dropping it releases the registration.
#[derive(Debug)]
#[must_use = "the registration is released when dropped"]
pub struct LiveClientRegistration {
    name: String,
}

impl LiveClientRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LiveClientRegistration {
    fn drop(&mut self) {
        LIVE_CLIENTS.fetch_sub(1, Ordering::SeqCst);
        debug!(client = %self.name, "live client released");
    }
}

pub fn register_live_client(name: impl Into<String>) -> LiveClientRegistration {
    let name = name.into();
    LIVE_CLIENTS.fetch_add(1, Ordering::SeqCst);
    debug!(client = %name, "live client registered");
    LiveClientRegistration { name }
}

pub fn live_client_count() -> usize {
    LIVE_CLIENTS.load(Ordering::SeqCst)
}

/// Fail if any live client exists in this process.
pub fn ensure_no_live_client() -> Result<(), ReplayError> {
    let count = live_client_count();
    if count > 0 {
        error!(count, "refusing to replay with live exchange clients present");
        return Err(ReplayError::LiveClientPresent { count });
    }
    Ok(())
}
