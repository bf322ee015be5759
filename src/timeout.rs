//! Wall-clock safety timer for stages that wait on the peer.
//!
//! A machine arms the timer when it starts waiting and every transition
//! disarms it again; if the window elapses first, the registry-installed
//! callback injects the timeout event through the normal dispatch path so it
//! serialises with everything else.

use crate::SwapId;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::oneshot;

pub type TimeoutCallback = Arc<dyn Fn(SwapId) + Send + Sync>;

pub struct TimeoutService {
    window: Duration,
    callback: RwLock<Option<TimeoutCallback>>,
    pending: Mutex<HashMap<SwapId, oneshot::Sender<()>>>,
}

impl TimeoutService {
    pub fn new(window: Duration) -> Self {
        TimeoutService {
            window,
            callback: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Installed once by the registry on startup.
    pub fn set_callback(&self, callback: TimeoutCallback) {
        *self.callback.write().expect("callback lock poisoned") = Some(callback);
    }

    /// Starts the window for `swap_id`, replacing (and thereby cancelling) any
    /// window already running for it.
    pub fn arm(&self, swap_id: SwapId) {
        let callback = match &*self.callback.read().expect("callback lock poisoned") {
            Some(callback) => Arc::clone(callback),
            None => {
                tracing::warn!("timeout armed for {} before startup wiring", swap_id);
                return;
            }
        };

        let (sender, mut receiver) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(swap_id, sender);

        let window = self.window;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {
                    tracing::debug!("swap {} timed out after {:?}", swap_id, window);
                    callback(swap_id);
                }
                _ = &mut receiver => {}
            }
        });
    }

    /// Cancels the window for `swap_id`, if any.
    pub fn disarm(&self, swap_id: &SwapId) {
        if let Some(sender) = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(swap_id)
        {
            let _ = sender.send(());
        }
    }
}

impl fmt::Debug for TimeoutService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutService")
            .field("window", &self.window)
            .finish()
    }
}
