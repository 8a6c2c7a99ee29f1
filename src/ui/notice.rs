use crate::bridge::{EventBridge, UiEvent};
use crate::error::CoreError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// The error line of the UI, cleared after a fixed display time.
///
/// Each shown error gets a new generation. Its timer reports back through the bridge
/// with that generation, so an expiry that raced with a newer error clears nothing.
pub struct ErrorNotice {
    current: Option<CoreError>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    display_for: Duration,
    bridge: EventBridge,
}

impl ErrorNotice {
    pub fn new(bridge: EventBridge, display_for: Duration) -> Self {
        ErrorNotice {
            current: None,
            generation: 0,
            timer: None,
            display_for,
            bridge,
        }
    }

    pub fn current(&self) -> Option<&CoreError> {
        self.current.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Shows `err` and restarts the timer; `None` clears right away
    pub fn show(&mut self, err: Option<CoreError>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;

        let Some(err) = err else {
            self.current = None;
            return;
        };
        self.current = Some(err);

        let generation = self.generation;
        let bridge = self.bridge.clone();
        let display_for = self.display_for;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.timer = Some(runtime.spawn(async move {
                    tokio::time::sleep(display_for).await;
                    bridge.emit(UiEvent::ErrorExpired { generation });
                }));
            }
            Err(_) => debug!("No runtime for the error timer, the error stays until replaced"),
        }
    }

    /// Handles an expiry; returns true if the notice was cleared
    pub fn expire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.current.is_none() {
            debug!("Ignoring stale error expiry {}", generation);
            return false;
        }
        self.current = None;
        self.timer = None;
        true
    }
}

impl Drop for ErrorNotice {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
