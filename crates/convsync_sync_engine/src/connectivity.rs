//! Debounced network reachability.
//!
//! The platform reports raw reachability through a [`ConnectivitySignal`].
//! A background task publishes a value only after it has held for the
//! debounce window, so a flap shorter than the window never reaches the
//! coordinator.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Debounced reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
    /// Nothing has been reported yet. Treated as offline.
    #[default]
    Unknown,
    /// The remote is reachable.
    Online,
    /// The remote is not reachable.
    Offline,
}

impl ConnectivityState {
    /// Returns true only for [`ConnectivityState::Online`].
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }

    fn from_report(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

/// The platform's side of the monitor.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    tx: mpsc::UnboundedSender<bool>,
}

impl ConnectivitySignal {
    /// Reports raw reachability. Returns false if the monitor is gone.
    pub fn report(&self, online: bool) -> bool {
        self.tx.send(online).is_ok()
    }
}

/// Owns the debounce task. Dropping the monitor stops it.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    signal: ConnectivitySignal,
    state: watch::Receiver<ConnectivityState>,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Starts a monitor on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectivityState::Unknown);
        let task = tokio::spawn(debounce_reports(rx, state_tx, debounce));
        Self {
            signal: ConnectivitySignal { tx },
            state,
            task,
        }
    }

    /// A handle for reporting raw reachability.
    pub fn signal(&self) -> ConnectivitySignal {
        self.signal.clone()
    }

    /// A receiver of debounced state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.clone()
    }

    /// The current debounced state.
    pub fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_reports(
    mut reports: mpsc::UnboundedReceiver<bool>,
    state: watch::Sender<ConnectivityState>,
    debounce: Duration,
) {
    // The value waiting out the window, and when it may be published.
    let mut candidate: Option<(ConnectivityState, Instant)> = None;

    loop {
        let deadline = candidate.map(|(_, at)| at);
        tokio::select! {
            report = reports.recv() => {
                let Some(online) = report else { break };
                let next = ConnectivityState::from_report(online);
                if next == *state.borrow() {
                    if candidate.take().is_some() {
                        tracing::trace!(state = ?next, "connectivity flap ignored");
                    }
                } else if candidate.map(|(pending, _)| pending) != Some(next) {
                    candidate = Some((next, Instant::now() + debounce));
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some((next, _)) = candidate.take() {
                    let previous = state.send_replace(next);
                    tracing::debug!(from = ?previous, to = ?next, "connectivity changed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn starts_unknown() {
        let monitor = ConnectivityMonitor::spawn(DEBOUNCE);
        assert_eq!(monitor.current(), ConnectivityState::Unknown);
        assert!(!monitor.current().is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_after_window() {
        let monitor = ConnectivityMonitor::spawn(DEBOUNCE);
        monitor.signal().report(true);

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(monitor.current(), ConnectivityState::Unknown);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.current(), ConnectivityState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn short_flap_produces_no_transition() {
        let monitor = ConnectivityMonitor::spawn(DEBOUNCE);
        let mut changes = monitor.subscribe();
        let signal = monitor.signal();

        signal.report(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*changes.borrow_and_update(), ConnectivityState::Online);

        signal.report(false);
        tokio::time::sleep(Duration::from_millis(500)).await;
        signal.report(true);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!changes.has_changed().unwrap());
        assert_eq!(monitor.current(), ConnectivityState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reports_keep_first_deadline() {
        let monitor = ConnectivityMonitor::spawn(DEBOUNCE);
        let signal = monitor.signal();

        signal.report(false);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        signal.report(false);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(monitor.current(), ConnectivityState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_outlives_monitor() {
        let monitor = ConnectivityMonitor::spawn(DEBOUNCE);
        let signal = monitor.signal();
        drop(monitor);
        for _ in 0..10 {
            if signal.tx.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!signal.report(true));
    }
}
