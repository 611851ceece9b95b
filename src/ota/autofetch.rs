//! Periodic, unprompted job polling.
//!
//! The timer callback only pushes a tick into a one-slot channel; the fetch
//! itself runs on the `ota-autofetch` worker so the timer context is never
//! blocked by network I/O. A tick that arrives while the previous fetch is
//! still running is dropped.

use std::sync::mpsc::{self, TrySendError};
use std::thread;
use std::time::Duration;

use super::error::OtaError;
use crate::platform::{TimerHandle, TimerService};

pub struct Autofetch {
    timer: Option<TimerHandle>,
    period: Duration,
}

impl Autofetch {
    /// Start polling every `period`. `fetch` runs on the worker thread and
    /// its result is only logged by the caller's closure.
    pub fn start<F>(timers: &dyn TimerService, period: Duration, fetch: F) -> Result<Self, OtaError>
    where
        F: Fn() + Send + 'static,
    {
        let (tick_tx, tick_rx) = mpsc::sync_channel::<()>(1);

        // The worker ends once the timer, and with it the sender, is gone
        thread::Builder::new()
            .name("ota-autofetch".into())
            .spawn(move || {
                for () in tick_rx {
                    log::info!("Autofetch: checking for firmware updates");
                    fetch();
                }
                log::debug!("Autofetch worker stopped");
            })
            .map_err(|e| OtaError::Timer(anyhow::anyhow!("failed to spawn autofetch worker: {}", e)))?;

        let timer = timers
            .schedule_periodic(
                period,
                Box::new(move || match tick_tx.try_send(()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(())) => {
                        log::warn!("Autofetch: previous fetch still running, skipping tick");
                    }
                    Err(TrySendError::Disconnected(())) => {}
                }),
            )
            .map_err(OtaError::Timer)?;

        log::info!("Autofetch enabled, every {} s", period.as_secs());
        Ok(Self {
            timer: Some(timer),
            period,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Cancel the timer. A fetch already running on the worker completes.
    pub fn stop(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
            log::info!("Autofetch disabled");
        }
    }
}

impl Drop for Autofetch {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::ThreadTimers;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn ticks_run_fetch_until_stopped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut autofetch = Autofetch::start(&ThreadTimers, Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(autofetch.is_running());

        thread::sleep(Duration::from_millis(120));
        autofetch.stop();
        assert!(!autofetch.is_running());
        thread::sleep(Duration::from_millis(30));

        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 2, "autofetch ran {} times", seen);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn slow_fetch_drops_ticks() {
        let hits = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();

        let (h, g) = (hits.clone(), gate.clone());
        let autofetch = Autofetch::start(&ThreadTimers, Duration::from_millis(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
            let _wait = g.lock().unwrap();
        })
        .unwrap();

        // One fetch blocked on the gate, one tick buffered, the rest dropped
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(autofetch);
        drop(held);
        thread::sleep(Duration::from_millis(50));
        assert!(hits.load(Ordering::SeqCst) <= 2);
    }
}
