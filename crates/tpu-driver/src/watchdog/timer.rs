//! Single-level, timer-backed watchdog

use super::{validate_timeout, ExpireCallback, Watchdog, WatchdogState};
use crate::error::{Result, TpuError};
use crate::executor::CallbackExecutor;
use crate::timer::{CondvarTimer, CountdownTimer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug)]
struct Inner {
    state: WatchdogState,
    activation_id: u64,
    timeout: Duration,
}

struct Shared {
    inner: Mutex<Inner>,
    timer: Arc<dyn CountdownTimer>,
    on_expire: ExpireCallback,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs on the executor after the user callback returned.
    fn finish_bark(&self, activation_id: u64) {
        let mut inner = self.lock();
        if inner.state == WatchdogState::Barking && inner.activation_id == activation_id {
            inner.state = WatchdogState::Inactive;
        }
    }
}

/// Watchdog backed by a [`CountdownTimer`] and a watcher thread
///
/// Dropping it marks the watchdog destroyed, fires the timer once to
/// release the watcher, and joins both owned threads.
pub struct TimerWatchdog {
    shared: Arc<Shared>,
    watcher: Option<JoinHandle<()>>,
    executor: Option<CallbackExecutor>,
}

impl std::fmt::Debug for TimerWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("TimerWatchdog")
            .field("state", &inner.state)
            .field("activation_id", &inner.activation_id)
            .field("timeout", &inner.timeout)
            .finish_non_exhaustive()
    }
}

impl TimerWatchdog {
    /// Watchdog on a portable [`CondvarTimer`]
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero timeout; `Unknown` if a thread cannot
    /// be spawned.
    pub fn new(timeout: Duration, on_expire: impl Fn(u64) + Send + Sync + 'static) -> Result<Self> {
        Self::with_timer(timeout, Arc::new(CondvarTimer::new()), Arc::new(on_expire))
    }

    /// Watchdog on a caller-supplied timer
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero timeout; `Unknown` if a thread cannot
    /// be spawned.
    pub fn with_timer(
        timeout: Duration,
        timer: Arc<dyn CountdownTimer>,
        on_expire: ExpireCallback,
    ) -> Result<Self> {
        validate_timeout(timeout)?;

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: WatchdogState::Inactive,
                activation_id: 0,
                timeout,
            }),
            timer,
            on_expire,
        });

        let executor = CallbackExecutor::spawn("tpu-watchdog-cb")?;
        let sender = executor
            .sender()
            .ok_or_else(|| TpuError::internal("callback executor has no sender"))?;

        let watched = Arc::clone(&shared);
        let watcher = thread::Builder::new()
            .name("tpu-watchdog".into())
            .spawn(move || loop {
                let expirations = match watched.timer.wait() {
                    Ok(n) => n,
                    Err(e) => {
                        error!("watchdog timer wait failed, watcher exiting: {e}");
                        break;
                    }
                };

                let activation_id = {
                    let mut inner = watched.lock();
                    match inner.state {
                        WatchdogState::Destroyed => break,
                        WatchdogState::Active if expirations > 0 => {
                            inner.state = WatchdogState::Barking;
                            inner.activation_id
                        }
                        _ => continue,
                    }
                };

                warn!("watchdog expired (activation {activation_id})");
                let barking = Arc::clone(&watched);
                let job: Box<dyn FnOnce() + Send> = Box::new(move || {
                    (barking.on_expire)(activation_id);
                    barking.finish_bark(activation_id);
                });
                if sender.send(job).is_err() {
                    break;
                }
            })
            .map_err(|e| TpuError::unknown(format!("failed to spawn watchdog thread: {e}")))?;

        debug!("watchdog created, timeout {timeout:?}");

        Ok(Self {
            shared,
            watcher: Some(watcher),
            executor: Some(executor),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> WatchdogState {
        self.shared.lock().state
    }

    /// Activation id of the most recent arm cycle
    pub fn activation_id(&self) -> u64 {
        self.shared.lock().activation_id
    }

    /// Timeout applied on the next arm
    pub fn timeout(&self) -> Duration {
        self.shared.lock().timeout
    }
}

impl Watchdog for TimerWatchdog {
    fn activate(&self) -> Result<u64> {
        let mut inner = self.shared.lock();
        match inner.state {
            WatchdogState::Destroyed => Err(TpuError::failed_precondition(
                "cannot activate a destroyed watchdog",
            )),
            WatchdogState::Active => Ok(inner.activation_id),
            WatchdogState::Inactive | WatchdogState::Barking => {
                self.shared.timer.set(inner.timeout)?;
                inner.activation_id = inner.activation_id.wrapping_add(1);
                inner.state = WatchdogState::Active;
                Ok(inner.activation_id)
            }
        }
    }

    fn signal(&self) -> Result<()> {
        let inner = self.shared.lock();
        match inner.state {
            WatchdogState::Active => self.shared.timer.set(inner.timeout),
            WatchdogState::Barking => Ok(()),
            WatchdogState::Inactive => Err(TpuError::failed_precondition(
                "cannot signal an inactive watchdog",
            )),
            WatchdogState::Destroyed => Err(TpuError::failed_precondition(
                "cannot signal a destroyed watchdog",
            )),
        }
    }

    fn deactivate(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        match inner.state {
            WatchdogState::Active => {
                self.shared.timer.set(Duration::ZERO)?;
                inner.state = WatchdogState::Inactive;
                Ok(())
            }
            WatchdogState::Barking | WatchdogState::Inactive => Ok(()),
            WatchdogState::Destroyed => Err(TpuError::failed_precondition(
                "cannot deactivate a destroyed watchdog",
            )),
        }
    }

    fn update_timeout(&self, timeout: Duration) -> Result<()> {
        validate_timeout(timeout)?;
        self.shared.lock().timeout = timeout;
        Ok(())
    }
}

impl Drop for TimerWatchdog {
    fn drop(&mut self) {
        self.shared.lock().state = WatchdogState::Destroyed;
        if let Err(e) = self.shared.timer.set(Duration::from_nanos(1)) {
            error!("failed to wake watchdog thread on shutdown: {e}");
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        self.executor.take();
        debug!("watchdog destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, RecvTimeoutError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};
    use std::time::Instant;

    fn counting_dog(timeout: Duration) -> (TimerWatchdog, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let dog = TimerWatchdog::new(timeout, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        (dog, fired)
    }

    #[test]
    fn signal_before_timeout_never_fires() {
        let (dog, fired) = counting_dog(Duration::from_millis(100));
        dog.activate().unwrap();
        for _ in 0..15 {
            thread::sleep(Duration::from_millis(20));
            dog.signal().unwrap();
        }
        dog.deactivate().unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(dog.state(), WatchdogState::Inactive);
    }

    #[test]
    fn silence_fires_exactly_once_after_timeout() {
        let (tx, rx) = unbounded();
        let dog = TimerWatchdog::new(Duration::from_millis(30), move |id| {
            let _ = tx.send((id, Instant::now()));
        })
        .unwrap();

        let start = Instant::now();
        let id = dog.activate().unwrap();
        let (fired_id, at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired_id, id);
        assert!(at.duration_since(start) >= Duration::from_millis(30));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(150)),
            Err(RecvTimeoutError::Timeout)
        );
        assert_eq!(dog.state(), WatchdogState::Inactive);
    }

    #[test]
    fn activate_is_idempotent_while_active() {
        let (dog, _) = counting_dog(Duration::from_secs(10));
        let first = dog.activate().unwrap();
        assert_eq!(dog.activate().unwrap(), first);
        dog.deactivate().unwrap();
        assert_eq!(dog.activate().unwrap(), first + 1);
        dog.deactivate().unwrap();
    }

    #[test]
    fn signal_requires_active() {
        let (dog, _) = counting_dog(Duration::from_secs(10));
        let err = dog.signal().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::FailedPrecondition);
        dog.deactivate().unwrap();
        dog.deactivate().unwrap();
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(TimerWatchdog::new(Duration::ZERO, |_| {}).is_err());
        let (dog, _) = counting_dog(Duration::from_secs(1));
        let err = dog.update_timeout(Duration::ZERO).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
        dog.update_timeout(Duration::from_millis(5)).unwrap();
        assert_eq!(dog.timeout(), Duration::from_millis(5));
    }

    #[test]
    fn callback_may_reactivate_reentrantly() {
        let slot: Arc<OnceLock<Weak<TimerWatchdog>>> = Arc::new(OnceLock::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();

        let cb_slot = Arc::clone(&slot);
        let cb_fired = Arc::clone(&fired);
        let dog = Arc::new(
            TimerWatchdog::new(Duration::from_millis(20), move |_| {
                let n = cb_fired.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 {
                    if let Some(dog) = cb_slot.get().and_then(Weak::upgrade) {
                        dog.activate().unwrap();
                    }
                }
                let _ = tx.send(n);
            })
            .unwrap(),
        );
        slot.set(Arc::downgrade(&dog)).unwrap();

        dog.activate().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(dog.state(), WatchdogState::Inactive);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_while_barking_does_not_hang() {
        let (tx, rx) = unbounded();
        let dog = TimerWatchdog::new(Duration::from_millis(5), move |_| {
            let _ = tx.send(());
            thread::sleep(Duration::from_millis(50));
        })
        .unwrap();
        dog.activate().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(dog.state(), WatchdogState::Barking);
        dog.signal().unwrap();
        dog.deactivate().unwrap();
        drop(dog);
    }

    #[test]
    fn reactivating_from_barking_bumps_id() {
        let (tx, rx) = unbounded();
        let dog = TimerWatchdog::new(Duration::from_millis(5), move |id| {
            let _ = tx.send(id);
            thread::sleep(Duration::from_millis(50));
        })
        .unwrap();
        let first = dog.activate().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), first);
        let second = dog.activate().unwrap();
        assert_eq!(second, first + 1);
        dog.deactivate().unwrap();
    }
}
