// Dead-man's switch and panic-off for the overlay
pub mod audio;

pub use audio::{AudioChannel, AudioFeedback, Sound};

use claritylayer_core::{log_error, log_info, log_warn};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(5000);

/// Millisecond tick source for heartbeats.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Normal,
    SafeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicReason {
    User,
    Watchdog,
    Startup,
}

impl PanicReason {
    fn index(self) -> usize {
        match self {
            PanicReason::User => 0,
            PanicReason::Watchdog => 1,
            PanicReason::Startup => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PanicReason::User => "user request",
            PanicReason::Watchdog => "watchdog timeout",
            PanicReason::Startup => "startup safe mode",
        }
    }
}

/// Whatever owns the pipeline and can shut every effect off.
///
/// Implementations must not block on the render path.
pub trait PipelineOwner: Send + Sync {
    fn disable_all_effects(&self);
}

pub type PanicCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

pub struct LivenessGuard {
    clock: Arc<dyn Clock>,
    period: Duration,
    heartbeat: AtomicU64,
    armed: AtomicBool,
    safe_mode: AtomicBool,
    callbacks: Mutex<Vec<PanicCallback>>,
    owner: RwLock<Option<Weak<dyn PipelineOwner>>>,
    audio: AudioFeedback,
    panics: [AtomicUsize; 3],
}

impl LivenessGuard {
    pub fn new(clock: Arc<dyn Clock>, period: Duration, audio: AudioFeedback) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            period,
            heartbeat: AtomicU64::new(now),
            armed: AtomicBool::new(false),
            safe_mode: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            owner: RwLock::new(None),
            audio,
            panics: Default::default(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn audio(&self) -> &AudioFeedback {
        &self.audio
    }

    pub fn set_owner(&self, owner: Weak<dyn PipelineOwner>) {
        *self.owner.write() = Some(owner);
    }

    /// Records that a frame made it all the way to the screen.
    pub fn heartbeat(&self) {
        self.heartbeat.store(self.clock.now_ms(), Ordering::Release);
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Starts supervising with a fresh heartbeat.
    pub fn arm(&self) {
        self.heartbeat();
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Append-only; callbacks run in registration order.
    pub fn register_panic_callback(&self, callback: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// One watchdog tick. Returns true if it tripped panic-off.
    pub fn check(&self) -> bool {
        if !self.is_armed() {
            return false;
        }

        let elapsed = self.clock.now_ms().saturating_sub(self.last_heartbeat());
        let limit = 2 * self.period.as_millis() as u64;
        if elapsed <= limit {
            return false;
        }

        // Only the tick that disarms gets to fire
        if !self.armed.swap(false, Ordering::AcqRel) {
            return false;
        }
        log_error!("No heartbeat for {} ms (limit {} ms), forcing panic-off", elapsed, limit);
        self.panic_off(PanicReason::Watchdog);
        true
    }

    /// Forces every effect off. Safe to call from any thread, any number of times.
    pub fn panic_off(&self, reason: PanicReason) {
        log_warn!("PANIC OFF ({})", reason.as_str());
        self.safe_mode.store(true, Ordering::Release);
        self.disarm();
        self.panics[reason.index()].fetch_add(1, Ordering::AcqRel);

        let callbacks: Vec<PanicCallback> = self.callbacks.lock().clone();
        for (index, callback) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_error!("Panic callback #{} failed: {:#}", index, e),
                Err(_) => log_error!("Panic callback #{} panicked", index),
            }
        }

        let owner = self.owner.read().as_ref().and_then(Weak::upgrade);
        match owner {
            Some(owner) => {
                if catch_unwind(AssertUnwindSafe(|| owner.disable_all_effects())).is_err() {
                    log_error!("Pipeline owner panicked while disabling effects");
                }
            }
            None => log_warn!("Panic-off with no pipeline owner attached"),
        }

        self.audio.panic_confirmation();
    }

    /// Runs the startup check. Returns true if safe mode was entered.
    pub fn startup_check(&self, forced: bool) -> bool {
        if forced {
            log_info!("Starting in safe mode");
            self.panic_off(PanicReason::Startup);
        }
        forced
    }

    /// Manual return to normal. Nothing is re-enabled.
    pub fn exit_safe_mode(&self) {
        if self.safe_mode.swap(false, Ordering::AcqRel) {
            log_info!("Safe mode cleared by user");
        }
    }

    pub fn is_in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Acquire)
    }

    pub fn state(&self) -> GuardState {
        if self.is_in_safe_mode() {
            GuardState::SafeMode
        } else {
            GuardState::Normal
        }
    }

    pub fn panic_count(&self) -> usize {
        self.panics.iter().map(|c| c.load(Ordering::Acquire)).sum()
    }

    pub fn panic_count_for(&self, reason: PanicReason) -> usize {
        self.panics[reason.index()].load(Ordering::Acquire)
    }
}

/// Timer thread that ticks the guard once per period until dropped.
pub struct Watchdog {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(guard: Arc<LivenessGuard>) -> std::io::Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let period = guard.period();

        let handle = std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        guard.check();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        log_info!("Watchdog running with {} ms period", period.as_millis());
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True when the user asked to start with every effect off.
pub fn safe_mode_requested(flag: bool) -> bool {
    flag || shift_held()
}

#[cfg(windows)]
fn shift_held() -> bool {
    use windows::Win32::UI::Input::KeyboardAndMouse::{GetAsyncKeyState, VK_SHIFT};
    let state = unsafe { GetAsyncKeyState(VK_SHIFT.0 as i32) };
    (state as u16 & 0x8000) != 0
}

#[cfg(not(windows))]
fn shift_held() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(period_ms: u64) -> (Arc<LivenessGuard>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let guard = LivenessGuard::new(clock.clone(), Duration::from_millis(period_ms), AudioFeedback::silent());
        (Arc::new(guard), clock)
    }

    struct Owner(AtomicUsize);

    impl PipelineOwner for Owner {
        fn disable_all_effects(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_disarmed_guard_never_trips() {
        let (guard, clock) = guard(100);
        clock.advance(Duration::from_secs(60));
        assert!(!guard.check());
        assert!(!guard.is_in_safe_mode());
    }

    #[test]
    fn test_exactly_two_periods_is_tolerated() {
        let (guard, clock) = guard(100);
        guard.arm();
        clock.advance(Duration::from_millis(200));
        assert!(!guard.check());
        clock.advance(Duration::from_millis(1));
        assert!(guard.check());
    }

    #[test]
    fn test_heartbeat_keeps_guard_quiet() {
        let (guard, clock) = guard(100);
        guard.arm();
        for _ in 0..10 {
            clock.advance(Duration::from_millis(150));
            guard.heartbeat();
            assert!(!guard.check());
        }
    }

    #[test]
    fn test_panic_reaches_owner() {
        let (guard, _clock) = guard(100);
        let owner: Arc<Owner> = Arc::new(Owner(AtomicUsize::new(0)));
        let weak: Weak<dyn PipelineOwner> = Arc::downgrade(&(owner.clone() as Arc<dyn PipelineOwner>));
        guard.set_owner(weak);

        guard.panic_off(PanicReason::User);
        guard.panic_off(PanicReason::User);
        assert_eq!(owner.0.load(Ordering::SeqCst), 2);
        assert_eq!(guard.panic_count_for(PanicReason::User), 2);
    }

    #[test]
    fn test_exit_safe_mode_leaves_watchdog_disarmed() {
        let (guard, _clock) = guard(100);
        guard.arm();
        guard.panic_off(PanicReason::User);
        guard.exit_safe_mode();
        assert_eq!(guard.state(), GuardState::Normal);
        assert!(!guard.is_armed());
    }

    #[test]
    fn test_startup_check_enters_safe_mode() {
        let (guard, _clock) = guard(100);
        assert!(!guard.startup_check(false));
        assert!(guard.startup_check(true));
        assert!(guard.is_in_safe_mode());
        assert_eq!(guard.panic_count_for(PanicReason::Startup), 1);
    }

    #[test]
    fn test_watchdog_thread_stops_on_drop() {
        let (guard, _clock) = guard(10);
        let watchdog = Watchdog::spawn(Arc::clone(&guard)).unwrap();
        drop(watchdog);
        assert_eq!(Arc::strong_count(&guard), 1);
    }
}
