//! Timer facility used by the watchdog.

/// Identifies one armed timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u32);

/// One-shot timeouts keyed by controller.
///
/// When an armed timeout expires the host calls
/// [`Engine::watchdog_fired`](crate::Engine::watchdog_fired) with the
/// controller index and the handle `arm` returned. Cancelled handles may
/// still be delivered by a racing host; the engine ignores them.
pub trait Timer {
    fn arm(&self, controller: usize, ticks: u32) -> TimerHandle;
    fn cancel(&self, handle: TimerHandle);
    /// Monotonic tick counter.
    fn now(&self) -> u64;
}

impl<T: Timer + ?Sized> Timer for &T {
    fn arm(&self, controller: usize, ticks: u32) -> TimerHandle {
        (**self).arm(controller, ticks)
    }

    fn cancel(&self, handle: TimerHandle) {
        (**self).cancel(handle)
    }

    fn now(&self) -> u64 {
        (**self).now()
    }
}
