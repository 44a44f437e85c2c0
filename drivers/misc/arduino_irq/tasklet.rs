// SPDX-License-Identifier: GPL-2.0

//! Tasklets.
//!
//! A tasklet defers a function to softirq context on the CPU that scheduled it. A given tasklet
//! never runs concurrently with itself, and scheduling a tasklet that is already pending does
//! nothing: the pending run covers every request made before it starts.
//!
//! C header: [`include/linux/interrupt.h`](srctree/include/linux/interrupt.h)

use core::sync::atomic::{AtomicUsize, Ordering};
use kernel::{bindings, container_of, prelude::*, types::Opaque};

/// The function run by a [`Tasklet`].
pub trait TaskletHandler: Sync {
    /// Runs the deferred work.
    ///
    /// This is executed in softirq context, hence it must not sleep.
    fn run(&self);
}

/// A tasklet together with the handler it runs.
///
/// # Examples
///
/// ```ignore
/// use kernel::prelude::*;
/// use kernel::sync::Arc;
///
/// struct Hello;
///
/// impl TaskletHandler for Hello {
///     fn run(&self) {
///         pr_info!("hello from softirq context\n");
///     }
/// }
///
/// let tasklet = Arc::pin_init(Tasklet::new(Hello), GFP_KERNEL)?;
/// assert!(tasklet.schedule());
/// # Ok::<(), Error>(())
/// ```
///
/// # Invariants
///
/// `inner` was set up by `tasklet_setup` with [`Tasklet::run_callback`] as its callback and, being
/// pinned, stays at the same address until [`PinnedDrop`] kills it.
#[pin_data(PinnedDrop)]
pub struct Tasklet<T: TaskletHandler> {
    #[pin]
    inner: Opaque<bindings::tasklet_struct>,
    handler: T,
}

// SAFETY: The tasklet core only ever hands out the `tasklet_struct` to one CPU at a time, and the
// handler is moved along with the tasklet.
unsafe impl<T: TaskletHandler + Send> Send for Tasklet<T> {}

// SAFETY: Scheduling is an atomic operation on `state`, and the callback only needs `&T`, which is
// fine to share since `T: Sync`.
unsafe impl<T: TaskletHandler> Sync for Tasklet<T> {}

impl<T: TaskletHandler> Tasklet<T> {
    /// Creates an initializer for a tasklet that runs `handler`.
    pub fn new(handler: T) -> impl PinInit<Self> {
        pin_init!(Self {
            inner <- Opaque::ffi_init(|slot: *mut bindings::tasklet_struct| {
                // SAFETY: `slot` is valid for writes of a `struct tasklet_struct`.
                unsafe { bindings::tasklet_setup(slot, Some(Self::run_callback)) };
            }),
            handler,
        })
    }

    /// Returns the handler run by this tasklet.
    pub fn handler(&self) -> &T {
        &self.handler
    }

    /// Schedules the tasklet, see `tasklet_schedule()`.
    ///
    /// Returns `false` if the tasklet was already pending, in which case this call has no effect.
    /// This may be called from hard IRQ context.
    pub fn schedule(&self) -> bool {
        let raw = self.inner.get();
        let sched: usize = 1 << bindings::TASKLET_STATE_SCHED;

        // SAFETY: `raw` points to a set up `tasklet_struct` by the type invariants. Its `state` word
        // is an `unsigned long` that the C side only touches with atomic bit operations.
        let state = unsafe { AtomicUsize::from_ptr((&raw mut (*raw).state).cast::<usize>()) };

        if state.fetch_or(sched, Ordering::SeqCst) & sched != 0 {
            return false;
        }

        // SAFETY: We just set `TASKLET_STATE_SCHED`, which is the precondition for queueing the
        // tasklet on this CPU.
        unsafe { bindings::__tasklet_schedule(raw) };
        true
    }

    /// # Safety
    ///
    /// Must only be used as the callback passed to `tasklet_setup` in [`Tasklet::new`].
    unsafe extern "C" fn run_callback(ptr: *mut bindings::tasklet_struct) {
        let inner = ptr.cast::<Opaque<bindings::tasklet_struct>>();

        // SAFETY: `Opaque` is `repr(transparent)` and `ptr` is the `inner` field of a `Tasklet<T>`
        // as set up in `new`, which stays valid until `tasklet_kill` returned.
        let this = unsafe { &*container_of!(inner, Self, inner) };
        this.handler.run();
    }
}

#[pinned_drop]
impl<T: TaskletHandler> PinnedDrop for Tasklet<T> {
    fn drop(self: Pin<&mut Self>) {
        // SAFETY: `inner` is a set up tasklet. `tasklet_kill` waits for a pending run to finish and
        // leaves the tasklet unscheduled, so the callback cannot observe freed memory.
        unsafe { bindings::tasklet_kill(self.inner.get()) };
    }
}

#[kunit_tests(arduino_irq_tasklet)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicI32, AtomicU32};
    use kernel::sync::{Arc, Completion};

    #[pin_data]
    struct Runs {
        count: AtomicU32,
        #[pin]
        first: Completion,
        #[pin]
        second: Completion,
    }

    impl Runs {
        fn new() -> Result<Arc<Self>> {
            Arc::pin_init(
                pin_init!(Self {
                    count: AtomicU32::new(0),
                    first <- Completion::new(),
                    second <- Completion::new(),
                }),
                GFP_KERNEL,
            )
        }

        fn count(&self) -> u32 {
            self.count.load(Ordering::Relaxed)
        }
    }

    /// Stops `tasklet` from running while it stays scheduled, like `tasklet_disable()`.
    fn hold<T: TaskletHandler>(tasklet: &Tasklet<T>) {
        let raw = tasklet.inner.get();
        let running: usize = 1 << bindings::TASKLET_STATE_RUN;

        // SAFETY: `raw` points to a set up `tasklet_struct`; `count` and `state` are only accessed
        // atomically by the C side.
        let (count, state) = unsafe {
            (
                AtomicI32::from_ptr((&raw mut (*raw).count.counter).cast::<i32>()),
                AtomicUsize::from_ptr((&raw mut (*raw).state).cast::<usize>()),
            )
        };

        count.fetch_add(1, Ordering::SeqCst);
        while state.load(Ordering::Acquire) & running != 0 {
            core::hint::spin_loop();
        }
    }

    /// Undoes [`hold`], like `tasklet_enable()`.
    fn unhold<T: TaskletHandler>(tasklet: &Tasklet<T>) {
        let raw = tasklet.inner.get();

        // SAFETY: As in `hold`.
        let count = unsafe { AtomicI32::from_ptr((&raw mut (*raw).count.counter).cast::<i32>()) };
        count.fetch_sub(1, Ordering::SeqCst);
    }

    impl TaskletHandler for Arc<Runs> {
        fn run(&self) {
            match self.count.fetch_add(1, Ordering::Relaxed) {
                0 => self.first.complete_all(),
                _ => self.second.complete_all(),
            }
        }
    }

    #[test]
    fn scheduled_tasklet_runs_once() -> Result {
        let runs = Runs::new()?;
        let tasklet = KBox::pin_init(Tasklet::new(runs.clone()), GFP_KERNEL)?;

        assert!(tasklet.schedule());
        runs.first.wait_for_completion();
        assert_eq!(runs.count(), 1);
        Ok(())
    }

    #[test]
    fn tasklet_can_be_rescheduled_after_running() -> Result {
        let runs = Runs::new()?;
        let tasklet = KBox::pin_init(Tasklet::new(runs.clone()), GFP_KERNEL)?;

        assert!(tasklet.schedule());
        runs.first.wait_for_completion();

        // The scheduled bit is cleared before the callback is invoked.
        assert!(tasklet.schedule());
        runs.second.wait_for_completion();
        assert_eq!(runs.count(), 2);
        Ok(())
    }

    #[test]
    fn drop_waits_for_pending_run() -> Result {
        let runs = Runs::new()?;
        let tasklet = KBox::pin_init(Tasklet::new(runs.clone()), GFP_KERNEL)?;

        assert!(tasklet.schedule());
        drop(tasklet);

        assert_eq!(runs.count(), 1);
        Ok(())
    }

    #[test]
    fn schedule_while_pending_is_a_no_op() -> Result {
        let runs = Runs::new()?;
        let tasklet = KBox::pin_init(Tasklet::new(runs.clone()), GFP_KERNEL)?;

        hold(&tasklet);
        assert!(tasklet.schedule());
        assert!(!tasklet.schedule());
        assert!(!tasklet.schedule());
        unhold(&tasklet);

        runs.first.wait_for_completion();
        drop(tasklet);

        assert_eq!(runs.count(), 1);
        Ok(())
    }
}
