// SPDX-License-Identifier: GPL-2.0

//! Arduino Uno interrupt driver with a workqueue bottom half.
//!
//! The hard IRQ handler queues a work item on the system workqueue, and the work item runs later
//! in process context on a kernel worker thread.

use kernel::{
    bindings, c_str,
    device::Core,
    irq::{self, IrqReturn},
    of, platform,
    prelude::*,
    sync::{aref::ARef, Arc},
    workqueue::{self, impl_has_work, new_work, HasWork, Work, WorkItem},
};

const IRQ_NAME: &CStr = c_str!("arduino_irq_workqueue");

/// Per-device state shared between the hard IRQ handler and the work item.
#[pin_data]
struct ArduinoIrqWork {
    pdev: ARef<platform::Device>,
    irq: u32,
    #[pin]
    work: Work<ArduinoIrqWork>,
}

impl_has_work! {
    impl HasWork<Self> for ArduinoIrqWork { self.work }
}

impl ArduinoIrqWork {
    fn new(pdev: ARef<platform::Device>, irq: u32) -> impl PinInit<Self> {
        pin_init!(Self {
            pdev,
            irq,
            work <- new_work!("ArduinoIrqWork::work"),
        })
    }
}

impl WorkItem for ArduinoIrqWork {
    type Pointer = Arc<ArduinoIrqWork>;

    fn run(this: Arc<ArduinoIrqWork>) {
        dev_info!(this.pdev.as_ref(), "irq={} bottom-half executed\n", this.irq);
    }
}

/// Takes the work item of `this` off its queue with `cancel`.
///
/// Returns `true` if the work item was pending. Its function will then never run, so the reference
/// handed to the queue on enqueue is dropped here instead.
fn cancel_arc_work<T>(
    this: &Arc<T>,
    cancel: unsafe extern "C" fn(*mut bindings::work_struct) -> bool,
) -> bool
where
    T: HasWork<T> + WorkItem<Pointer = Arc<T>>,
{
    // SAFETY: `this` points to a live `T`, and `HasWork` locates the `Work` embedded in it.
    let work = unsafe { T::raw_get_work(Arc::as_ptr(this).cast_mut()) };

    // SAFETY: `work` is an initialised `Work`, so `raw_get` yields a valid `work_struct`.
    let pending = unsafe { cancel(Work::raw_get(work)) };
    if pending {
        // SAFETY: A pending `Arc` work item owns the reference leaked by `Arc::into_raw` in its
        // `__enqueue`. Cancelling it guarantees the work function will not reclaim it.
        drop(unsafe { Arc::from_raw(Arc::as_ptr(this)) });
    }

    pending
}

/// Cancels the work item of `this` and waits for a running instance to return, see
/// `cancel_work_sync()`.
///
/// Returns `true` if the work item was pending.
fn cancel_work_sync<T>(this: &Arc<T>) -> bool
where
    T: HasWork<T> + WorkItem<Pointer = Arc<T>>,
{
    cancel_arc_work(this, bindings::cancel_work_sync)
}

/// Hard IRQ handler.
struct TopHalf(Arc<ArduinoIrqWork>);

impl irq::Handler for TopHalf {
    fn handle(&self) -> IrqReturn {
        let ctx = &self.0;

        dev_info!(ctx.pdev.as_ref(), "irq={} top-half executed\n", ctx.irq);

        // An already pending work item covers this interrupt too.
        let _ = workqueue::system().enqueue(ctx.clone());

        IrqReturn::Handled
    }
}

/// The driver's reference to the device state. Dropping it cancels a pending bottom half and
/// waits for a running one.
struct WorkGuard(Arc<ArduinoIrqWork>);

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let ctx = &self.0;

        if cancel_work_sync(ctx) {
            dev_dbg!(ctx.pdev.as_ref(), "cancelled pending bottom-half\n");
        }
    }
}

#[pin_data]
struct ArduinoIrqDriver {
    // Must be released before `ctx`, or the IRQ could queue the work again after cancelling it.
    #[pin]
    irq: irq::Registration<TopHalf>,
    ctx: WorkGuard,
}

kernel::of_device_table!(
    OF_TABLE,
    MODULE_OF_TABLE,
    <ArduinoIrqDriver as platform::Driver>::IdInfo,
    [(of::DeviceId::new(c_str!("arduino,uno-irq")), ())]
);

impl platform::Driver for ArduinoIrqDriver {
    type IdInfo = ();
    const OF_ID_TABLE: Option<of::IdTable<Self::IdInfo>> = Some(&OF_TABLE);

    fn probe(
        pdev: &platform::Device<Core>,
        _info: Option<&Self::IdInfo>,
    ) -> Result<Pin<KBox<Self>>> {
        let dev = pdev.as_ref();
        let index = *module_parameters::irq_index.value();

        let request = pdev
            .irq_by_index(index)
            .inspect_err(|_| dev_err!(dev, "failed to get irq\n"))?;
        let irq = request.irq();

        let ctx = Arc::pin_init(ArduinoIrqWork::new(pdev.into(), irq), GFP_KERNEL)
            .inspect_err(|_| dev_err!(dev, "failed to allocate memory\n"))?;
        let top_half = TopHalf(ctx.clone());

        let drvdata = KBox::pin_init(
            try_pin_init!(Self {
                irq <- irq::Registration::new(
                    request,
                    irq::Flags::TRIGGER_NONE,
                    IRQ_NAME,
                    top_half,
                ),
                ctx: WorkGuard(ctx),
            }),
            GFP_KERNEL,
        )
        .inspect_err(|_| dev_err!(dev, "failed to request IRQ\n"))?;

        dev_info!(dev, "successfully probed arduino!\n");

        Ok(drvdata)
    }
}

kernel::module_platform_driver! {
    type: ArduinoIrqDriver,
    name: "arduino_irq_workqueue",
    authors: ["Rust for Linux Contributors"],
    description: "Arduino Uno IRQ driver deferring to the system workqueue",
    license: "GPL",
    params: {
        irq_index: u32 {
            default: 0,
            description: "Index of the platform interrupt to request",
        },
    },
}

#[kunit_tests(arduino_irq_workqueue)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use kernel::sync::Completion;

    /// Raises its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    /// A work item whose first run blocks until `release` is completed.
    #[pin_data]
    struct Gate {
        #[pin]
        work: Work<Gate>,
        #[pin]
        started: Completion,
        #[pin]
        release: Completion,
        runs: AtomicU32,
        _dropped: DropFlag,
    }

    impl_has_work! {
        impl HasWork<Self> for Gate { self.work }
    }

    impl WorkItem for Gate {
        type Pointer = Arc<Gate>;

        fn run(this: Arc<Gate>) {
            this.runs.fetch_add(1, Ordering::Relaxed);
            this.started.complete_all();
            this.release.wait_for_completion();
        }
    }

    impl Gate {
        fn new(dropped: Arc<AtomicBool>) -> Result<Arc<Self>> {
            Arc::pin_init(
                pin_init!(Self {
                    work <- new_work!("Gate::work"),
                    started <- Completion::new(),
                    release <- Completion::new(),
                    runs: AtomicU32::new(0),
                    _dropped: DropFlag(dropped),
                }),
                GFP_KERNEL,
            )
        }

        /// Leaves one instance blocked in `run` and a second one pending behind it.
        fn running_and_pending(dropped: Arc<AtomicBool>) -> Result<Arc<Self>> {
            let gate = Self::new(dropped)?;

            assert!(workqueue::system().enqueue(gate.clone()).is_ok());
            gate.started.wait_for_completion();

            // A running work item may be queued again.
            assert!(workqueue::system().enqueue(gate.clone()).is_ok());
            Ok(gate)
        }

        fn runs(&self) -> u32 {
            self.runs.load(Ordering::Relaxed)
        }
    }

    fn new_flag() -> Result<Arc<AtomicBool>> {
        Arc::new(AtomicBool::new(false), GFP_KERNEL)
    }

    #[test]
    fn cancel_idle_work() -> Result {
        let dropped = new_flag()?;
        let gate = Gate::new(dropped.clone())?;

        assert!(!cancel_work_sync(&gate));

        drop(gate);
        assert!(dropped.load(Ordering::Relaxed));
        Ok(())
    }

    #[test]
    fn queued_work_runs() -> Result {
        let dropped = new_flag()?;
        let gate = Gate::new(dropped.clone())?;
        gate.release.complete_all();

        assert!(workqueue::system().enqueue(gate.clone()).is_ok());
        gate.started.wait_for_completion();

        // `run` may still be on its way out; cancelling waits for it and finds nothing pending.
        assert!(!cancel_work_sync(&gate));
        assert_eq!(gate.runs(), 1);

        drop(gate);
        assert!(dropped.load(Ordering::Relaxed));
        Ok(())
    }

    #[test]
    fn enqueue_while_pending_is_refused() -> Result {
        let dropped = new_flag()?;
        let gate = Gate::running_and_pending(dropped.clone())?;

        assert!(workqueue::system().enqueue(gate.clone()).is_err());

        gate.release.complete_all();
        // Lets the pending instance run, then waits for it.
        // SAFETY: `gate.work` is an initialised `Work`.
        unsafe { bindings::flush_work(Work::raw_get(&gate.work)) };
        assert_eq!(gate.runs(), 2);

        drop(gate);
        assert!(dropped.load(Ordering::Relaxed));
        Ok(())
    }

    #[test]
    fn cancelled_pending_work_releases_its_reference() -> Result {
        let dropped = new_flag()?;
        let gate = Gate::running_and_pending(dropped.clone())?;

        // Take the pending instance off the queue without waiting for the running one.
        assert!(cancel_arc_work(&gate, bindings::cancel_work));

        gate.release.complete_all();
        assert!(!cancel_work_sync(&gate));
        assert_eq!(gate.runs(), 1);

        drop(gate);
        assert!(dropped.load(Ordering::Relaxed));
        Ok(())
    }
}
