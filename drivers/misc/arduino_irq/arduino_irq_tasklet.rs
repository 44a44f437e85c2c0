// SPDX-License-Identifier: GPL-2.0

//! Arduino Uno interrupt driver with a tasklet bottom half.
//!
//! The hard IRQ handler schedules a tasklet and returns; the tasklet then runs in softirq context
//! on the same CPU.

use kernel::{
    c_str,
    device::Core,
    irq::{self, IrqReturn},
    of, platform,
    prelude::*,
    sync::{aref::ARef, Arc},
};

mod tasklet;

use tasklet::{Tasklet, TaskletHandler};

const IRQ_NAME: &CStr = c_str!("arduino_irq_tasklet");

/// Per-device state read by the tasklet.
struct BottomHalf {
    pdev: ARef<platform::Device>,
    irq: u32,
}

impl TaskletHandler for BottomHalf {
    fn run(&self) {
        dev_info!(self.pdev.as_ref(), "irq={} bottom-half executed\n", self.irq);
    }
}

/// Hard IRQ handler; owns a reference to the device's tasklet.
struct TopHalf(Arc<Tasklet<BottomHalf>>);

impl irq::Handler for TopHalf {
    fn handle(&self) -> IrqReturn {
        let bh = self.0.handler();

        dev_info!(bh.pdev.as_ref(), "irq={} top-half executed\n", bh.irq);
        self.0.schedule();

        IrqReturn::Handled
    }
}

#[pin_data(PinnedDrop)]
struct ArduinoIrqDriver {
    // Must be released before the tasklet is killed, or the IRQ could schedule it again.
    #[pin]
    irq: irq::Registration<TopHalf>,
    tasklet: Arc<Tasklet<BottomHalf>>,
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

        let bottom_half = BottomHalf {
            pdev: pdev.into(),
            irq,
        };
        let tasklet = Arc::pin_init(Tasklet::new(bottom_half), GFP_KERNEL)
            .inspect_err(|_| dev_err!(dev, "failed to allocate memory\n"))?;
        let top_half = TopHalf(tasklet.clone());

        let drvdata = KBox::pin_init(
            try_pin_init!(Self {
                irq <- irq::Registration::new(
                    request,
                    irq::Flags::TRIGGER_NONE,
                    IRQ_NAME,
                    top_half,
                ),
                tasklet,
            }),
            GFP_KERNEL,
        )
        .inspect_err(|_| dev_err!(dev, "failed to request IRQ\n"))?;

        dev_info!(dev, "successfully probed arduino!\n");

        Ok(drvdata)
    }
}

#[pinned_drop]
impl PinnedDrop for ArduinoIrqDriver {
    fn drop(self: Pin<&mut Self>) {
        let bh = self.tasklet.handler();

        dev_dbg!(bh.pdev.as_ref(), "releasing irq={}\n", bh.irq);
    }
}

kernel::module_platform_driver! {
    type: ArduinoIrqDriver,
    name: "arduino_irq_tasklet",
    authors: ["Rust for Linux Contributors"],
    description: "Arduino Uno IRQ driver deferring to a tasklet",
    license: "GPL",
    params: {
        irq_index: u32 {
            default: 0,
            description: "Index of the platform interrupt to request",
        },
    },
}
