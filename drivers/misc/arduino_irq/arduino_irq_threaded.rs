// SPDX-License-Identifier: GPL-2.0

//! Arduino Uno interrupt driver with a threaded bottom half.
//!
//! The hard IRQ handler only wakes the IRQ thread, which the kernel creates for this interrupt
//! line when the handler is registered.

use kernel::{
    c_str,
    device::Core,
    irq::{self, IrqReturn, ThreadedIrqReturn},
    of, platform,
    prelude::*,
    sync::aref::ARef,
};

const IRQ_NAME: &CStr = c_str!("arduino_irq_threaded");

struct ArduinoIrqThreaded {
    pdev: ARef<platform::Device>,
    irq: u32,
}

impl irq::ThreadedHandler for ArduinoIrqThreaded {
    fn handle(&self) -> ThreadedIrqReturn {
        dev_info!(self.pdev.as_ref(), "irq={} top-half executed\n", self.irq);
        ThreadedIrqReturn::WakeThread
    }

    fn handle_threaded(&self) -> IrqReturn {
        dev_info!(self.pdev.as_ref(), "irq={} bottom-half executed\n", self.irq);
        IrqReturn::Handled
    }
}

#[pin_data(PinnedDrop)]
struct ArduinoIrqDriver {
    #[pin]
    irq: irq::ThreadedRegistration<ArduinoIrqThreaded>,
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

        let handler = ArduinoIrqThreaded {
            pdev: pdev.into(),
            irq: request.irq(),
        };

        let drvdata = KBox::pin_init(
            try_pin_init!(Self {
                irq <- irq::ThreadedRegistration::new(
                    request,
                    irq::Flags::TRIGGER_NONE,
                    IRQ_NAME,
                    handler,
                ),
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
        let handler = self.irq.handler();

        // Dropping the registration frees the line and stops the IRQ thread.
        dev_dbg!(handler.pdev.as_ref(), "releasing irq={}\n", handler.irq);
    }
}

kernel::module_platform_driver! {
    type: ArduinoIrqDriver,
    name: "arduino_irq_threaded",
    authors: ["Rust for Linux Contributors"],
    description: "Arduino Uno IRQ driver with a threaded bottom half",
    license: "GPL",
    params: {
        irq_index: u32 {
            default: 0,
            description: "Index of the platform interrupt to request",
        },
    },
}
