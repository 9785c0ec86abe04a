//! Controller driver: register-level operations for one EHCI-like
//! device-mode USB controller — reset, run/stop, bus reset, address
//! application, speed/attach/suspend queries, VBUS and PHY power
//! control, the endpoint priming/flushing/tripwire protocol, and the
//! interrupt-status dispatcher.
//!
//! Every operation here takes a [`ControllerInfo`] rather than branching
//! on a controller index at each call site — the two controllers differ
//! only in register base address and endpoint count, both of which live
//! in that struct.

use crate::dma::{NextDtd, QueueHead};
use crate::regs::{EndptCtrl, RegisterBlock, UsbMode};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Full,
    High,
}

/// Interrupt-status bits, matching `USBSTS`/`USBINTR` bit positions.
pub mod status {
    pub const USB_INTERRUPT: u32 = 1 << 0;
    pub const USB_ERROR_INTERRUPT: u32 = 1 << 1;
    pub const PORT_CHANGE: u32 = 1 << 2;
    pub const FRAME_ROLLOVER: u32 = 1 << 3;
    pub const SYSTEM_ERROR: u32 = 1 << 4;
    pub const ASYNC_ADVANCE: u32 = 1 << 5;
    pub const USB_RESET: u32 = 1 << 6;
    pub const SOF: u32 = 1 << 7;
    pub const SUSPEND: u32 = 1 << 8;
    pub const NAK_INTERRUPT: u32 = 1 << 16;
}

/// A controller's fixed identity: its register base and how many
/// endpoints (in each direction) it exposes. Controller 0 has 6,
/// controller 1 has 4, on this chip family.
#[derive(Clone, Copy)]
pub struct ControllerInfo {
    pub regs: RegisterBlock,
    pub endpoint_count: usize,
}

impl ControllerInfo {
    /// # Safety
    /// `base` must be the valid, live MMIO base address of this
    /// controller for the lifetime of the returned value.
    pub const unsafe fn new(base: *mut u8, endpoint_count: usize) -> Self {
        Self {
            regs: RegisterBlock::new(base),
            endpoint_count,
        }
    }

    /// Bit mask covering every implemented endpoint in both directions
    /// (bit `i` = OUT endpoint `i`, bit `16+i` = IN endpoint `i`), used by
    /// the all-endpoints reset/flush operations.
    pub fn all_endpoints_mask(&self) -> u32 {
        let lo = (1u32 << self.endpoint_count) - 1;
        lo | (lo << 16)
    }

    fn endpoint_bit(&self, endpoint_number: u8, is_in: bool) -> u32 {
        let bit = 1u32 << endpoint_number;
        if is_in {
            bit << 16
        } else {
            bit
        }
    }

    // ---- controller-wide operations --------------------------------

    pub fn run(&self) {
        self.regs.usbcmd().modify(|c| {
            c.set_run_stop(true);
        });
    }

    pub fn stop(&self) {
        self.regs.usbcmd().modify(|c| {
            c.set_run_stop(false);
        });
    }

    pub fn is_resetting(&self) -> bool {
        self.regs.usbcmd().read().reset()
    }

    /// Disable every endpoint, clear every pending interrupt and
    /// setup/complete latch, and flush anything still primed — the part
    /// of a bus reset (USB 2.0 §9.1.1.5) that doesn't touch the
    /// controller's own internal state machines. Used both stand-alone,
    /// on a `USB_RESET` interrupt, and as the first step of the heavier
    /// [`ControllerInfo::reset`].
    pub fn reset_all_endpoints(&self) {
        self.disable_all_endpoints();
        self.clear_all_pending_interrupts();
        self.flush_all_primed_endpoints();
    }

    /// Reset internal pipelines/timers/state machines to their initial
    /// values. Busy-waits for the reset bit to self-clear — one of the
    /// three bounded busy-wait loops this core uses. Not recommended
    /// while a host is attached; detach first via
    /// [`ControllerInfo::reset_all_endpoints`] and
    /// [`ControllerInfo::stop`].
    pub fn reset(&self) {
        self.reset_all_endpoints();
        self.stop();
        self.regs.usbcmd().write_value(crate::regs::UsbCmd::new().with_reset(true));
        while self.is_resetting() {}
    }

    pub fn set_device_mode(&self) {
        self.regs.usbmode().write(|m| {
            m.set_controller_mode(UsbMode::CM_DEVICE);
        });
    }

    /// Program `ENDPOINTLISTADDR` and enable the given interrupt mask;
    /// call after [`ControllerInfo::reset`] and [`set_device_mode`], once
    /// the queue-head array's address is known.
    pub fn init(&self, qh_base: u32, interrupt_mask: u32) {
        self.regs.usbcmd().modify(|c| c.set_interrupt_threshold(0));
        self.regs.endpointlistaddr().write_value(qh_base);
        self.regs.usbintr().write_value(crate::regs::UsbIntr::from_bits(interrupt_mask));
        self.reset_all_endpoint_types();
    }

    /// Force every endpoint but 0 to `BULK` in both directions — the
    /// silicon erratum workaround this controller family requires, run
    /// once at init and again after every bus reset.
    pub fn reset_all_endpoint_types(&self) {
        for n in 1..self.endpoint_count {
            self.regs.endptctrl(n).modify(|c| {
                c.set_tx_type(crate::endpoint::TransferType::Bulk.bits());
                c.set_rx_type(crate::endpoint::TransferType::Bulk.bits());
            });
        }
    }

    pub fn speed(&self) -> Speed {
        self.regs.portsc1().read().speed()
    }

    pub fn is_attached(&self) -> bool {
        self.regs.portsc1().read().current_connect_status()
    }

    pub fn is_suspended(&self) -> bool {
        self.regs.portsc1().read().suspend()
    }

    pub fn set_vbus_charge(&self, enabled: bool) {
        self.regs.otgsc().modify(|o| {
            o.set_vbus_charge(enabled);
            if enabled {
                o.set_vbus_discharge(false);
            }
        });
    }

    pub fn set_vbus_discharge(&self, enabled: bool) {
        self.regs.otgsc().modify(|o| {
            o.set_vbus_discharge(enabled);
            if enabled {
                o.set_vbus_charge(false);
            }
        });
    }

    pub fn set_phy_clock_enabled(&self, enabled: bool) {
        self.regs.portsc1().modify(|p| p.set_phy_clock_disable(!enabled));
    }

    pub fn set_address_immediate(&self, address: u8) {
        self.regs.deviceaddr().write(|a| {
            a.set_address(address);
        });
    }

    /// `SET_ADDRESS` applies only once the status stage completes;
    /// `USBADRA` tells the controller to latch the new address
    /// automatically at that point instead of requiring a second write.
    pub fn set_address_deferred(&self, address: u8) {
        self.regs.deviceaddr().write(|a| {
            a.set_address(address);
            a.set_use_advance(true);
        });
    }

    // ---- status read/clear -----------------------------------------

    fn clear_status(&self, bits: u32) {
        self.regs.usbsts().write_value(crate::regs::UsbSts::from_bits(bits));
    }

    /// Read the pending, interrupt-enabled status bits and atomically
    /// clear exactly the bits just read (never a flag set afterward,
    /// since writing 1 to a status bit only clears that bit).
    pub fn take_status(&self) -> u32 {
        let status = self.regs.usbsts().read().into_bits() & self.regs.usbintr().read().into_bits();
        self.clear_status(status);
        status
    }

    fn clear_all_pending_interrupts(&self) {
        self.clear_status(0xffff_ffff);
        self.regs.endptsetupstat().write_value(0xffff_ffff);
        self.regs.endptcomplete().write_value(0xffff_ffff);
    }

    fn disable_all_endpoints(&self) {
        for n in 0..self.endpoint_count {
            self.regs.endptctrl(n).modify(|c| {
                c.set_rx_enable(false);
                c.set_tx_enable(false);
            });
        }
    }

    // ---- endpoint priming/flushing protocol -------------------------

    fn wait_for_priming_to_finish(&self, mask: u32) {
        while self.regs.endptprime().read() & mask != 0 {}
    }

    fn wait_for_flushing_to_finish(&self, mask: u32) {
        while self.regs.endptflush().read() & mask != 0 {}
    }

    fn flush_primed_endpoints(&self, mask: u32) {
        self.wait_for_priming_to_finish(mask);
        self.regs.endptflush().write_value(mask);
        self.wait_for_flushing_to_finish(mask);
    }

    fn flush_all_primed_endpoints(&self) {
        self.flush_primed_endpoints(0xffff_ffff);
    }

    pub fn endpoint_set_type(&self, address: u8, transfer_type: crate::endpoint::TransferType) {
        let n = crate::endpoint::number(address) as usize;
        self.regs.endptctrl(n).modify(|c| {
            if crate::endpoint::is_in(address) {
                c.set_tx_type(transfer_type.bits());
            } else {
                c.set_rx_type(transfer_type.bits());
            }
        });
    }

    pub fn endpoint_enable(&self, address: u8) {
        let n = crate::endpoint::number(address) as usize;
        self.regs.endptctrl(n).modify(|c: &mut EndptCtrl| {
            if crate::endpoint::is_in(address) {
                c.set_tx_enable(true);
            } else {
                c.set_rx_enable(true);
            }
        });
    }

    pub fn endpoint_disable(&self, address: u8) {
        self.endpoint_flush(address);
        let n = crate::endpoint::number(address) as usize;
        self.regs.endptctrl(n).modify(|c: &mut EndptCtrl| {
            if crate::endpoint::is_in(address) {
                c.set_tx_enable(false);
            } else {
                c.set_rx_enable(false);
            }
        });
    }

    pub fn endpoint_stall(&self, address: u8) {
        let n = crate::endpoint::number(address) as usize;
        self.regs.endptctrl(n).modify(|c: &mut EndptCtrl| {
            c.set_rx_stall(true);
            c.set_tx_stall(true);
        });
    }

    /// Clear stall and reset the data toggle, as required after
    /// `CLEAR_FEATURE(ENDPOINT_HALT)` (USB 2.0 §9.4.5).
    pub fn endpoint_clear_stall(&self, address: u8) {
        let n = crate::endpoint::number(address) as usize;
        self.regs.endptctrl(n).modify(|c: &mut EndptCtrl| {
            if crate::endpoint::is_in(address) {
                c.set_tx_stall(false);
                c.set_tx_data_toggle_reset(true);
            } else {
                c.set_rx_stall(false);
                c.set_rx_data_toggle_reset(true);
            }
        });
    }

    pub fn endpoint_is_stalled(&self, address: u8) -> bool {
        let n = crate::endpoint::number(address) as usize;
        let ctrl = self.regs.endptctrl(n).read();
        if crate::endpoint::is_in(address) {
            ctrl.tx_stall()
        } else {
            ctrl.rx_stall()
        }
    }

    pub fn endpoint_flush(&self, address: u8) {
        let n = crate::endpoint::number(address);
        let mask = self.endpoint_bit(n, crate::endpoint::is_in(address));
        self.flush_primed_endpoints(mask);
    }

    /// Point the queue head at `first_td`, clear active/halted, and poke
    /// `ENDPTPRIME` — the only way to start the controller walking a
    /// (previously idle) endpoint's descriptor chain.
    pub fn endpoint_prime(&self, address: u8, qh: &QueueHead, first_td_addr: u32) {
        #[cfg(feature = "defmt")]
        defmt::trace!("endpoint_prime addr={:x} td={:x}", address, first_td_addr);
        qh.next_dtd().write_value(NextDtd::pointer(first_td_addr));
        qh.token().modify(|t| {
            t.set_active(false);
            t.set_halted(false);
        });
        let n = crate::endpoint::number(address);
        let mask = self.endpoint_bit(n, crate::endpoint::is_in(address));
        self.regs.endptprime().write_value(mask);
    }

    pub fn endpoint_is_priming(&self, address: u8) -> bool {
        let n = crate::endpoint::number(address);
        let mask = self.endpoint_bit(n, crate::endpoint::is_in(address));
        self.regs.endptprime().read() & mask != 0
    }

    /// `ENDPTSTAT` bit for this endpoint/direction: set while the
    /// controller still owns an active descriptor for it.
    pub fn endpoint_is_ready(&self, address: u8) -> bool {
        let n = crate::endpoint::number(address);
        let mask = self.endpoint_bit(n, crate::endpoint::is_in(address));
        self.regs.endptstat().read() & mask != 0
    }

    pub fn endpoint_is_complete(&self, address: u8) -> bool {
        let n = crate::endpoint::number(address);
        let mask = self.endpoint_bit(n, crate::endpoint::is_in(address));
        self.regs.endptcomplete().read() & mask != 0
    }

    /// Start a fresh (previously idle) chain: wait for any previous
    /// activity on this endpoint to quiesce, terminate `td`, then prime.
    pub fn endpoint_schedule_wait(&self, address: u8, qh: &QueueHead, td: &crate::dma::TransferDescriptor, td_addr: u32) {
        while self.endpoint_is_ready(address) {}
        td.next_dtd().write_value(NextDtd::TERMINATE);
        self.endpoint_prime(address, qh, td_addr);
    }

    /// Append `new_td` onto an endpoint that may already be executing a
    /// chain, using the `ADD_DTD_TRIPWIRE` (ATDTW) handshake: link the
    /// new descriptor onto the current tail, then — unless the endpoint
    /// is still in the middle of being primed — set ATDTW, sample
    /// whether the endpoint is still "ready" on every poll of the
    /// tripwire bit, and once ATDTW reads back set, clear it. If the
    /// last-sampled "ready" reading was false, the controller had
    /// already finished the chain and dropped off the active list before
    /// the new descriptor was linked in, so this primes it directly
    /// instead of relying on the (now-stopped) hardware walk to notice.
    pub fn endpoint_schedule_append(
        &self,
        address: u8,
        qh: &QueueHead,
        tail_td: &crate::dma::TransferDescriptor,
        new_td_addr: u32,
    ) {
        #[cfg(feature = "defmt")]
        defmt::trace!("endpoint_schedule_append addr={:x} td={:x}", address, new_td_addr);
        tail_td.next_dtd().write_value(NextDtd::pointer(new_td_addr));

        if self.endpoint_is_priming(address) {
            return;
        }

        let mut done = false;
        loop {
            self.regs.usbcmd().modify(|c| c.set_add_dtd_tripwire(true));
            done = self.endpoint_is_ready(address);
            if self.regs.usbcmd().read().add_dtd_tripwire() {
                break;
            }
        }
        self.regs.usbcmd().modify(|c| c.set_add_dtd_tripwire(false));

        if !done {
            self.endpoint_prime(address, qh, new_td_addr);
        }
    }

    // ---- interrupt dispatch ------------------------------------------

    /// Read `USBSTS & USBINTR` (clearing what was read), translate the
    /// `OTGSC` attach/detach latch bits separately (they live outside
    /// `USBSTS`), and hand the decoded bits to the caller. This is the
    /// body every controller's interrupt trampoline runs — there is no
    /// special-cased second controller.
    pub fn poll_interrupt(&self) -> InterruptEvents {
        let status = self.take_status();

        let otgsc = self.regs.otgsc().read();
        let mut attach = false;
        let mut detach = false;
        if otgsc.b_session_end_interrupt_enable() {
            self.regs.otgsc().modify(|o| o.set_b_session_end_interrupt_enable(false));
            detach = true;
        }
        if otgsc.b_session_valid_interrupt_enable() {
            self.regs.otgsc().modify(|o| o.set_b_session_valid_interrupt_enable(false));
            attach = true;
        }

        InterruptEvents { status, attach, detach }
    }
}

/// Decoded result of one `poll_interrupt` call.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptEvents {
    pub status: u32,
    pub attach: bool,
    pub detach: bool,
}

impl InterruptEvents {
    pub fn bus_reset(&self) -> bool {
        self.status & status::USB_RESET != 0
    }
    pub fn port_change(&self) -> bool {
        self.status & status::PORT_CHANGE != 0
    }
    pub fn suspend(&self) -> bool {
        self.status & status::SUSPEND != 0
    }
    pub fn start_of_frame(&self) -> bool {
        self.status & status::SOF != 0
    }
    pub fn usb_interrupt(&self) -> bool {
        self.status & status::USB_INTERRUPT != 0
    }
    pub fn usb_error(&self) -> bool {
        self.status & status::USB_ERROR_INTERRUPT != 0
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    extern crate std;
    use std::boxed::Box;

    fn sim_controller(endpoint_count: usize) -> (Box<[u8]>, ControllerInfo) {
        let mut mem = std::vec![0u8; 0x200].into_boxed_slice();
        let base = mem.as_mut_ptr();
        (mem, unsafe { ControllerInfo::new(base, endpoint_count) })
    }

    #[test]
    fn all_endpoints_mask_covers_out_and_in_bits() {
        let (_mem, c) = sim_controller(6);
        assert_eq!(c.all_endpoints_mask(), 0x0000_003f | (0x0000_003f << 16));
    }

    #[test]
    fn take_status_masks_by_enabled_interrupts_and_clears() {
        let (_mem, c) = sim_controller(6);
        c.regs.usbintr().write_value(crate::regs::UsbIntr::from_bits(status::USB_RESET));
        c.regs
            .usbsts()
            .write_value(crate::regs::UsbSts::from_bits(status::USB_RESET | status::SOF));

        let s = c.take_status();
        assert_eq!(s, status::USB_RESET);
        assert_eq!(c.regs.usbsts().read().into_bits(), 0);
    }

    #[test]
    fn endpoint_enable_sets_only_the_requested_direction() {
        let (_mem, c) = sim_controller(6);
        c.endpoint_enable(0x82);
        let ctrl = c.regs.endptctrl(2).read();
        assert!(ctrl.tx_enable());
        assert!(!ctrl.rx_enable());
    }

    #[test]
    fn stall_then_clear_stall_resets_data_toggle() {
        let (_mem, c) = sim_controller(6);
        c.endpoint_stall(0x01);
        assert!(c.endpoint_is_stalled(0x01));
        c.endpoint_clear_stall(0x01);
        assert!(!c.endpoint_is_stalled(0x01));
        assert!(c.regs.endptctrl(1).read().rx_data_toggle_reset());
    }

    #[test]
    fn deferred_address_sets_use_advance_bit() {
        let (_mem, c) = sim_controller(6);
        c.set_address_deferred(5);
        let a = c.regs.deviceaddr().read();
        assert_eq!(a.address(), 5);
        assert!(a.use_advance());
    }

    #[test]
    fn immediate_address_does_not_set_use_advance_bit() {
        let (_mem, c) = sim_controller(6);
        c.set_address_immediate(5);
        assert!(!c.regs.deviceaddr().read().use_advance());
    }

    #[test]
    fn reset_all_endpoint_types_skips_endpoint_zero() {
        let (_mem, c) = sim_controller(6);
        c.regs.endptctrl(0).write(|e| e.set_tx_type(crate::endpoint::TransferType::Control.bits()));
        c.reset_all_endpoint_types();
        assert_eq!(c.regs.endptctrl(0).read().tx_type(), crate::endpoint::TransferType::Control.bits());
        assert_eq!(c.regs.endptctrl(1).read().tx_type(), crate::endpoint::TransferType::Bulk.bits());
    }

    #[test]
    fn vbus_charge_and_discharge_are_mutually_exclusive() {
        let (_mem, c) = sim_controller(6);
        c.set_vbus_charge(true);
        assert!(c.regs.otgsc().read().vbus_charge());
        assert!(!c.regs.otgsc().read().vbus_discharge());
        c.set_vbus_discharge(true);
        assert!(c.regs.otgsc().read().vbus_discharge());
        assert!(!c.regs.otgsc().read().vbus_charge());
    }
}
