//! Memory-mapped register layout for one EHCI-like device-mode USB
//! controller.
//!
//! Field names and bit positions follow the chipidea/EHCI device
//! controller register map shared by this family of USB peripherals
//! (the same register set NXP's `imxrt-usbd` and this crate's teacher
//! HAL both drive). Each register is a [`crate::dma::Reg`] at a fixed
//! byte offset from the controller's base address — there is no struct
//! overlay here, just offsets, since the register block lives in a
//! fixed peripheral address space rather than DMA-allocated RAM.

use crate::dma::{Reg, RW};

#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UsbCmd {
    pub run_stop: bool,
    pub reset: bool,
    #[bits(2)]
    __: u8,
    pub setup_tripwire: bool,
    #[bits(3)]
    __: u8,
    #[bits(8)]
    pub interrupt_threshold: u8,
    #[bits(8)]
    __: u8,
    pub add_dtd_tripwire: bool,
    #[bits(7)]
    __: u8,
}

#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UsbSts {
    pub ui: bool,
    pub uei: bool,
    pub pci: bool,
    pub fri: bool,
    #[bits(2)]
    __: u8,
    pub sei: bool,
    pub aai: bool,
    pub uri: bool,
    pub sri: bool,
    pub sli: bool,
    #[bits(3)]
    __: u8,
    pub nak_interrupt: bool,
    #[bits(18)]
    __: u32,
}

pub type UsbIntr = UsbSts;

#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceAddr {
    #[bits(24)]
    __: u32,
    pub use_advance: bool,
    #[bits(7)]
    pub address: u8,
}

#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortSc1 {
    pub current_connect_status: bool,
    pub connect_status_change: bool,
    pub port_enable: bool,
    pub port_enable_change: bool,
    pub over_current_active: bool,
    pub over_current_change: bool,
    pub force_port_resume: bool,
    pub suspend: bool,
    pub port_reset: bool,
    #[bits(1)]
    __: u8,
    #[bits(2)]
    pub line_status: u8,
    pub port_power: bool,
    pub port_owner: bool,
    #[bits(2)]
    pub port_speed: u8,
    pub port_test_control_hi: bool,
    #[bits(4)]
    pub port_test_control: u8,
    pub port_indicator_control_hi: bool,
    pub port_indicator_control: bool,
    pub port_enable_port_power_control: bool,
    pub phy_low_power_suspend: bool,
    pub port_force_full_speed_connect: bool,
    #[bits(1)]
    __: u8,
    pub port_speed_2: bool,
    pub phy_clock_disable: bool,
}

impl PortSc1 {
    /// 0b00 = full speed, 0b10 = high speed (the only two reached by
    /// this controller family; 0b01 = low speed never occurs here).
    pub fn speed(self) -> crate::controller::Speed {
        if self.port_speed() & 0b10 != 0 {
            crate::controller::Speed::High
        } else {
            crate::controller::Speed::Full
        }
    }
}

#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UsbMode {
    #[bits(2)]
    pub controller_mode: u8,
    pub setup_lockout_mode: bool,
    #[bits(29)]
    __: u32,
}

impl UsbMode {
    pub const CM_DEVICE: u8 = 0b10;
}

#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtgSc {
    pub vbus_discharge: bool,
    pub vbus_charge: bool,
    #[bits(2)]
    __: u8,
    pub otg_termination: bool,
    #[bits(3)]
    __: u8,
    pub id_pullup: bool,
    #[bits(2)]
    __: u8,
    pub id: bool,
    pub a_vbus_valid: bool,
    pub a_session_valid: bool,
    pub b_session_valid: bool,
    pub b_session_end: bool,
    #[bits(1)]
    __: u8,
    pub data_bus_pulsing: bool,
    #[bits(4)]
    __: u8,
    pub id_interrupt_enable: bool,
    #[bits(2)]
    __: u8,
    pub a_vbus_valid_interrupt_enable: bool,
    pub a_session_valid_interrupt_enable: bool,
    pub b_session_valid_interrupt_enable: bool,
    pub b_session_end_interrupt_enable: bool,
    #[bits(1)]
    __: u8,
    pub data_bus_pulsing_interrupt_enable: bool,
    #[bits(4)]
    __: u8,
}

/// Per-endpoint control register (`ENDPTCTRL0..N`). Index 0 (control
/// endpoint 0) only ever uses the TX/RX enable and stall bits — its
/// transfer type is fixed at `CONTROL` and never reprogrammed.
#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndptCtrl {
    pub rx_stall: bool,
    #[bits(1)]
    __: u8,
    #[bits(2)]
    pub rx_type: u8,
    pub rx_inhibit_setup_status_phase_handshake: bool,
    pub rx_data_toggle_reset: bool,
    pub rx_enable: bool,
    #[bits(8)]
    __: u8,
    pub tx_stall: bool,
    #[bits(1)]
    __: u8,
    #[bits(2)]
    pub tx_type: u8,
    pub tx_inhibit_setup_status_phase_handshake: bool,
    pub tx_data_toggle_reset: bool,
    pub tx_enable: bool,
    #[bits(8)]
    __: u8,
}

/// Fixed register offsets, identical across both controller instances.
pub mod offset {
    pub const USBCMD: usize = 0x140;
    pub const USBSTS: usize = 0x144;
    pub const USBINTR: usize = 0x148;
    pub const DEVICEADDR: usize = 0x154;
    pub const ENDPOINTLISTADDR: usize = 0x158;
    pub const PORTSC1: usize = 0x184;
    pub const OTGSC: usize = 0x1a4;
    pub const USBMODE: usize = 0x1a8;
    pub const ENDPTSETUPSTAT: usize = 0x1ac;
    pub const ENDPTPRIME: usize = 0x1b0;
    pub const ENDPTFLUSH: usize = 0x1b4;
    pub const ENDPTSTAT: usize = 0x1b8;
    pub const ENDPTCOMPLETE: usize = 0x1bc;
    pub const ENDPTCTRL0: usize = 0x1c0;
    pub const ENDPTCTRL_STRIDE: usize = 0x04;
}

/// A single controller's register block, addressed relative to a base
/// pointer. Both controllers on this family of chips expose an identical
/// layout at different base addresses, so one struct serves both.
#[derive(Clone, Copy)]
pub struct RegisterBlock {
    base: *mut u8,
}

unsafe impl Send for RegisterBlock {}
unsafe impl Sync for RegisterBlock {}

impl RegisterBlock {
    /// # Safety
    /// `base` must point at a valid, live instance of this controller's
    /// MMIO register block for as long as the returned value is used.
    pub const unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    #[inline(always)]
    fn reg<T: Copy, A: crate::dma::Access>(&self, offset: usize) -> Reg<T, A> {
        unsafe { Reg::from_ptr(self.base.add(offset) as *mut T) }
    }

    pub fn usbcmd(&self) -> Reg<UsbCmd, RW> {
        self.reg(offset::USBCMD)
    }
    pub fn usbsts(&self) -> Reg<UsbSts, RW> {
        self.reg(offset::USBSTS)
    }
    pub fn usbintr(&self) -> Reg<UsbIntr, RW> {
        self.reg(offset::USBINTR)
    }
    pub fn deviceaddr(&self) -> Reg<DeviceAddr, RW> {
        self.reg(offset::DEVICEADDR)
    }
    pub fn endpointlistaddr(&self) -> Reg<u32, RW> {
        self.reg(offset::ENDPOINTLISTADDR)
    }
    pub fn portsc1(&self) -> Reg<PortSc1, RW> {
        self.reg(offset::PORTSC1)
    }
    pub fn otgsc(&self) -> Reg<OtgSc, RW> {
        self.reg(offset::OTGSC)
    }
    pub fn usbmode(&self) -> Reg<UsbMode, RW> {
        self.reg(offset::USBMODE)
    }
    pub fn endptsetupstat(&self) -> Reg<u32, RW> {
        self.reg(offset::ENDPTSETUPSTAT)
    }
    pub fn endptprime(&self) -> Reg<u32, RW> {
        self.reg(offset::ENDPTPRIME)
    }
    pub fn endptflush(&self) -> Reg<u32, RW> {
        self.reg(offset::ENDPTFLUSH)
    }
    pub fn endptstat(&self) -> Reg<u32, RW> {
        self.reg(offset::ENDPTSTAT)
    }
    pub fn endptcomplete(&self) -> Reg<u32, RW> {
        self.reg(offset::ENDPTCOMPLETE)
    }
    pub fn endptctrl(&self, endpoint_number: usize) -> Reg<EndptCtrl, RW> {
        self.reg(offset::ENDPTCTRL0 + endpoint_number * offset::ENDPTCTRL_STRIDE)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    extern crate std;
    use std::boxed::Box;
    use std::vec;

    /// A register block backed by a real, zeroed block of host memory so
    /// reads/writes/modifies can be exercised without silicon.
    fn sim_block() -> (Box<[u8]>, RegisterBlock) {
        let mut mem = vec![0u8; 0x200].into_boxed_slice();
        let base = mem.as_mut_ptr();
        (mem, unsafe { RegisterBlock::new(base) })
    }

    #[test]
    fn usbcmd_run_stop_round_trips() {
        let (_mem, regs) = sim_block();
        regs.usbcmd().write(|c| {
            c.set_run_stop(true);
        });
        assert!(regs.usbcmd().read().run_stop());
    }

    #[test]
    fn endptctrl_index_uses_four_byte_stride() {
        let (_mem, regs) = sim_block();
        regs.endptctrl(0).write(|c| c.set_tx_enable(true));
        regs.endptctrl(1).write(|c| c.set_rx_enable(true));
        assert!(regs.endptctrl(0).read().tx_enable());
        assert!(!regs.endptctrl(1).read().tx_enable());
        assert!(regs.endptctrl(1).read().rx_enable());
    }

    #[test]
    fn portsc_speed_decodes_high_vs_full() {
        let (_mem, regs) = sim_block();
        regs.portsc1().write(|p| p.set_port_speed(0b10));
        assert_eq!(regs.portsc1().read().speed(), crate::controller::Speed::High);
        regs.portsc1().write(|p| p.set_port_speed(0b00));
        assert_eq!(regs.portsc1().read().speed(), crate::controller::Speed::Full);
    }

    #[test]
    fn modify_preserves_sibling_bits_in_usbcmd() {
        let (_mem, regs) = sim_block();
        regs.usbcmd().write(|c| c.set_run_stop(true));
        regs.usbcmd().modify(|c| c.set_add_dtd_tripwire(true));
        let v = regs.usbcmd().read();
        assert!(v.run_stop());
        assert!(v.add_dtd_tripwire());
    }
}
