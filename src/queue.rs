//! Per-endpoint transfer queue: a small pool of pre-allocated
//! [`Transfer`] slots threaded onto a LIFO free-list and a FIFO active-list
//! by index, so no allocator is required once the endpoint is set up.
//!
//! The free-list and active-list are plain software bookkeeping; nothing
//! here pokes hardware. [`crate::controller`] drives the actual priming
//! protocol and calls back into a [`Queue`] only to move slots between
//! lists.

use crate::dma::TransferDescriptor;
use crate::endpoint::EndpointCallback;

/// One in-flight or idle transfer slot. `td` is the DMA-visible transfer
/// descriptor; everything else is private bookkeeping the controller and
/// queue use to chain and complete it.
#[derive(Clone, Copy)]
pub struct Transfer {
    pub td: TransferDescriptor,
    next: Option<u8>,
    maximum_length: usize,
    completion_cb: Option<EndpointCallback>,
    user_data: usize,
}

impl Transfer {
    const fn new() -> Self {
        Self {
            td: TransferDescriptor::const_default(),
            next: None,
            maximum_length: 0,
            completion_cb: None,
            user_data: 0,
        }
    }
}

/// A fixed-size pool of `POOL` [`Transfer`] slots for one endpoint,
/// partitioned at any moment into a free-list (LIFO, by index) and an
/// active-list (FIFO, by index) — the same structure
/// `usb_queue_t`/`usb_transfer_t` implement with real pointers, expressed
/// here with `u8` slot indices so the whole queue stays `Send`+`Sync`
/// without any unsafe pointer aliasing.
pub struct Queue<const POOL: usize> {
    transfers: [Transfer; POOL],
    free_head: Option<u8>,
    active_head: Option<u8>,
    active_tail: Option<u8>,
}

impl<const POOL: usize> Queue<POOL> {
    pub const fn new() -> Self {
        const fn max_slots() -> usize {
            u8::MAX as usize
        }
        assert!(POOL > 0 && POOL <= max_slots(), "pool size must fit in a u8 index");

        let mut transfers = [Transfer::new(); POOL];
        let mut i = 0;
        while i < POOL {
            transfers[i].next = if i + 1 < POOL { Some((i + 1) as u8) } else { None };
            i += 1;
        }
        Self {
            transfers,
            free_head: Some(0),
            active_head: None,
            active_tail: None,
        }
    }

    /// Number of transfers currently queued (not yet completed and
    /// removed from the active-list).
    pub fn active_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.active_head;
        while let Some(i) = cur {
            n += 1;
            cur = self.transfers[i as usize].next;
        }
        n
    }

    pub fn is_full(&self) -> bool {
        self.free_head.is_none()
    }

    /// Pop a slot off the free-list and push it onto the tail of the
    /// active-list, initializing it for `maximum_length` bytes with the
    /// given completion callback. Returns the slot index (used by the
    /// controller to find this transfer's `td` for priming/chaining) and
    /// whether the active-list was empty before this call (the caller
    /// needs this to know whether to prime directly or append via the
    /// ATDTW tripwire).
    pub fn enqueue(
        &mut self,
        maximum_length: usize,
        completion_cb: Option<EndpointCallback>,
        user_data: usize,
    ) -> Option<(u8, bool)> {
        let idx = self.free_head?;
        self.free_head = self.transfers[idx as usize].next;

        self.transfers[idx as usize].next = None;
        self.transfers[idx as usize].maximum_length = maximum_length;
        self.transfers[idx as usize].completion_cb = completion_cb;
        self.transfers[idx as usize].user_data = user_data;

        let was_empty = self.active_head.is_none();
        if let Some(tail) = self.active_tail {
            self.transfers[tail as usize].next = Some(idx);
        } else {
            self.active_head = Some(idx);
        }
        self.active_tail = Some(idx);

        Some((idx, was_empty))
    }

    pub fn transfer(&self, index: u8) -> &Transfer {
        &self.transfers[index as usize]
    }

    /// Slot index of the current active-list tail, if any — the transfer
    /// whose `td.next_dtd` the next `enqueue`'d transfer must be chained
    /// onto for the hardware DMA walk, not just the software list.
    pub fn tail_index(&self) -> Option<u8> {
        self.active_tail
    }

    /// Slot index of the current active-list head, if any — the oldest
    /// outstanding transfer, whose own `td.token()` (not the queue head's
    /// overlay, which only mirrors the single dTD the controller most
    /// recently touched) must be consulted to learn whether the controller
    /// is actually done with it yet.
    pub fn head_index(&self) -> Option<u8> {
        self.active_head
    }

    /// Pop the oldest active transfer (the one the hardware just
    /// completed, per the FIFO submission-order guarantee) and return it
    /// to the free-list, reporting its completion callback/user_data and
    /// the number of bytes actually transferred (`maximum_length -
    /// total_bytes_remaining`).
    pub fn complete_head(&mut self, total_bytes_remaining: u16) -> Option<(Option<EndpointCallback>, usize, usize)> {
        let idx = self.active_head?;
        self.active_head = self.transfers[idx as usize].next;
        if self.active_head.is_none() {
            self.active_tail = None;
        }

        let cb = self.transfers[idx as usize].completion_cb;
        let user_data = self.transfers[idx as usize].user_data;
        let transferred = self.transfers[idx as usize]
            .maximum_length
            .saturating_sub(total_bytes_remaining as usize);

        self.transfers[idx as usize].next = self.free_head;
        self.free_head = Some(idx);

        Some((cb, user_data, transferred))
    }

    /// Drop every in-flight transfer back onto the free-list, invoking
    /// `on_each` once per drained transfer (in FIFO/submission order) with
    /// its per-transfer completion callback and user datum. The caller is
    /// responsible for invoking that callback with length=0, per
    /// `flush_endpoint`'s length=0 completion contract — this method only
    /// handles the list bookkeeping, since it has no business deciding
    /// what "length" means to the caller's endpoint-level callback too.
    pub fn flush(&mut self, mut on_each: impl FnMut(Option<EndpointCallback>, usize)) {
        while let Some(idx) = self.active_head {
            self.active_head = self.transfers[idx as usize].next;
            if self.active_head.is_none() {
                self.active_tail = None;
            }

            let cb = self.transfers[idx as usize].completion_cb;
            let user_data = self.transfers[idx as usize].user_data;
            self.transfers[idx as usize].next = self.free_head;
            self.free_head = Some(idx);

            on_each(cb, user_data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_reports_was_empty_on_first_submission() {
        let mut q: Queue<4> = Queue::new();
        let (idx0, was_empty0) = q.enqueue(64, None, 0).unwrap();
        assert!(was_empty0);
        assert_eq!(idx0, 0);

        let (idx1, was_empty1) = q.enqueue(64, None, 0).unwrap();
        assert!(!was_empty1);
        assert_eq!(idx1, 1);
    }

    #[test]
    fn free_list_exhausts_then_refills_after_complete() {
        let mut q: Queue<2> = Queue::new();
        assert!(q.enqueue(1, None, 0).is_some());
        assert!(q.enqueue(1, None, 0).is_some());
        assert!(q.enqueue(1, None, 0).is_none());
        assert!(q.is_full());

        q.complete_head(0);
        assert!(!q.is_full());
        assert!(q.enqueue(1, None, 0).is_some());
    }

    #[test]
    fn completion_is_fifo_by_submission_order() {
        let mut q: Queue<4> = Queue::new();
        let (first, _) = q.enqueue(10, None, 1).unwrap();
        let (second, _) = q.enqueue(20, None, 2).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);

        let (_, user_data, transferred) = q.complete_head(2).unwrap();
        assert_eq!(user_data, 1);
        assert_eq!(transferred, 8);

        let (_, user_data, transferred) = q.complete_head(0).unwrap();
        assert_eq!(user_data, 2);
        assert_eq!(transferred, 20);
    }

    #[test]
    fn flush_drains_active_list_and_refills_free_list() {
        let mut q: Queue<3> = Queue::new();
        q.enqueue(1, None, 0).unwrap();
        q.enqueue(1, None, 0).unwrap();
        assert_eq!(q.active_len(), 2);
        q.flush(|_, _| {});
        assert_eq!(q.active_len(), 0);
        assert!(!q.is_full());
        assert!(q.enqueue(1, None, 0).is_some());
    }

    #[test]
    fn flush_invokes_each_drained_transfer_in_submission_order() {
        let mut q: Queue<3> = Queue::new();
        q.enqueue(1, None, 1).unwrap();
        q.enqueue(1, None, 2).unwrap();
        q.enqueue(1, None, 3).unwrap();

        let mut seen = [0usize; 3];
        let mut n = 0;
        q.flush(|_, user_data| {
            seen[n] = user_data;
            n += 1;
        });
        assert_eq!(seen, [1, 2, 3]);
    }
}
