//! Bounded slot allocator.
//!
//! [`SlotAllocator`] hands out integer slot numbers in `0..capacity` and makes
//! callers wait while every slot is taken. It is the gate that bounds the
//! number of pump stages running across all open pipelines.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A counting gate that lends out numbered slots.
///
/// Slot selection starts at the most recently released slot and scans
/// forward, so a slot that was just returned is handed out again first. This
/// is a rotating hint, not a FIFO queue: waiters are woken together and race
/// for the free slot.
pub struct SlotAllocator {
    state: Mutex<State>,
    released: Notify,
}

struct State {
    used: Vec<bool>,
    hint: usize,
    free: usize,
}

impl SlotAllocator {
    /// Creates an allocator with `capacity` slots. A capacity of zero is
    /// allowed; every `acquire` then waits until it is cancelled.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                used: vec![false; capacity],
                hint: 0,
                free: capacity,
            }),
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().used.len()
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.state.lock().free
    }

    /// Waits for a free slot, marks it used and returns its index.
    ///
    /// Returns `None` if `cancel` fires before a slot becomes free.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<usize> {
        loop {
            // Register interest before checking so a release between the check
            // and the await is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.try_acquire() {
                return Some(slot);
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("slot acquire cancelled");
                    return None;
                }
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but the slot is returned to the pool
    /// when the [`OwnedSlot`] is dropped.
    pub async fn acquire_owned(self: Arc<Self>, cancel: &CancellationToken) -> Option<OwnedSlot> {
        let slot = self.acquire(cancel).await?;
        Some(OwnedSlot {
            allocator: self,
            slot,
        })
    }

    /// Takes a free slot without waiting.
    pub fn try_acquire(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.free == 0 {
            return None;
        }
        let len = state.used.len();
        let start = state.hint;
        let slot = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| !state.used[idx])?;
        state.used[slot] = true;
        state.free -= 1;
        state.hint = (slot + 1) % len;
        Some(slot)
    }

    /// Returns `slot` to the pool and wakes every waiter.
    ///
    /// No validation is performed. The caller must currently hold `slot`
    /// (obtained from [`acquire`](Self::acquire) or
    /// [`try_acquire`](Self::try_acquire) and not yet released); releasing a
    /// slot the caller does not hold corrupts the free count.
    pub fn release(&self, slot: usize) {
        {
            let mut state = self.state.lock();
            state.used[slot] = false;
            state.free += 1;
            state.hint = slot;
        }
        self.released.notify_waiters();
    }
}

/// A slot that is released back to its allocator on drop.
#[derive(Debug)]
pub struct OwnedSlot {
    allocator: Arc<SlotAllocator>,
    slot: usize,
}

impl OwnedSlot {
    pub const fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for OwnedSlot {
    fn drop(&mut self) {
        self.allocator.release(self.slot);
    }
}

impl core::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SlotAllocator")
            .field("capacity", &state.used.len())
            .field("free", &state.free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn hands_out_distinct_slots_up_to_capacity() {
        let slots = SlotAllocator::new(3);
        let cancel = CancellationToken::new();
        let mut got = vec![
            slots.acquire(&cancel).await.unwrap(),
            slots.acquire(&cancel).await.unwrap(),
            slots.acquire(&cancel).await.unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(slots.available(), 0);
        assert!(slots.try_acquire().is_none());
    }

    #[tokio::test]
    async fn prefers_most_recently_released_slot() {
        let slots = SlotAllocator::new(4);
        for _ in 0..4 {
            slots.try_acquire().unwrap();
        }
        slots.release(2);
        assert_eq!(slots.try_acquire(), Some(2));
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let slots = Arc::new(SlotAllocator::new(1));
        let cancel = CancellationToken::new();
        let held = slots.acquire(&cancel).await.unwrap();

        let waiter = {
            let slots = Arc::clone(&slots);
            let cancel = cancel.clone();
            tokio::spawn(async move { slots.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        slots.release(held);

        let slot = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot, Some(0));
    }

    #[tokio::test]
    async fn owned_slot_is_returned_on_drop() {
        let slots = Arc::new(SlotAllocator::new(1));
        let cancel = CancellationToken::new();
        let owned = Arc::clone(&slots).acquire_owned(&cancel).await.unwrap();
        assert_eq!(owned.slot(), 0);
        assert_eq!(slots.available(), 0);
        drop(owned);
        assert_eq!(slots.available(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_gets_none() {
        let slots = SlotAllocator::new(0);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        assert_eq!(slots.acquire(&cancel).await, None);
    }
}
