//! Part buffer pool
//!
//! A capacity-bounded pool of fixed-size byte buffers. Workers lease one
//! buffer per in-flight part, so the pool's ceiling (not the number of
//! queued parts) bounds transfer memory. Leases are RAII: dropping a
//! [`PartBuffer`] returns its slot, and recycles the allocation when it
//! still holds its full capacity.
//!
//! A pool can be owned by a single transfer call or shared across transfers
//! of a reused `Downloader`/`Uploader`; sharing callers grow the ceiling for
//! the duration of each transfer through [`PartPool::lease`]. A pool only
//! ever hands out buffers of one size — reconfiguring the part size means a
//! fresh pool.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::TransferError;

/// Bounded pool of `part_size`-capacity buffers.
pub struct PartPool {
    part_size: usize,
    slots: Arc<Semaphore>,
    free: Mutex<Vec<BytesMut>>,
    /// Capacity shrink that could not be applied immediately because every
    /// slot was leased out; settled as buffers come back.
    debt: AtomicUsize,
}

impl PartPool {
    /// Create a pool that allows at most `capacity` live buffers of
    /// `part_size` bytes.
    pub fn new(part_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            part_size,
            slots: Arc::new(Semaphore::new(capacity)),
            free: Mutex::new(Vec::new()),
            debt: AtomicUsize::new(0),
        })
    }

    /// Size of the buffers this pool hands out.
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Lease a buffer, waiting until a slot is free. Returns an error once
    /// the pool has been closed; dropping the returned future releases
    /// nothing, so cancellation cannot leak a slot.
    pub async fn get(self: &Arc<Self>) -> Result<PartBuffer, TransferError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Canceled("buffer pool closed".into()))?;

        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.part_size));

        Ok(PartBuffer {
            buf,
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    /// Permanently release every waiter; subsequent `get` calls fail.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Adjust the ceiling by `delta` live buffers. Shrinking takes effect
    /// immediately for unleased slots and is settled lazily for slots
    /// currently out on lease.
    pub fn modify_capacity(&self, delta: isize) {
        if delta >= 0 {
            self.slots.add_permits(delta as usize);
            return;
        }

        let mut remaining = delta.unsigned_abs();
        while remaining > 0 {
            match self.slots.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    self.free.lock().pop();
                    remaining -= 1;
                }
                Err(_) => break,
            }
        }
        if remaining > 0 {
            self.debt.fetch_add(remaining, Ordering::AcqRel);
        }
    }

    /// Grow the ceiling by `extra` for the lifetime of the returned guard.
    pub fn lease(self: &Arc<Self>, extra: usize) -> CapacityLease {
        self.modify_capacity(extra as isize);
        CapacityLease {
            pool: Arc::clone(self),
            extra,
        }
    }

    fn settle_one_debt(&self) -> bool {
        self.debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                debt.checked_sub(1)
            })
            .is_ok()
    }

    fn restore(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() >= self.part_size {
            self.free.lock().push(buf);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// A leased part buffer. Dereferences to [`BytesMut`]; dropping it returns
/// the slot (and, when the allocation is intact, the buffer) to the pool.
pub struct PartBuffer {
    buf: BytesMut,
    pool: Arc<PartPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PartBuffer {
    /// Freeze the contents into `Bytes`, handing the allocation away. The
    /// slot stays held until the `PartBuffer` itself is dropped.
    pub fn take_bytes(&mut self) -> bytes::Bytes {
        mem::take(&mut self.buf).freeze()
    }
}

impl std::ops::Deref for PartBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl std::ops::DerefMut for PartBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PartBuffer {
    fn drop(&mut self) {
        if self.pool.settle_one_debt() {
            // This slot was scheduled for removal: keep the permit forgotten
            // instead of releasing it.
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
            return;
        }
        self.pool.restore(mem::take(&mut self.buf));
    }
}

/// Guard returned by [`PartPool::lease`]; shrinks the ceiling back on drop.
pub struct CapacityLease {
    pool: Arc<PartPool>,
    extra: usize,
}

impl Drop for CapacityLease {
    fn drop(&mut self) {
        self.pool.modify_capacity(-(self.extra as isize));
    }
}
