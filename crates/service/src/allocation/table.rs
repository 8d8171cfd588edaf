use super::{Allocation, AllocationError, FiveTuple, clamp_lifetime, ports::RelayAllocator};
use crate::ServiceHandler;

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

/// Every live allocation, keyed by five-tuple.
///
/// An allocation leaves the table through exactly one path, which closes
/// it, returns its port to the relay allocator and fires
/// [`ServiceHandler::on_destroy`].
pub struct AllocationTable<T> {
    allocations: RwLock<HashMap<FiveTuple, Arc<Allocation>>>,
    allocator: Box<dyn RelayAllocator>,
    max_allocations: usize,
    handler: T,
}

impl<T> AllocationTable<T>
where
    T: ServiceHandler,
{
    /// `max_allocations` of 0 disables the quota.
    pub fn new(allocator: Box<dyn RelayAllocator>, max_allocations: usize, handler: T) -> Self {
        Self {
            allocations: RwLock::new(HashMap::with_capacity(1024)),
            max_allocations,
            allocator,
            handler,
        }
    }

    pub fn allocator(&self) -> &dyn RelayAllocator {
        self.allocator.as_ref()
    }

    pub fn len(&self) -> usize {
        self.allocations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.read().is_empty()
    }

    /// The live allocation of a five-tuple. One whose lifetime has run out
    /// is released here instead of waiting for the next sweep.
    pub fn get(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let allocation = self.allocations.read().get(five_tuple).cloned()?;
        if allocation.close_if_expired(Instant::now()) {
            self.remove(&allocation);
            return None;
        }

        Some(allocation)
    }

    fn check_capacity(&self, allocations: &HashMap<FiveTuple, Arc<Allocation>>) -> Result<(), AllocationError> {
        if self.max_allocations > 0 && allocations.len() >= self.max_allocations {
            return Err(AllocationError::QuotaReached);
        }

        Ok(())
    }

    /// Install the allocation built by `factory` unless the five-tuple is
    /// already taken, and start its relay loop.
    ///
    /// Concurrent calls for one five-tuple create exactly one allocation,
    /// the losers get [`AllocationError::AlreadyExists`] and whatever their
    /// factory built is released again.
    pub fn get_or_create<F>(
        self: &Arc<Self>,
        five_tuple: FiveTuple,
        factory: F,
    ) -> Result<Arc<Allocation>, AllocationError>
    where
        F: FnOnce() -> Result<Allocation, AllocationError>,
    {
        if self.get(&five_tuple).is_some() {
            return Err(AllocationError::AlreadyExists);
        }

        self.check_capacity(&self.allocations.read())?;

        let allocation = Arc::new(factory()?);

        {
            let mut allocations = self.allocations.write();
            let taken = if allocations.contains_key(&five_tuple) {
                Err(AllocationError::AlreadyExists)
            } else {
                self.check_capacity(&allocations)
            };

            if let Err(e) = taken {
                drop(allocations);

                allocation.close();
                self.allocator.release(&allocation.relayed());
                return Err(e);
            }

            allocations.insert(five_tuple, allocation.clone());
        }

        log::debug!(
            "allocate: client={}, relayed={}, lifetime={}",
            five_tuple.client,
            allocation.relayed(),
            allocation
                .expires()
                .saturating_duration_since(Instant::now())
                .as_secs()
        );

        tokio::spawn(allocation.clone().relay(Arc::downgrade(self)));
        Ok(allocation)
    }

    /// Remove the allocation of a five-tuple, `false` if there was none.
    pub fn delete(&self, five_tuple: &FiveTuple) -> bool {
        let removed = self.allocations.write().remove(five_tuple);
        match removed {
            Some(allocation) => {
                self.release(allocation);
                true
            }
            None => false,
        }
    }

    /// Remove exactly this allocation, a newer one on the same five-tuple is
    /// left alone.
    pub(crate) fn remove(&self, allocation: &Arc<Allocation>) -> bool {
        let removed = {
            let mut allocations = self.allocations.write();
            match allocations.get(allocation.five_tuple()) {
                Some(it) if Arc::ptr_eq(it, allocation) => allocations.remove(allocation.five_tuple()),
                _ => None,
            }
        };

        match removed {
            Some(allocation) => {
                self.release(allocation);
                true
            }
            None => false,
        }
    }

    /// Apply a Refresh, returning the granted lifetime in seconds. A
    /// requested lifetime of zero deletes the allocation.
    pub fn refresh(&self, five_tuple: &FiveTuple, requested: Option<u32>) -> Result<u32, AllocationError> {
        let allocation = self.get(five_tuple).ok_or(AllocationError::NotFound)?;
        if requested == Some(0) {
            return if self.remove(&allocation) {
                Ok(0)
            } else {
                Err(AllocationError::NotFound)
            };
        }

        let lifetime = clamp_lifetime(requested);
        if !allocation.refresh(lifetime) {
            return Err(AllocationError::NotFound);
        }

        Ok(lifetime.as_secs() as u32)
    }

    /// Release every allocation that expired by `now` and prune the
    /// permissions and channel bindings of the others. Returns how many
    /// allocations were released.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired = Vec::new();

        {
            let mut allocations = self.allocations.write();
            allocations.retain(|_, allocation| {
                if allocation.close_if_expired(now) {
                    expired.push(allocation.clone());
                    return false;
                }

                true
            });
        }

        for allocation in self.allocations.read().values() {
            allocation.sweep(now);
        }

        self.allocator.sweep(now);

        let count = expired.len();
        for allocation in expired {
            self.release(allocation);
        }

        count
    }

    fn release(&self, allocation: Arc<Allocation>) {
        allocation.close();
        self.allocator.release(&allocation.relayed());
        self.handler
            .on_destroy(allocation.five_tuple(), allocation.username());

        log::debug!(
            "release: client={}, relayed={}, username={:?}",
            allocation.five_tuple().client,
            allocation.relayed(),
            allocation.username()
        );
    }

    /// Sweep every `period` until the table is dropped.
    pub async fn run_sweeper(this: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;

            let Some(table) = this.upgrade() else {
                break;
            };

            let released = table.sweep(Instant::now());
            if released > 0 {
                log::info!("sweep: released={}, remaining={}", released, table.len());
            }
        }
    }
}
