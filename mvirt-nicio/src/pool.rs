//! Packet buffer pools.
//!
//! A pool hands out fixed-size buffers carved from one mmap'd [`Arena`].
//! Buffers are created lazily up to the pool's limit and recycled through a
//! LIFO free-list, so the most recently released (cache-warm) buffer is
//! reused first. A [`Buffer`] returns itself to its pool when dropped.
//!
//! Pools live in a [`PoolSet`] and are referenced by [`PoolId`]. A pool is
//! created with a size class, or unassigned (size class 0) until a port asks
//! for a buffer size through [`PoolSet::find_for_size`].

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::config::ConfigError;
use crate::error::{Error, Result};
use crate::ids::{PoolId, PortId};

/// Bytes reserved in front of the packet data in every buffer.
pub const HEADROOM: usize = 64;

/// Receive buffer size needed for `mtu`: marvell header, CRC, Ethernet
/// header and one VLAN tag on top of the MTU, rounded to a cache line.
pub fn rx_pkt_size(mtu: usize) -> usize {
    const MH: usize = 2;
    const CRC: usize = 4;
    const ETH_HLEN: usize = 14;
    const VLAN_HLEN: usize = 4;
    const CACHE_LINE: usize = 32;
    (mtu + MH + CRC + ETH_HLEN + VLAN_HLEN).next_multiple_of(CACHE_LINE)
}

/// Identity of a buffer, stable across get/put cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub pool: PoolId,
    pub index: u32,
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pool, self.index)
    }
}

/// Counter snapshot of one pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub id: u16,
    pub size_class: usize,
    pub capacity: usize,
    pub limit: usize,
    pub created: usize,
    pub free: usize,
    pub outstanding: usize,
    pub gets: u64,
    pub puts: u64,
    /// `get` calls that found the pool exhausted.
    pub missed: u64,
    /// Buffers released to the arena because the free-list was full.
    pub stack_full: u64,
    /// Buffers put to a pool that did not issue them.
    pub foreign_puts: u64,
    pub hugepages: bool,
}

struct PoolInner {
    size_class: usize,
    arena: Option<Arena>,
    /// Free-list, top of stack is the next buffer handed out.
    free: Vec<u32>,
    /// Arena slots that currently back no buffer.
    unissued: Vec<u32>,
    limit: usize,
    created: usize,
    gets: u64,
    puts: u64,
    missed: u64,
    stack_full: u64,
    foreign_puts: u64,
}

impl PoolInner {
    fn outstanding(&self) -> usize {
        self.created - self.free.len()
    }

    fn reset_slots(&mut self, capacity: usize) {
        self.free.clear();
        self.unissued = (0..capacity as u32).rev().collect();
        self.created = 0;
    }
}

/// A fixed-capacity pool of equally sized packet buffers.
pub struct BufferPool {
    id: PoolId,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Create a pool. `size_class == 0` creates it unassigned.
    pub fn new(id: PoolId, size_class: usize, capacity: usize) -> Result<Arc<Self>> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(ConfigError::InvalidPoolCapacity(capacity).into());
        }

        let mut inner = PoolInner {
            size_class: 0,
            arena: None,
            free: Vec::with_capacity(capacity),
            unissued: Vec::new(),
            limit: capacity,
            created: 0,
            gets: 0,
            puts: 0,
            missed: 0,
            stack_full: 0,
            foreign_puts: 0,
        };
        if size_class > 0 {
            inner.arena = Some(map_arena(id, size_class, capacity)?);
            inner.size_class = size_class;
            inner.reset_slots(capacity);
        }

        info!(pool = %id, size_class, capacity, "Buffer pool created");

        Ok(Arc::new(Self {
            id,
            capacity,
            inner: Mutex::new(inner),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffer size in bytes, 0 while unassigned.
    pub fn size_class(&self) -> usize {
        self.lock().size_class
    }

    pub fn is_assigned(&self) -> bool {
        self.size_class() > 0
    }

    /// Number of buffers that currently exist (free or outstanding).
    pub fn count(&self) -> usize {
        self.lock().created
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Buffers issued and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding()
    }

    /// Assign a size class to an unassigned pool and map its arena.
    pub fn assign(&self, size_class: usize) -> Result<()> {
        let mut inner = self.lock();
        if inner.size_class == size_class {
            return Ok(());
        }
        if inner.outstanding() > 0 {
            return Err(Error::Busy(format!(
                "{} has {} buffers outstanding",
                self.id,
                inner.outstanding()
            )));
        }
        inner.arena = None;
        inner.arena = Some(map_arena(self.id, size_class, self.capacity)?);
        inner.size_class = size_class;
        inner.reset_slots(self.capacity);
        info!(pool = %self.id, size_class, "Buffer pool assigned");
        Ok(())
    }

    /// Return an idle pool to the unassigned state.
    pub fn unassign(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.outstanding() > 0 {
            return Err(Error::Busy(format!(
                "{} has {} buffers outstanding",
                self.id,
                inner.outstanding()
            )));
        }
        inner.arena = None;
        inner.size_class = 0;
        inner.free.clear();
        inner.unissued.clear();
        inner.created = 0;
        debug!(pool = %self.id, "Buffer pool unassigned");
        Ok(())
    }

    /// Take a buffer: the most recently freed one, else a fresh one while
    /// below the limit. Never blocks.
    pub fn get(self: &Arc<Self>) -> Result<Buffer> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(arena) = inner.arena.as_ref() else {
            inner.missed += 1;
            return Err(exhausted(self.id));
        };

        let index = match inner.free.pop() {
            Some(index) => index,
            None => match inner.unissued.pop() {
                Some(index) if inner.created < inner.limit => {
                    inner.created += 1;
                    index
                }
                Some(index) => {
                    inner.unissued.push(index);
                    inner.missed += 1;
                    return Err(exhausted(self.id));
                }
                None => {
                    inner.missed += 1;
                    return Err(exhausted(self.id));
                }
            },
        };
        inner.gets += 1;

        Ok(Buffer {
            pool: Arc::clone(self),
            index,
            ptr: arena.slot_ptr(index),
            size: arena.stride(),
            offset: HEADROOM,
            len: 0,
        })
    }

    /// Return a buffer. A buffer issued by another pool is counted and
    /// routed back to its owner.
    pub fn put(&self, buffer: Buffer) {
        if !std::ptr::eq(Arc::as_ptr(&buffer.pool), self) {
            self.lock().foreign_puts += 1;
            warn!(
                pool = %self.id,
                buffer = %buffer.handle(),
                "Buffer returned to foreign pool"
            );
        }
        drop(buffer);
    }

    fn recycle(&self, index: u32) {
        let mut inner = self.lock();
        inner.puts += 1;
        if inner.free.len() >= inner.limit {
            inner.stack_full += 1;
            inner.created -= 1;
            inner.unissued.push(index);
        } else {
            inner.free.push(index);
        }
    }

    /// Pre-create up to `n` buffers into the free-list. Returns how many
    /// were added.
    pub fn fill(&self, n: usize) -> usize {
        let mut inner = self.lock();
        if inner.arena.is_none() {
            return 0;
        }
        let mut added = 0;
        while added < n && inner.created < inner.limit {
            let Some(index) = inner.unissued.pop() else {
                break;
            };
            inner.free.push(index);
            inner.created += 1;
            added += 1;
        }
        added
    }

    /// Release up to `n` free buffers back to the arena. Returns how many
    /// were released.
    pub fn trim(&self, n: usize) -> usize {
        let mut inner = self.lock();
        let mut released = 0;
        while released < n {
            let Some(index) = inner.free.pop() else {
                break;
            };
            inner.unissued.push(index);
            inner.created -= 1;
            released += 1;
        }
        released
    }

    /// Change the number of buffers the pool may hold. Free buffers beyond
    /// the new limit are released immediately; outstanding ones are
    /// released as they come back.
    pub fn set_limit(&self, limit: usize) -> Result<()> {
        if limit > self.capacity {
            return Err(ConfigError::LimitAboveCapacity {
                limit,
                capacity: self.capacity,
            }
            .into());
        }
        let mut inner = self.lock();
        inner.limit = limit;
        while inner.created > limit {
            let Some(index) = inner.free.pop() else {
                break;
            };
            inner.unissued.push(index);
            inner.created -= 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            id: self.id.0,
            size_class: inner.size_class,
            capacity: self.capacity,
            limit: inner.limit,
            created: inner.created,
            free: inner.free.len(),
            outstanding: inner.outstanding(),
            gets: inner.gets,
            puts: inner.puts,
            missed: inner.missed,
            stack_full: inner.stack_full,
            foreign_puts: inner.foreign_puts,
            hugepages: inner.arena.as_ref().is_some_and(Arena::using_hugepages),
        }
    }
}

fn map_arena(id: PoolId, size_class: usize, capacity: usize) -> Result<Arena> {
    Arena::new(size_class + HEADROOM, capacity)
        .map_err(|e| Error::ResourceExhausted(format!("cannot map arena for {id}: {e}")))
}

fn exhausted(id: PoolId) -> Error {
    Error::ResourceExhausted(format!("{id} has no free buffer"))
}

/// A packet buffer owned by exactly one holder at a time.
///
/// Returns to its pool when dropped.
pub struct Buffer {
    pool: Arc<BufferPool>,
    index: u32,
    ptr: NonNull<u8>,
    size: usize,
    offset: usize,
    len: usize,
}

// SAFETY: a Buffer is the only handle to its arena slot; the arena outlives
// it through the Arc<BufferPool> (a pool never remaps while buffers are
// outstanding).
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub fn handle(&self) -> BufferHandle {
        BufferHandle {
            pool: self.pool.id,
            index: self.index,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    /// Total bytes available after the headroom.
    pub fn room(&self) -> usize {
        self.size - HEADROOM
    }

    /// Device address of the packet data.
    pub fn dma_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64 + self.offset as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the length of valid data, clamped to the buffer.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.size - self.offset);
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: offset + len never exceeds size, the slot is ours.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(self.offset), self.len) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: offset + len never exceeds size, the slot is ours.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.offset), self.len) }
    }

    /// Whole area from the data start to the end of the buffer.
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: offset <= size, the slot is ours.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(self.offset),
                self.size - self.offset,
            )
        }
    }

    /// Copy `bytes` into the buffer, replacing its contents.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let area = self.write_area();
        let n = bytes.len().min(area.len());
        area[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle())
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.recycle(self.index);
    }
}

/// All pools of the engine, indexed by [`PoolId`].
#[derive(Default)]
pub struct PoolSet {
    pools: RwLock<Vec<Option<Arc<BufferPool>>>>,
}

impl PoolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, size_class: usize, capacity: usize) -> Result<PoolId> {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        let slot = pools.iter().position(Option::is_none).unwrap_or(pools.len());
        let id = PoolId(u16::try_from(slot).map_err(|_| {
            Error::ResourceExhausted("no free pool identifier".to_string())
        })?);
        let pool = BufferPool::new(id, size_class, capacity)?;
        if slot == pools.len() {
            pools.push(Some(pool));
        } else {
            pools[slot] = Some(pool);
        }
        Ok(id)
    }

    pub fn get(&self, id: PoolId) -> Result<Arc<BufferPool>> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools
            .get(id.index())
            .and_then(Option::clone)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<PoolId> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools.iter().flatten().map(|p| p.id()).collect()
    }

    /// Pick the pool serving buffers of `size` bytes for `port`.
    ///
    /// The port's affinity pool wins when it is unassigned or big enough.
    /// Otherwise the lowest unassigned pool is assigned `size`; failing
    /// that, the smallest pool that fits is shared, lowest id first.
    pub fn find_for_size(&self, port: PortId, size: usize) -> Result<Arc<BufferPool>> {
        // Exclusive: two ports must not race for one unassigned pool.
        let pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        let live: Vec<&Arc<BufferPool>> = pools.iter().flatten().collect();

        if let Some(affine) = live.iter().find(|p| port.is_affine(p.id())) {
            let class = affine.size_class();
            if class == 0 {
                affine.assign(size)?;
                return Ok(Arc::clone(affine));
            }
            if class >= size {
                return Ok(Arc::clone(affine));
            }
        }

        if let Some(free) = live.iter().find(|p| !p.is_assigned()) {
            free.assign(size)?;
            return Ok(Arc::clone(free));
        }

        live.iter()
            .filter(|p| p.size_class() >= size)
            .min_by_key(|p| (p.size_class(), p.id()))
            .map(|p| Arc::clone(p))
            .ok_or_else(|| {
                Error::ResourceExhausted(format!("no pool for {size} byte buffers on {port}"))
            })
    }

    /// Return `buffer` through pool `id`.
    pub fn put(&self, id: PoolId, buffer: Buffer) -> Result<()> {
        self.get(id)?.put(buffer);
        Ok(())
    }

    /// Destroy a pool. Fails while any buffer it issued is outstanding.
    pub fn destroy(&self, id: PoolId) -> Result<()> {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        let slot = pools
            .get_mut(id.index())
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let Some(pool) = slot.as_ref() else {
            return Err(Error::NotFound(id.to_string()));
        };
        let outstanding = pool.outstanding();
        if outstanding > 0 {
            return Err(Error::Busy(format!(
                "{id} has {outstanding} buffers outstanding"
            )));
        }
        *slot = None;
        info!(pool = %id, "Buffer pool destroyed");
        Ok(())
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools.iter().flatten().map(|p| p.stats()).collect()
    }
}
