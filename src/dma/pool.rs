// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, trace, warn};

use crate::dma::{BusAddr, DmaError};

/// Size of one mapped page. Chunks never cross a page boundary.
pub const PAGE_SIZE: usize = 4096;
/// Smallest chunk handed out (16 bytes).
pub const MIN_CHUNK_SHIFT: u32 = 4;
const PAGE_SHIFT: u32 = 12;
const NUM_CLASSES: usize = (PAGE_SHIFT - MIN_CHUNK_SHIFT + 1) as usize;

/// A chunk handed out by [`DmaPool::allocate`]. `size` is the rounded
/// power-of-two size actually reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaChunk {
    pub bus: BusAddr,
    pub size: usize,
}

impl DmaChunk {
    /// Bus address `bytes` into the chunk.
    #[inline]
    pub fn at(&self, bytes: usize) -> BusAddr {
        self.bus.offset(bytes as u32)
    }

    pub fn contains(&self, addr: BusAddr) -> bool {
        addr.0 >= self.bus.0 && ((addr.0 - self.bus.0) as usize) < self.size
    }
}

/// Source of page-sized, page-aligned bus mappings.
pub trait PageProvider: Send {
    /// Maps a fresh page and returns its bus address, or `None` when the
    /// platform refuses.
    fn map_page(&mut self) -> Option<BusAddr>;
    fn unmap_page(&mut self, bus: BusAddr);
}

/// Hands out consecutive bus pages from a fixed window, optionally capped.
#[derive(Debug)]
pub struct LinearPages {
    next: u32,
    limit: Option<usize>,
    mapped: usize,
    recycled: Vec<BusAddr>,
}

impl LinearPages {
    pub fn new(base: u32, limit: Option<usize>) -> Self {
        Self {
            next: base & !((PAGE_SIZE as u32) - 1),
            limit,
            mapped: 0,
            recycled: Vec::new(),
        }
    }

    pub fn mapped(&self) -> usize {
        self.mapped
    }
}

impl PageProvider for LinearPages {
    fn map_page(&mut self) -> Option<BusAddr> {
        if self.limit.is_some_and(|l| self.mapped >= l) {
            return None;
        }
        let bus = match self.recycled.pop() {
            Some(b) => b,
            None => {
                let b = BusAddr(self.next);
                self.next = self.next.checked_add(PAGE_SIZE as u32)?;
                b
            },
        };
        self.mapped += 1;
        Some(bus)
    }

    fn unmap_page(&mut self, bus: BusAddr) {
        self.mapped = self.mapped.saturating_sub(1);
        self.recycled.push(bus);
    }
}

struct DmaPage {
    mem: Box<[u8]>,
    in_use: usize,
}

struct PoolInner {
    provider: Box<dyn PageProvider>,
    pages: BTreeMap<u32, DmaPage>,
    free: [Vec<u32>; NUM_CLASSES],
    live: HashMap<u32, usize>,
    coalesce: bool,
}

/// Allocator for small bus-visible chunks.
///
/// Requests are rounded up to a power of two between 16 bytes and one page.
/// Larger free blocks are split on demand. With `coalesce` enabled a freed
/// chunk is merged with its buddy when possible; a page whose chunks are all
/// free again is always handed back to the provider.
pub struct DmaPool {
    name: String,
    inner: Mutex<PoolInner>,
}

impl DmaPool {
    pub fn new(name: impl Into<String>, provider: Box<dyn PageProvider>, coalesce: bool) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(PoolInner {
                provider,
                pages: BTreeMap::new(),
                free: Default::default(),
                live: HashMap::new(),
                coalesce,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a zero-filled chunk of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<DmaChunk, DmaError> {
        if size > PAGE_SIZE {
            return Err(DmaError::TooLarge(size));
        }
        let class = size_class(size);
        let mut inner = self.lock();

        let mut from = (class..NUM_CLASSES).find(|&c| !inner.free[c].is_empty());
        if from.is_none() {
            let Some(page) = inner.provider.map_page() else {
                warn!(pool = %self.name, size, "page mapping refused");
                return Err(DmaError::OutOfMemory(size));
            };
            debug!(pool = %self.name, page = %page, "mapped page");
            inner.pages.insert(
                page.0,
                DmaPage {
                    mem: vec![0u8; PAGE_SIZE].into_boxed_slice(),
                    in_use: 0,
                },
            );
            inner.free[NUM_CLASSES - 1].push(page.0);
            from = Some(NUM_CLASSES - 1);
        }
        let mut level = from.ok_or(DmaError::OutOfMemory(size))?;
        let addr = inner.free[level]
            .pop()
            .ok_or(DmaError::OutOfMemory(size))?;

        while level > class {
            level -= 1;
            let half = class_size(level) as u32;
            inner.free[level].push(addr + half);
        }

        let chunk_size = class_size(class);
        inner.live.insert(addr, chunk_size);
        let (page, off) = page_of(addr);
        if let Some(p) = inner.pages.get_mut(&page) {
            p.in_use += chunk_size;
            p.mem[off..off + chunk_size].fill(0);
        }
        trace!(pool = %self.name, addr = %BusAddr(addr), size = chunk_size, "allocate");
        Ok(DmaChunk {
            bus: BusAddr(addr),
            size: chunk_size,
        })
    }

    /// Releases a chunk. Freeing a chunk twice, or one this pool never
    /// handed out, is reported as [`DmaError::UnknownChunk`].
    pub fn free(&self, chunk: DmaChunk) -> Result<(), DmaError> {
        let mut inner = self.lock();
        let addr = chunk.bus.0;
        let Some(size) = inner.live.remove(&addr) else {
            warn!(pool = %self.name, addr = %chunk.bus, "free of unknown chunk");
            return Err(DmaError::UnknownChunk(chunk.bus));
        };

        let (page, _) = page_of(addr);
        let page_empty = match inner.pages.get_mut(&page) {
            Some(p) => {
                p.in_use -= size;
                p.in_use == 0
            },
            None => return Err(DmaError::UnknownChunk(chunk.bus)),
        };

        if page_empty {
            for list in inner.free.iter_mut() {
                list.retain(|&a| page_of(a).0 != page);
            }
            inner.pages.remove(&page);
            inner.provider.unmap_page(BusAddr(page));
            debug!(pool = %self.name, page = %BusAddr(page), "released page");
            return Ok(());
        }

        let mut class = size_class(size);
        let mut addr = addr;
        if inner.coalesce {
            while class < NUM_CLASSES - 1 {
                let buddy = addr ^ class_size(class) as u32;
                let Some(pos) = inner.free[class].iter().position(|&a| a == buddy) else {
                    break;
                };
                inner.free[class].swap_remove(pos);
                addr = addr.min(buddy);
                class += 1;
            }
        }
        inner.free[class].push(addr);
        Ok(())
    }

    /// Copies `buf.len()` bytes out of bus memory at `addr`.
    pub fn read(&self, addr: BusAddr, buf: &mut [u8]) -> Result<(), DmaError> {
        let inner = self.lock();
        let (page, off) = page_of(addr.0);
        let p = inner
            .pages
            .get(&page)
            .filter(|_| off + buf.len() <= PAGE_SIZE)
            .ok_or(DmaError::OutOfBounds {
                addr,
                len: buf.len(),
            })?;
        buf.copy_from_slice(&p.mem[off..off + buf.len()]);
        Ok(())
    }

    /// Copies `data` into bus memory at `addr`.
    pub fn write(&self, addr: BusAddr, data: &[u8]) -> Result<(), DmaError> {
        let mut inner = self.lock();
        let (page, off) = page_of(addr.0);
        let p = inner
            .pages
            .get_mut(&page)
            .filter(|_| off + data.len() <= PAGE_SIZE)
            .ok_or(DmaError::OutOfBounds {
                addr,
                len: data.len(),
            })?;
        p.mem[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, addr: BusAddr) -> Result<u32, DmaError> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u32(&self, addr: BusAddr, value: u32) -> Result<(), DmaError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Number of chunks currently handed out.
    pub fn live_chunks(&self) -> usize {
        self.lock().live.len()
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.lock().pages.len()
    }
}

impl std::fmt::Debug for DmaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("DmaPool")
            .field("name", &self.name)
            .field("pages", &inner.pages.len())
            .field("live", &inner.live.len())
            .field("coalesce", &inner.coalesce)
            .finish()
    }
}

#[inline]
fn size_class(size: usize) -> usize {
    let rounded = size.max(1 << MIN_CHUNK_SHIFT).next_power_of_two();
    (rounded.trailing_zeros() - MIN_CHUNK_SHIFT) as usize
}

#[inline]
fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CHUNK_SHIFT)
}

#[inline]
fn page_of(addr: u32) -> (u32, usize) {
    let page = addr & !((PAGE_SIZE as u32) - 1);
    (page, (addr - page) as usize)
}
