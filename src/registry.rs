// src/registry.rs
//! Fixed-capacity, densely indexed GPU arrays.
//!
//! Lights and influence fields both live in one uniform buffer per view:
//! a small header followed by `capacity` POD records. Live records always
//! occupy `[0, count)`. Callers hold [`RegistryHandle`]s into an arena, and
//! only the registry ever moves records or rewrites the index a handle maps
//! to, so compaction cannot leave a stale cached index behind.
//!
//! Uploads are coalesced: any number of changes in a frame become a single
//! full-array write in [`Registry::flush_if_dirty`].

use std::ops::{Deref, DerefMut};

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::ring_buffer::CommandSlot;

// ============================================================================
// 1. HANDLES & HEADER
// ============================================================================

/// Stable reference to a registry entry. Survives compaction; goes stale
/// (every lookup returns `None`) once the entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryHandle {
    slot: u32,
    generation: u32,
}

/// Leading 16 bytes of every registry buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RegistryHeader {
    pub count: u32,
    pub enabled: u32,
    pub _pad: [u32; 2],
}

pub const HEADER_SIZE: u64 = std::mem::size_of::<RegistryHeader>() as u64;

#[derive(Debug, Clone, Copy)]
struct ArenaSlot {
    generation: u32,
    index: Option<u32>,
}

// ============================================================================
// 2. UPLOAD SEAM
// ============================================================================

/// Destination of a registry flush.
pub trait UploadSink {
    fn write_bytes(&mut self, offset: u64, bytes: &[u8]);
}

/// Records a staged copy into the frame's transfer encoder. The staging
/// buffer is parked on the transfer slot until that slot is recycled.
pub struct EncoderUpload<'a> {
    pub device: &'a wgpu::Device,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub slot: &'a mut CommandSlot,
    pub target: &'a wgpu::Buffer,
}

impl UploadSink for EncoderUpload<'_> {
    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("upload_staging"),
            contents: bytes,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        self.encoder
            .copy_buffer_to_buffer(&staging, 0, self.target, offset, bytes.len() as u64);
        self.slot.retain(staging);
    }
}

// ============================================================================
// 3. CPU REGISTRY
// ============================================================================

pub struct Registry<T: Pod> {
    name: &'static str,
    entries: Vec<T>,
    /// `owners[i]` is the arena slot whose entry sits at dense index `i`.
    owners: Vec<u32>,
    arena: Vec<ArenaSlot>,
    free: Vec<u32>,
    enabled: bool,
    dirty: bool,
}

impl<T: Pod> Registry<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: vec![T::zeroed(); capacity],
            owners: Vec::with_capacity(capacity),
            arena: Vec::with_capacity(capacity),
            free: Vec::new(),
            enabled: true,
            // a fresh buffer still needs its zero header
            dirty: true,
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.owners.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Appends `value` at index `count`. A full registry logs and returns
    /// `None`; the caller simply renders without the entry.
    pub fn add(&mut self, value: T) -> Option<RegistryHandle> {
        if self.is_full() {
            log::warn!(
                "{} registry is full ({} entries); new entry was not added",
                self.name,
                self.capacity()
            );
            return None;
        }

        let index = self.count();
        self.entries[index] = value;

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.arena.push(ArenaSlot { generation: 0, index: None });
                (self.arena.len() - 1) as u32
            }
        };
        let entry = &mut self.arena[slot as usize];
        entry.index = Some(index as u32);
        let handle = RegistryHandle { slot, generation: entry.generation };

        self.owners.push(slot);
        self.dirty = true;
        Some(handle)
    }

    /// Removes the entry and shifts every entry above it down by one,
    /// updating the index of each moved handle. Stale handles are ignored.
    pub fn remove(&mut self, handle: RegistryHandle) -> Option<T> {
        let index = self.index_of(handle)?;
        let count = self.count();
        let removed = self.entries[index];

        self.entries.copy_within(index + 1..count, index);
        self.entries[count - 1] = T::zeroed();
        self.owners.remove(index);

        for (dense, &slot) in self.owners.iter().enumerate().skip(index) {
            self.arena[slot as usize].index = Some(dense as u32);
        }

        let entry = &mut self.arena[handle.slot as usize];
        entry.index = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot);

        self.dirty = true;
        Some(removed)
    }

    /// Current dense index of a live handle.
    pub fn index_of(&self, handle: RegistryHandle) -> Option<usize> {
        let entry = self.arena.get(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        entry.index.map(|i| i as usize)
    }

    pub fn contains(&self, handle: RegistryHandle) -> bool {
        self.index_of(handle).is_some()
    }

    pub fn get(&self, handle: RegistryHandle) -> Option<&T> {
        self.index_of(handle).map(|i| &self.entries[i])
    }

    /// Replace an entry's value. Returns `false` for stale handles.
    pub fn update(&mut self, handle: RegistryHandle, value: T) -> bool {
        self.modify(handle, |entry| *entry = value)
    }

    pub fn modify(&mut self, handle: RegistryHandle, f: impl FnOnce(&mut T)) -> bool {
        match self.index_of(handle) {
            Some(index) => {
                f(&mut self.entries[index]);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Flag a change made without going through `update`/`modify`.
    pub fn mark_changed(&mut self, handle: RegistryHandle) {
        if self.contains(handle) {
            self.dirty = true;
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.dirty = true;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Live entries in dense order.
    pub fn live(&self) -> &[T] {
        &self.entries[..self.count()]
    }

    /// Live handles in dense order.
    pub fn handles(&self) -> impl Iterator<Item = RegistryHandle> + '_ {
        self.owners.iter().map(move |&slot| RegistryHandle {
            slot,
            generation: self.arena[slot as usize].generation,
        })
    }

    pub fn header(&self) -> RegistryHeader {
        RegistryHeader {
            count: self.count() as u32,
            enabled: self.enabled as u32,
            _pad: [0; 2],
        }
    }

    /// Bytes needed for the header plus a full array.
    pub fn buffer_size(capacity: usize) -> u64 {
        HEADER_SIZE + (capacity * std::mem::size_of::<T>()) as u64
    }

    /// One write covering the header and the whole mirror, only when
    /// something changed since the last flush.
    pub fn flush_if_dirty(&mut self, sink: &mut impl UploadSink) -> bool {
        if !self.dirty {
            return false;
        }

        let header = self.header();
        let mut bytes = Vec::with_capacity(Self::buffer_size(self.capacity()) as usize);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.entries));
        sink.write_bytes(0, &bytes);

        self.dirty = false;
        log::trace!("{} registry uploaded ({} live)", self.name, self.count());
        true
    }
}

// ============================================================================
// 4. GPU-BACKED REGISTRY
// ============================================================================

/// A [`Registry`] plus the uniform buffer it mirrors into.
pub struct GpuRegistry<T: Pod> {
    registry: Registry<T>,
    buffer: wgpu::Buffer,
}

impl<T: Pod> GpuRegistry<T> {
    pub fn new(device: &wgpu::Device, name: &'static str, capacity: usize) -> Self {
        // shaders declare at least one record even when the registry holds none
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: Registry::<T>::buffer_size(capacity.max(1)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            registry: Registry::new(name, capacity),
            buffer,
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn flush(
        &mut self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        slot: &mut CommandSlot,
    ) -> bool {
        let mut sink = EncoderUpload {
            device,
            encoder,
            slot,
            target: &self.buffer,
        };
        self.registry.flush_if_dirty(&mut sink)
    }
}

impl<T: Pod> Deref for GpuRegistry<T> {
    type Target = Registry<T>;

    fn deref(&self) -> &Registry<T> {
        &self.registry
    }
}

impl<T: Pod> DerefMut for GpuRegistry<T> {
    fn deref_mut(&mut self) -> &mut Registry<T> {
        &mut self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    struct Entry {
        id: u32,
        value: f32,
    }

    fn entry(id: u32) -> Entry {
        Entry { id, value: id as f32 * 0.5 }
    }

    #[derive(Default)]
    struct Capture {
        writes: Vec<(u64, Vec<u8>)>,
    }

    impl UploadSink for Capture {
        fn write_bytes(&mut self, offset: u64, bytes: &[u8]) {
            self.writes.push((offset, bytes.to_vec()));
        }
    }

    fn assert_dense(registry: &Registry<Entry>, live: &[(RegistryHandle, u32)]) {
        assert_eq!(registry.count(), live.len());
        for &(handle, id) in live {
            let index = registry.index_of(handle).expect("live handle resolves");
            assert!(index < registry.count());
            assert_eq!(registry.live()[index].id, id);
        }
        let handles: Vec<_> = registry.handles().collect();
        for (dense, handle) in handles.iter().enumerate() {
            assert_eq!(registry.index_of(*handle), Some(dense));
        }
    }

    #[test]
    fn indices_stay_dense_through_mixed_add_remove() {
        let mut registry = Registry::<Entry>::new("test", 16);
        let mut live: Vec<(RegistryHandle, u32)> = Vec::new();
        let mut next_id = 0u32;
        let mut seed = 0x2545_f491u32;

        for _ in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;

            let remove = !live.is_empty() && (seed % 3 == 0 || registry.is_full());
            if remove {
                let victim = live.remove((seed as usize / 3) % live.len());
                assert_eq!(registry.remove(victim.0).map(|e| e.id), Some(victim.1));
            } else {
                let handle = registry.add(entry(next_id)).expect("room left");
                live.push((handle, next_id));
                next_id += 1;
            }
            assert_dense(&registry, &live);
        }
    }

    #[test]
    fn full_registry_rejects_without_changing_count() {
        let mut registry = Registry::<Entry>::new("test", 2);
        registry.add(entry(0)).unwrap();
        registry.add(entry(1)).unwrap();

        assert!(registry.add(entry(2)).is_none());
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.live(), &[entry(0), entry(1)]);
    }

    #[test]
    fn removing_the_last_entry_does_not_underflow() {
        let mut registry = Registry::<Entry>::new("test", 4);
        let only = registry.add(entry(7)).unwrap();

        assert_eq!(registry.remove(only), Some(entry(7)));
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.remove(only), None);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn two_removals_before_a_flush_shift_correctly() {
        let mut registry = Registry::<Entry>::new("test", 8);
        let handles: Vec<_> = (0..5).map(|i| registry.add(entry(i)).unwrap()).collect();

        registry.remove(handles[1]);
        registry.remove(handles[3]);

        assert_eq!(registry.live(), &[entry(0), entry(2), entry(4)]);
        assert_eq!(registry.index_of(handles[4]), Some(2));
        assert_eq!(registry.index_of(handles[2]), Some(1));
        assert_eq!(registry.index_of(handles[3]), None);
    }

    #[test]
    fn stale_handles_do_not_alias_recycled_slots() {
        let mut registry = Registry::<Entry>::new("test", 4);
        let old = registry.add(entry(1)).unwrap();
        registry.remove(old);
        let new = registry.add(entry(2)).unwrap();

        assert_ne!(old, new);
        assert!(!registry.update(old, entry(99)));
        assert_eq!(registry.get(new), Some(&entry(2)));
    }

    #[test]
    fn flush_writes_once_and_clears_dirty() {
        let mut registry = Registry::<Entry>::new("test", 3);
        let a = registry.add(entry(1)).unwrap();
        registry.add(entry(2)).unwrap();
        registry.update(a, entry(5));
        registry.set_enabled(false);

        let mut sink = Capture::default();
        assert!(registry.flush_if_dirty(&mut sink));
        assert!(!registry.flush_if_dirty(&mut sink));
        assert_eq!(sink.writes.len(), 1);

        let (offset, bytes) = &sink.writes[0];
        assert_eq!(*offset, 0);
        assert_eq!(bytes.len() as u64, Registry::<Entry>::buffer_size(3));

        let header: RegistryHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE as usize]);
        assert_eq!(header.count, 2);
        assert_eq!(header.enabled, 0);

        let body: Vec<Entry> = bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE as usize..]);
        assert_eq!(body, vec![entry(5), entry(2), Entry::zeroed()]);
    }

    #[test]
    fn mark_changed_on_live_handle_requests_upload() {
        let mut registry = Registry::<Entry>::new("test", 2);
        let handle = registry.add(entry(1)).unwrap();
        registry.flush_if_dirty(&mut Capture::default());

        registry.mark_changed(handle);
        assert!(registry.is_dirty());
    }
}
