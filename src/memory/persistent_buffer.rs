/// Persistent Mapped Buffer Implementation
///
/// A growable GPU buffer with a CPU-visible mapping. Writes land in the
/// mapping and are pushed to the device at the same offsets; growing
/// reallocates on the device with the old contents copied forward, so every
/// offset written before a resize still holds the same bytes afterwards.

use crate::constants::buffers::{GROWTH_FACTOR, MIN_BUFFER_SIZE};
use crate::error::{CullError, CullResult};
use crate::gpu::{BufferDesc, BufferHandle, BufferUsage, GraphicsApi};
use bytemuck::Pod;

pub struct PersistentBuffer {
    handle: BufferHandle,
    label: String,
    usage: BufferUsage,

    /// Allocated size in bytes
    capacity: u64,

    /// CPU side of the mapping, always `capacity` bytes long
    mapped: Vec<u8>,
}

impl PersistentBuffer {
    pub fn new<G: GraphicsApi + ?Sized>(
        api: &mut G,
        label: impl Into<String>,
        usage: BufferUsage,
        capacity: u64,
    ) -> CullResult<Self> {
        let label = label.into();
        let capacity = capacity.max(MIN_BUFFER_SIZE);
        let handle = api.create_buffer(&BufferDesc::new(label.clone(), capacity, usage))?;
        log::debug!("[PersistentBuffer::new] '{}' with {} bytes", label, capacity);

        Ok(Self {
            handle,
            label,
            usage,
            capacity,
            mapped: vec![0; capacity as usize],
        })
    }

    /// Buffer sized for `count` records of `T`
    pub fn for_records<T: Pod, G: GraphicsApi + ?Sized>(
        api: &mut G,
        label: impl Into<String>,
        usage: BufferUsage,
        count: usize,
    ) -> CullResult<Self> {
        Self::new(api, label, usage, (count * std::mem::size_of::<T>()) as u64)
    }

    /// Grow (never shrink) so at least `required` bytes fit
    ///
    /// Returns `true` when the allocation was replaced.
    pub fn ensure_capacity<G: GraphicsApi + ?Sized>(&mut self, api: &mut G, required: u64) -> CullResult<bool> {
        if required <= self.capacity {
            return Ok(false);
        }
        let new_capacity = required.max(self.capacity.saturating_mul(GROWTH_FACTOR));
        api.resize_buffer(self.handle, new_capacity)?;
        self.mapped.resize(new_capacity as usize, 0);

        log::debug!(
            "[PersistentBuffer::ensure_capacity] '{}' grew {} -> {} bytes",
            self.label, self.capacity, new_capacity
        );
        self.capacity = new_capacity;
        Ok(true)
    }

    /// Grow-aware room for `count` records of `T`
    pub fn reserve_records<T: Pod, G: GraphicsApi + ?Sized>(&mut self, api: &mut G, count: usize) -> CullResult<bool> {
        self.ensure_capacity(api, (count * std::mem::size_of::<T>()) as u64)
    }

    /// Write raw bytes at `offset`, growing first when needed
    pub fn write_bytes<G: GraphicsApi + ?Sized>(&mut self, api: &mut G, offset: u64, bytes: &[u8]) -> CullResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| CullError::OutOfRange {
                label: self.label.clone(),
                offset,
                len: bytes.len() as u64,
                size: self.capacity,
            })?;
        self.ensure_capacity(api, end)?;
        self.mapped[offset as usize..end as usize].copy_from_slice(bytes);
        api.write_buffer(self.handle, offset, bytes)
    }

    /// Write `records` starting at record index `first`
    pub fn write<T: Pod, G: GraphicsApi + ?Sized>(&mut self, api: &mut G, first: usize, records: &[T]) -> CullResult<()> {
        let offset = (first * std::mem::size_of::<T>()) as u64;
        self.write_bytes(api, offset, bytemuck::cast_slice(records))
    }

    /// CPU view of everything written through this buffer
    pub fn mapped(&self) -> &[u8] {
        &self.mapped
    }

    /// First `count` records of the CPU view
    pub fn mapped_records<T: Pod>(&self, count: usize) -> Vec<T> {
        let stride = std::mem::size_of::<T>();
        self.mapped
            .chunks_exact(stride)
            .take(count)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect()
    }

    /// Blocking readback of GPU-written contents; diagnostics only
    pub fn read_back<T: Pod, G: GraphicsApi + ?Sized>(&self, api: &mut G, count: usize) -> CullResult<Vec<T>> {
        let bytes = api.read_buffer(self.handle)?;
        let stride = std::mem::size_of::<T>();
        Ok(bytes
            .chunks_exact(stride)
            .take(count)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn release<G: GraphicsApi + ?Sized>(self, api: &mut G) {
        api.destroy_buffer(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareGpu;

    #[test]
    fn test_minimum_capacity() {
        let mut gpu = SoftwareGpu::new(1, 1);
        let buffer = PersistentBuffer::new(&mut gpu, "tiny", BufferUsage::STORAGE, 0).unwrap();
        assert_eq!(buffer.capacity(), MIN_BUFFER_SIZE);
        assert_eq!(gpu.buffer_size(buffer.handle()), Some(MIN_BUFFER_SIZE));
    }

    #[test]
    fn test_growth_preserves_previous_writes() {
        let mut gpu = SoftwareGpu::new(1, 1);
        let mut buffer = PersistentBuffer::new(&mut gpu, "grow", BufferUsage::STORAGE, 256).unwrap();
        let head: Vec<u32> = (0..64).collect();
        buffer.write(&mut gpu, 0, &head).unwrap();

        // Record 100 lies past the end and forces a reallocation
        buffer.write(&mut gpu, 100, &[0xDEAD_BEEFu32]).unwrap();

        assert!(buffer.capacity() >= 404);
        let device_words: Vec<u32> = buffer.read_back(&mut gpu, 101).unwrap();
        assert_eq!(&device_words[..64], head.as_slice());
        assert_eq!(device_words[100], 0xDEAD_BEEF);
        assert_eq!(buffer.mapped_records::<u32>(64), head);
    }

    #[test]
    fn test_growth_at_least_doubles() {
        let mut gpu = SoftwareGpu::new(1, 1);
        let mut buffer = PersistentBuffer::new(&mut gpu, "double", BufferUsage::STORAGE, 1000).unwrap();
        assert!(buffer.ensure_capacity(&mut gpu, 1001).unwrap());
        assert_eq!(buffer.capacity(), 2000);
        assert!(!buffer.ensure_capacity(&mut gpu, 1500).unwrap());
        assert!(buffer.ensure_capacity(&mut gpu, 10_000).unwrap());
        assert_eq!(buffer.capacity(), 10_000);
    }

    #[test]
    fn test_never_shrinks() {
        let mut gpu = SoftwareGpu::new(1, 1);
        let mut buffer = PersistentBuffer::new(&mut gpu, "steady", BufferUsage::STORAGE, 4096).unwrap();
        assert!(!buffer.ensure_capacity(&mut gpu, 16).unwrap());
        assert_eq!(buffer.capacity(), 4096);
    }

    #[test]
    fn test_out_of_memory_is_fatal() {
        let mut gpu = SoftwareGpu::new(1, 1).with_memory_budget(1024);
        let mut buffer = PersistentBuffer::new(&mut gpu, "bounded", BufferUsage::STORAGE, 512).unwrap();
        let result = buffer.ensure_capacity(&mut gpu, 4096);
        assert!(matches!(result, Err(CullError::OutOfMemory { .. })));
        assert_eq!(buffer.capacity(), 512);
    }

    #[test]
    fn test_release_frees_device_memory() {
        let mut gpu = SoftwareGpu::new(1, 1);
        let buffer = PersistentBuffer::new(&mut gpu, "released", BufferUsage::STORAGE, 512).unwrap();
        assert_eq!(gpu.live_buffers(), 1);
        buffer.release(&mut gpu);
        assert_eq!(gpu.live_buffers(), 0);
    }
}
