use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use ndarray::ArrayD;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::tensor::Tensor;
use crate::types::Device;

pub const DEFAULT_ALIGNMENT: usize = 16;
const DEFAULT_RELEASE_THRESHOLD: f64 = 0.5;
const DEFRAGMENT_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

struct Block {
    bytes: Box<[u8]>,
    /// The actual FLOAT32 storage handed out by [`MemoryPool::allocate_tensor_f32`],
    /// present only while the block is free — `None` while checked out to a
    /// live `Tensor` so a reused block never aliases two owners at once.
    tensor: Option<Tensor>,
    size: usize,
    in_use: bool,
    allocated_at: Instant,
}

#[derive(Default)]
struct PoolState {
    blocks: HashMap<BlockId, Block>,
    next_id: usize,
    total_allocated: usize,
    current_allocated: usize,
    peak_allocated: usize,
    unused_memory: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total_allocated: usize,
    pub current_allocated: usize,
    pub peak_allocated: usize,
    pub unused_memory: usize,
}

/// A bulk, address-keyed allocator serving one run's worth of tensor
/// buffers. Not the hot path: every operation takes a single mutex.
/// `max_size` of 0 means unlimited.
pub struct MemoryPool {
    max_size: usize,
    release_threshold: f64,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    pub fn new(max_size: usize) -> Self {
        Self::with_release_threshold(max_size, DEFAULT_RELEASE_THRESHOLD)
    }

    pub fn with_release_threshold(max_size: usize, release_threshold: f64) -> Self {
        Self { max_size, release_threshold, state: Mutex::new(PoolState::default()) }
    }

    pub fn allocate(&self, size: usize) -> EngineResult<BlockId> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Best-fit over non-in-use blocks; falls back to a fresh
    /// allocation, first trying release-unused then defragment if the
    /// pool has a cap and the new block would exceed it.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> EngineResult<BlockId> {
        let mut state = self.state.lock().expect("memory pool mutex poisoned");

        if let Some(id) = best_fit(&state.blocks, size) {
            let block = state.blocks.get_mut(&id).expect("best_fit returned a live id");
            block.in_use = true;
            let freed = block.size;
            state.unused_memory = state.unused_memory.saturating_sub(freed);
            return Ok(id);
        }

        if self.max_size > 0 && state.current_allocated + size > self.max_size {
            release_unused(&mut state);
            if state.current_allocated + size > self.max_size {
                defragment(&mut state);
            }
            if state.current_allocated + size > self.max_size {
                warn!(
                    requested = size,
                    cap = self.max_size,
                    "memory pool: allocation exceeds cap after release-unused and defragment, proceeding anyway"
                );
            }
        }

        let padded = size.checked_add(alignment.saturating_sub(1)).ok_or_else(|| {
            EngineError::out_of_memory(format!("allocation size {size} overflows with alignment {alignment}"))
        })?;
        let bytes = vec![0u8; padded].into_boxed_slice();

        let id = BlockId(state.next_id);
        state.next_id += 1;
        state.blocks.insert(id, Block { bytes, tensor: None, size, in_use: true, allocated_at: Instant::now() });
        state.total_allocated += size;
        state.current_allocated += size;
        state.peak_allocated = state.peak_allocated.max(state.current_allocated);
        Ok(id)
    }

    /// Marks a block free without returning it to the system allocator.
    /// Once the unused fraction crosses `release_threshold`, logs that a
    /// deferred release is due (the caller decides when to actually run
    /// one, via [`MemoryPool::release_unused`]).
    pub fn free(&self, id: BlockId) -> EngineResult<()> {
        let mut state = self.state.lock().expect("memory pool mutex poisoned");
        let total_allocated = state.total_allocated;
        let block = state
            .blocks
            .get_mut(&id)
            .ok_or_else(|| EngineError::invalid_argument(format!("free: no such block {}", id.0)))?;
        if !block.in_use {
            return Ok(());
        }
        block.in_use = false;
        state.unused_memory += block.size;

        let ratio = state.unused_memory as f64 / total_allocated.max(1) as f64;
        if ratio > self.release_threshold {
            debug!(ratio, threshold = self.release_threshold, "memory pool: unused ratio past release threshold");
        }
        Ok(())
    }

    pub fn release_unused(&self) {
        let mut state = self.state.lock().expect("memory pool mutex poisoned");
        release_unused(&mut state);
    }

    /// Releases non-in-use blocks idle for at least 60 seconds. Does not
    /// merge or relocate live blocks; the system allocator backing this
    /// pool is not relocatable.
    pub fn defragment(&self) {
        let mut state = self.state.lock().expect("memory pool mutex poisoned");
        defragment(&mut state);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("memory pool mutex poisoned");
        PoolStats {
            total_allocated: state.total_allocated,
            current_allocated: state.current_allocated,
            peak_allocated: state.peak_allocated,
            unused_memory: state.unused_memory,
        }
    }

    /// Checks out a block sized for `dims` worth of FLOAT32 elements and
    /// returns a Tensor whose storage IS that block — not a separate
    /// buffer allocated alongside it. A best-fit block carrying a prior
    /// tensor from an earlier [`MemoryPool::free_tensor_f32`] has its
    /// storage reused and resized in place; a fresh block starts zeroed.
    pub fn allocate_tensor_f32(&self, dims: &[usize]) -> EngineResult<(BlockId, Tensor)> {
        let numel: usize = dims.iter().product();
        let byte_size = numel * std::mem::size_of::<f32>();
        let id = self.allocate(byte_size)?;

        let mut state = self.state.lock().expect("memory pool mutex poisoned");
        let block = state.blocks.get_mut(&id).expect("allocate returned a live id");
        let tensor = reuse_or_zero(block.tensor.take(), dims);
        Ok((id, tensor))
    }

    /// Frees `id` the same way [`MemoryPool::free`] does, additionally
    /// handing the block ownership of `tensor`'s storage so the next
    /// [`MemoryPool::allocate_tensor_f32`] that reuses this block starts
    /// from real prior storage instead of a fresh zero-fill. This is the
    /// one place pool reuse becomes observable on the Tensor itself.
    pub fn free_tensor_f32(&self, id: BlockId, tensor: Tensor) -> EngineResult<()> {
        self.free(id)?;
        let mut state = self.state.lock().expect("memory pool mutex poisoned");
        if let Some(block) = state.blocks.get_mut(&id) {
            block.tensor = Some(tensor);
        }
        Ok(())
    }
}

/// Resizes `prior`'s FLOAT32 storage in place to `dims`'s element count
/// when `prior` is given and still FLOAT32 and uniquely owned; otherwise
/// (no prior block tensor, wrong dtype, or still shared) falls back to a
/// fresh zero-filled tensor.
fn reuse_or_zero(prior: Option<Tensor>, dims: &[usize]) -> Tensor {
    let numel: usize = dims.iter().product();
    let Some(prior) = prior else { return Tensor::zeros_f32(dims) };

    match prior.try_into_f32_vec() {
        Ok(mut storage) => {
            storage.resize(numel, 0.0);
            let array = ArrayD::from_shape_vec(ndarray::IxDyn(dims), storage)
                .expect("resized Vec length matches the requested dims' element count");
            Tensor::from_f32_array(array)
        }
        Err(_shared_or_wrong_dtype) => Tensor::zeros_f32(dims),
    }
}

/// One [`MemoryPool`] per [`Device`], created lazily on first use. The
/// CPU path only ever touches the `Device::Cpu` pool; the indirection
/// exists so a future non-CPU provider can own its own allocator without
/// `Executor` changing shape.
#[derive(Default)]
pub struct PoolRegistry {
    max_size_per_pool: usize,
    pools: RwLock<HashMap<Device, MemoryPool>>,
}

impl PoolRegistry {
    pub fn new(max_size_per_pool: usize) -> Self {
        Self { max_size_per_pool, pools: RwLock::new(HashMap::new()) }
    }

    /// Runs `f` against the pool for `device`, creating it on first
    /// access. The registry lock is only held long enough to fetch or
    /// insert the entry; `f` runs against the pool's own mutex.
    pub fn with_pool<R>(&self, device: Device, f: impl FnOnce(&MemoryPool) -> R) -> R {
        if let Some(pool) = self.pools.read().expect("pool registry lock poisoned").get(&device) {
            return f(pool);
        }
        let mut pools = self.pools.write().expect("pool registry lock poisoned");
        let pool = pools.entry(device).or_insert_with(|| MemoryPool::new(self.max_size_per_pool));
        f(pool)
    }

    pub fn device_count(&self) -> usize {
        self.pools.read().expect("pool registry lock poisoned").len()
    }
}

fn best_fit(blocks: &HashMap<BlockId, Block>, size: usize) -> Option<BlockId> {
    blocks
        .iter()
        .filter(|(_, b)| !b.in_use && b.size >= size)
        .min_by_key(|(_, b)| b.size)
        .map(|(&id, _)| id)
}

fn release_unused(state: &mut PoolState) {
    let freed_ids: Vec<BlockId> = state.blocks.iter().filter(|(_, b)| !b.in_use).map(|(&id, _)| id).collect();
    for id in freed_ids {
        if let Some(block) = state.blocks.remove(&id) {
            state.current_allocated = state.current_allocated.saturating_sub(block.size);
            state.unused_memory = state.unused_memory.saturating_sub(block.size);
        }
    }
}

fn defragment(state: &mut PoolState) {
    let now = Instant::now();
    let freed_ids: Vec<BlockId> = state
        .blocks
        .iter()
        .filter(|(_, b)| !b.in_use && now.duration_since(b.allocated_at) >= DEFRAGMENT_AGE)
        .map(|(&id, _)| id)
        .collect();
    for id in freed_ids {
        if let Some(block) = state.blocks.remove(&id) {
            state.current_allocated = state.current_allocated.saturating_sub(block.size);
            state.unused_memory = state.unused_memory.saturating_sub(block.size);
        }
    }
}
