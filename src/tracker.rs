//! The behavioral heart: a hash index from live pointer to metadata, a
//! delayed-free FIFO that preserves freed blocks long enough to diagnose
//! use-after-free and tail-guard corruption at the true free point, and
//! the counters/reporting that ride along.

use std::alloc::{dealloc, Layout, System};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::{GUARD_LEN, POOL_CAP, SLOT_COUNT, STACK_CAP, STATS_MS};
use crate::output;
use crate::pool::{BlockLink, BlockPool};
use crate::symbol::SymbolResolver;
use crate::walker;

/// Bundles everything a Tracker operation needs beyond its own state:
/// the symbol resolver, the shared `enabled` gate (suspended around report
/// emission so the emission's own allocations aren't re-tracked), and the
/// runtime-tunable knobs.
pub struct Ctx<'a> {
    pub resolver: &'a SymbolResolver,
    pub enabled: &'a AtomicBool,
    pub guard_byte: u8,
    pub delay_ms: u64,
    pub stats_ms: u64,
}

/// Scoped flip of `ctx.enabled` to `false`, restored on drop. Used around
/// every report-emission path so that allocations performed by printing or
/// symbolication aren't themselves re-tracked; restoration on the abort path
/// is moot (the process is terminating) but the guard still must not leak
/// the mutex before `abort()` runs.
struct ScopedDisable<'a> {
    enabled: &'a AtomicBool,
    prev: bool,
}

impl<'a> ScopedDisable<'a> {
    fn new(enabled: &'a AtomicBool) -> Self {
        let prev = enabled.swap(false, Ordering::SeqCst);
        Self { enabled, prev }
    }
}

impl Drop for ScopedDisable<'_> {
    fn drop(&mut self) {
        self.enabled.store(self.prev, Ordering::SeqCst);
    }
}

pub enum FreeOutcome {
    /// The block was moved to the delayed-free queue; the caller must NOT
    /// call the real `free` now.
    Deferred,
    /// Foreign or untracked pointer; the caller should call the real `free`
    /// itself.
    Untracked,
    /// `ptr` was already on the delayed-free queue: a double free. Carries
    /// the *original* record so the caller can report against its
    /// capture-time stack and abort.
    DoubleFree(BlockLink),
}

#[derive(Default)]
pub struct Counters {
    pub current_blocks: u64,
    pub current_bytes: u64,
    pub max_blocks: u64,
    pub max_bytes: u64,
    pub delayed_blocks: u64,
    pub delayed_bytes: u64,
    pub untracked_frees: u64,
}

pub struct TrackerState {
    pool: BlockPool,
    index: Box<[BlockLink]>,
    fifo_head: BlockLink,
    fifo_tail: BlockLink,
    counters: Counters,
    last_stats_emit: Instant,
}

impl TrackerState {
    pub fn new() -> Self {
        Self::with_capacity(POOL_CAP, SLOT_COUNT)
    }

    pub fn with_capacity(pool_cap: usize, slot_count: usize) -> Self {
        Self {
            pool: BlockPool::new(pool_cap),
            index: vec![BlockLink::NULL; slot_count].into_boxed_slice(),
            fifo_head: BlockLink::NULL,
            fifo_tail: BlockLink::NULL,
            counters: Counters::default(),
            last_stats_emit: Instant::now(),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Widened to 64 bits before the modulo, unlike the 32-bit-truncating
    /// `pointer / 4096` in the original source (spec section 9).
    fn hash(ptr: usize, slot_count: usize) -> usize {
        ((ptr as u64 >> 12) % slot_count as u64) as usize
    }

    fn find_in_index(&self, ptr: usize) -> (BlockLink, BlockLink, usize) {
        let slot = Self::hash(ptr, self.index.len());
        let mut prev = BlockLink::NULL;
        let mut curr = self.index[slot];
        while !curr.is_null() {
            if self.pool.get(curr).start == ptr {
                break;
            }
            prev = curr;
            curr = self.pool.get(curr).next;
        }
        (prev, curr, slot)
    }

    fn find_in_fifo(&self, ptr: usize) -> Option<BlockLink> {
        let mut curr = self.fifo_head;
        while !curr.is_null() {
            if self.pool.get(curr).start == ptr {
                return Some(curr);
            }
            curr = self.pool.get(curr).next;
        }
        None
    }

    pub fn on_alloc(&mut self, ptr: usize, len: usize, align: usize, frame_ptr: Option<usize>, ctx: &Ctx) {
        self.drain(false, ctx);

        let link = match self.pool.acquire() {
            Some(link) => link,
            None => {
                // Pool exhausted: force-drain one pending entry and retry
                // once before giving up (spec.md §3 "Block Pool"). A pool
                // full of freed-but-still-pending blocks has a slot to give
                // up the moment one of them is force-drained.
                self.drain(true, ctx);
                match self.pool.acquire() {
                    Some(link) => link,
                    None => return, // still exhausted: allocation proceeds untracked
                }
            }
        };

        self.counters.current_blocks += 1;
        self.counters.current_bytes += len as u64;
        if self.counters.current_blocks > self.counters.max_blocks {
            self.counters.max_blocks = self.counters.current_blocks;
        }
        if self.counters.current_bytes > self.counters.max_bytes {
            self.counters.max_bytes = self.counters.current_bytes;
        }

        {
            let record = self.pool.get_mut(link);
            record.start = ptr;
            record.length = len as u32;
            record.align = align;
            record.stack.clear();
            record.freed_at = None;
        }
        walker::walk_safe(STACK_CAP, frame_ptr, &mut self.pool.get_mut(link).stack);

        let slot = Self::hash(ptr, self.index.len());
        self.pool.get_mut(link).next = self.index[slot];
        self.index[slot] = link;

        self.maybe_emit_stats(false, ctx);
    }

    pub fn on_realloc(
        &mut self,
        old_ptr: usize,
        new_ptr: usize,
        new_len: usize,
        align: usize,
        frame_ptr: Option<usize>,
        ctx: &Ctx,
    ) {
        self.drain(false, ctx);

        let (prev, curr, slot) = self.find_in_index(old_ptr);

        if !curr.is_null() && old_ptr == new_ptr {
            let record = self.pool.get_mut(curr);
            self.counters.current_bytes -= record.length as u64;
            record.length = new_len as u32;
            self.counters.current_bytes += new_len as u64;
            if self.counters.current_bytes > self.counters.max_bytes {
                self.counters.max_bytes = self.counters.current_bytes;
            }
            self.maybe_emit_stats(false, ctx);
            return;
        }

        if !curr.is_null() {
            if prev.is_null() {
                self.index[slot] = self.pool.get(curr).next;
            } else {
                let next = self.pool.get(curr).next;
                self.pool.get_mut(prev).next = next;
            }
            self.counters.current_blocks -= 1;
            self.counters.current_bytes -= self.pool.get(curr).length as u64;
            self.pool.release(curr);
        }

        self.on_alloc(new_ptr, new_len, align, frame_ptr, ctx);
    }

    pub fn on_free(&mut self, ptr: usize, ctx: &Ctx) -> FreeOutcome {
        self.drain(false, ctx);

        let (prev, curr, slot) = self.find_in_index(ptr);

        if curr.is_null() {
            if let Some(pending) = self.find_in_fifo(ptr) {
                return FreeOutcome::DoubleFree(pending);
            }
            self.counters.untracked_frees += 1;
            return FreeOutcome::Untracked;
        }

        if prev.is_null() {
            self.index[slot] = self.pool.get(curr).next;
        } else {
            let next = self.pool.get(curr).next;
            self.pool.get_mut(prev).next = next;
        }

        let record = self.pool.get_mut(curr);
        record.freed_at = Some(Instant::now());
        record.next = BlockLink::NULL;

        self.counters.current_blocks -= 1;
        self.counters.current_bytes -= record.length as u64;
        self.counters.delayed_blocks += 1;
        self.counters.delayed_bytes += record.length as u64;

        if self.fifo_tail.is_null() {
            self.fifo_head = curr;
            self.fifo_tail = curr;
        } else {
            self.pool.get_mut(self.fifo_tail).next = curr;
            self.fifo_tail = curr;
        }

        self.maybe_emit_stats(false, ctx);
        FreeOutcome::Deferred
    }

    fn validate_guard(record: &crate::pool::BlockRecord, guard_byte: u8) -> bool {
        let tail = (record.start + record.length as usize) as *const u8;
        for i in 0..GUARD_LEN {
            // Safety: the allocation backing `start` was padded by
            // GUARD_LEN bytes beyond `length` at allocation time.
            if unsafe { *tail.add(i) } != guard_byte {
                return false;
            }
        }
        true
    }

    /// Drains entries whose dwell exceeds `ctx.delay_ms`. If `force`, drains
    /// at least one entry unconditionally first (used on pool exhaustion and
    /// at shutdown).
    pub fn drain(&mut self, force: bool, ctx: &Ctx) {
        if force {
            self.drain_one(ctx);
        }
        loop {
            if self.fifo_head.is_null() {
                return;
            }
            let dwell_elapsed = self
                .pool
                .get(self.fifo_head)
                .freed_at
                .map(|t| t.elapsed() >= Duration::from_millis(ctx.delay_ms))
                .unwrap_or(false);
            if !dwell_elapsed {
                return;
            }
            self.drain_one(ctx);
        }
    }

    fn drain_one(&mut self, ctx: &Ctx) {
        if self.fifo_head.is_null() {
            return;
        }
        let link = self.fifo_head;
        self.fifo_head = self.pool.get(link).next;
        if self.fifo_head.is_null() {
            self.fifo_tail = BlockLink::NULL;
        }

        if !Self::validate_guard(self.pool.get(link), ctx.guard_byte) {
            self.report_corruption(link, ctx); // diverges
        }

        let record = self.pool.get(link);
        let layout = Layout::from_size_align(record.length as usize + GUARD_LEN, record.align)
            .expect("layout was already validated at allocation time");
        // Safety: `start` was allocated with exactly this layout via
        // `System` and has not been freed yet.
        unsafe {
            dealloc(record.start as *mut u8, layout);
        }

        self.counters.delayed_blocks -= 1;
        self.counters.delayed_bytes -= record.length as u64;
        self.pool.release(link);
    }

    /// Fatal: reports against `link`'s captured stack and aborts. Never
    /// returns.
    pub fn report_corruption(&self, link: BlockLink, ctx: &Ctx) -> ! {
        let _guard = ScopedDisable::new(ctx.enabled); // moot before abort, kept for symmetry
        ctx.resolver.ensure_initialized();

        let record = self.pool.get(link);
        output::emit_line("report_heap_corruption");
        record.stack.dump(ctx.resolver, false, output::emit_line);

        std::process::abort();
    }

    pub fn on_shutdown(&mut self, ctx: &Ctx) {
        while !self.fifo_head.is_null() {
            self.drain(true, ctx);
        }

        {
            let _guard = ScopedDisable::new(ctx.enabled);
            ctx.resolver.ensure_initialized();

            let mut index_num = 0u32;
            for slot in 0..self.index.len() {
                let mut curr = self.index[slot];
                while !curr.is_null() {
                    index_num += 1;
                    let record = self.pool.get(curr);
                    output::emit_line(&format!("heap_leak({index_num:05}), 0x{:x}, {}", record.start, record.length));
                    record.stack.dump(ctx.resolver, false, output::emit_line);
                    curr = record.next;
                }
            }
        }

        self.maybe_emit_stats(true, ctx);
    }

    pub fn maybe_emit_stats(&mut self, force: bool, ctx: &Ctx) {
        let now = Instant::now();
        if !force && now.duration_since(self.last_stats_emit) < Duration::from_millis(ctx.stats_ms) {
            return;
        }
        self.last_stats_emit = now;

        let _guard = ScopedDisable::new(ctx.enabled);
        output::emit_line(&format!("not_freed_count, {}", self.counters.untracked_frees));
        output::emit_line(&format!("delay_free_block_count, {}", self.counters.delayed_blocks));
        output::emit_line(&format!("delay_free_memory_size, {}", self.counters.delayed_bytes / 1024));
        output::emit_line(&format!("block_count, {}", self.counters.current_blocks));
        output::emit_line(&format!("memory_size, {}", self.counters.current_bytes / 1024));
        output::emit_line(&format!("max_block_count, {}", self.counters.max_blocks));
        output::emit_line(&format!("max_memory_size, {}", self.counters.max_bytes / 1024));
    }
}

impl Default for TrackerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolResolver;
    use std::sync::atomic::AtomicBool;

    fn test_ctx<'a>(resolver: &'a SymbolResolver, enabled: &'a AtomicBool) -> Ctx<'a> {
        // delay_ms = 0 makes drain() immediate, standing in for a synthetic
        // clock without needing to sleep in tests.
        Ctx {
            resolver,
            enabled,
            guard_byte: 0xCC,
            delay_ms: 0,
            stats_ms: STATS_MS,
        }
    }

    fn tracked_region(len: usize) -> (Vec<u8>, usize) {
        let mut buf = vec![0xCCu8; len + GUARD_LEN];
        let ptr = buf.as_mut_ptr() as usize;
        (buf, ptr)
    }

    #[test]
    fn round_trip_leaves_counters_unchanged() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        let ctx = test_ctx(&resolver, &enabled);

        let mut state = TrackerState::with_capacity(8, 1024);
        let (_buf, ptr) = tracked_region(100);

        state.on_alloc(ptr, 100, 1, None, &ctx);
        assert_eq!(state.counters().current_blocks, 1);
        assert_eq!(state.counters().current_bytes, 100);

        match state.on_free(ptr, &ctx) {
            FreeOutcome::Deferred => {}
            _ => panic!("expected the tracked pointer to be deferred"),
        }
        // delay_ms = 0, so the free that follows drains it immediately.
        state.drain(false, &ctx);

        assert_eq!(state.counters().current_blocks, 0);
        assert_eq!(state.counters().current_bytes, 0);
        assert_eq!(state.counters().delayed_blocks, 0);
    }

    #[test]
    fn realloc_in_place_only_updates_length() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        let ctx = test_ctx(&resolver, &enabled);

        let mut state = TrackerState::with_capacity(8, 1024);
        let (_buf, ptr) = tracked_region(200);

        state.on_alloc(ptr, 100, 1, None, &ctx);
        state.on_realloc(ptr, ptr, 150, 1, None, &ctx);

        assert_eq!(state.counters().current_blocks, 1);
        assert_eq!(state.counters().current_bytes, 150);
    }

    #[test]
    fn realloc_move_tracks_only_the_new_pointer() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        let ctx = test_ctx(&resolver, &enabled);

        let mut state = TrackerState::with_capacity(8, 1024);
        let (_old_buf, old_ptr) = tracked_region(3_200_000);
        let (_new_buf, new_ptr) = tracked_region(200);

        state.on_alloc(old_ptr, 3_200_000, 1, None, &ctx);
        state.on_realloc(old_ptr, new_ptr, 200, 1, None, &ctx);

        assert_eq!(state.counters().current_blocks, 1);
        assert_eq!(state.counters().current_bytes, 200);
    }

    #[test]
    fn untracked_free_increments_counter_and_is_reported_untracked() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        let ctx = test_ctx(&resolver, &enabled);

        let mut state = TrackerState::with_capacity(8, 1024);
        match state.on_free(0xDEAD_BEEF, &ctx) {
            FreeOutcome::Untracked => {}
            _ => panic!("a pointer never allocated must be untracked"),
        }
        assert_eq!(state.counters().untracked_frees, 1);
    }

    #[test]
    fn double_free_is_detected_against_the_pending_fifo() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        // delay_ms large enough that the second free lands while still
        // pending, mirroring "second free within DELAY_MS" from the spec.
        let ctx = Ctx {
            resolver: &resolver,
            enabled: &enabled,
            guard_byte: 0xCC,
            delay_ms: 60_000,
            stats_ms: STATS_MS,
        };

        let mut state = TrackerState::with_capacity(8, 1024);
        let (_buf, ptr) = tracked_region(100);

        state.on_alloc(ptr, 100, 1, None, &ctx);
        match state.on_free(ptr, &ctx) {
            FreeOutcome::Deferred => {}
            _ => panic!("first free must defer"),
        }
        match state.on_free(ptr, &ctx) {
            FreeOutcome::DoubleFree(link) => {
                assert_eq!(state.pool.get(link).start, ptr);
            }
            _ => panic!("second free of a pending pointer must be a double free"),
        }
    }

    #[test]
    fn pool_exhaustion_leaves_the_fourth_allocation_untracked() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        // Large delay so nothing drains mid-scenario.
        let ctx = Ctx {
            resolver: &resolver,
            enabled: &enabled,
            guard_byte: 0xCC,
            delay_ms: 60_000,
            stats_ms: STATS_MS,
        };

        let mut state = TrackerState::with_capacity(3, 1024);
        let regions: Vec<_> = (0..4).map(|_| tracked_region(16)).collect();

        for (_buf, ptr) in &regions {
            state.on_alloc(*ptr, 16, 1, None, &ctx);
        }

        // Only the first three acquired a pool record.
        assert_eq!(state.counters().current_blocks, 3);
    }

    #[test]
    fn pool_exhausted_by_pending_blocks_recovers_via_forced_drain() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        // Large delay so nothing drains by dwell alone; only the forced
        // drain triggered by pool exhaustion should reclaim a slot.
        let ctx = Ctx {
            resolver: &resolver,
            enabled: &enabled,
            guard_byte: 0xCC,
            delay_ms: 60_000,
            stats_ms: STATS_MS,
        };

        let mut state = TrackerState::with_capacity(3, 1024);
        let regions: Vec<_> = (0..3).map(|_| tracked_region(16)).collect();

        for (_buf, ptr) in &regions {
            state.on_alloc(*ptr, 16, 1, None, &ctx);
        }
        for (_buf, ptr) in &regions {
            match state.on_free(*ptr, &ctx) {
                FreeOutcome::Deferred => {}
                _ => panic!("free of a live block must defer"),
            }
        }
        // All three pool records are Pending now, not on the free-list: the
        // pool is full, but every slot is reclaimable via a forced drain.
        assert_eq!(state.counters().delayed_blocks, 3);

        let (_new_buf, new_ptr) = tracked_region(8);
        state.on_alloc(new_ptr, 8, 1, None, &ctx);

        // on_alloc's forced drain reclaimed exactly one pending slot, so the
        // new allocation is tracked rather than silently dropped.
        assert_eq!(state.counters().current_blocks, 1);
        assert_eq!(state.counters().delayed_blocks, 2);
    }

    #[test]
    fn leak_is_emitted_exactly_once_and_fifo_is_empty_after_shutdown() {
        let resolver = SymbolResolver::new();
        let enabled = AtomicBool::new(true);
        let ctx = test_ctx(&resolver, &enabled);

        let mut state = TrackerState::with_capacity(8, 1024);
        let (_buf, ptr) = tracked_region(4);
        state.on_alloc(ptr, 4, 1, None, &ctx);

        state.on_shutdown(&ctx);

        assert!(state.fifo_head.is_null());
        assert!(state.fifo_tail.is_null());
    }
}
