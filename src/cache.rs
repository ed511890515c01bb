use std::ops::Range;

use serde::Serialize;

use crate::config::{Config, ConfigError, LevelConfig};

/// Where an address lands under one level's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Addr {
    set: usize,
    tag: usize,
}

#[derive(Debug)]
struct BitSection {
    shift: usize,
    mask: usize,
}

impl BitSection {
    fn apply(&self, num: usize) -> usize {
        (num >> self.shift) & self.mask
    }
}

/// Monotonic event counter stamped onto lines for recency ordering.
/// Wall-clock stamps are too coarse to order back-to-back accesses, so
/// every stamped event gets its own tick instead.
#[derive(Debug, Default)]
struct Clock(u64);

impl Clock {
    fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

#[derive(Debug, Clone, Default)]
struct Line {
    tag: usize,
    valid: bool,
    last_access: u64,
}

/// Reference, miss, and penalty counters for one level. Only ever
/// incremented after initialization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LevelStats {
    pub refs: u64,
    pub misses: u64,
    pub penalty_cycles: u64,
}

/// Derived per-level summary for the final report.
#[derive(Debug, Serialize)]
pub struct LevelReport {
    pub name: &'static str,
    pub refs: u64,
    pub misses: u64,
    pub miss_rate: f64,
    pub penalty_cycles: u64,
    pub avg_access_time: f64,
}

/// One set-associative level: `sets x assoc` lines plus the bit
/// sections that carve an address into tag and set index.
#[derive(Debug)]
struct Level {
    name: &'static str,
    lines: Vec<Line>,
    n_ways: usize,
    hit_time: u32,
    set_sec: BitSection,
    tag_sec: BitSection,
    stats: LevelStats,
}

impl Level {
    fn new(
        name: &'static str,
        block_size: usize,
        n_sets: usize,
        n_ways: usize,
        hit_time: u32,
    ) -> Result<Self, ConfigError> {
        debug_assert!(block_size.is_power_of_two());
        debug_assert!(n_sets.is_power_of_two());
        let block_bits = block_size.ilog2() as usize;
        let set_sec = BitSection {
            shift: block_bits,
            mask: n_sets - 1,
        };
        let tag_sec = BitSection {
            shift: block_bits + n_sets.ilog2() as usize,
            mask: usize::MAX,
        };

        let total = n_sets * n_ways;
        let mut lines = Vec::new();
        lines
            .try_reserve_exact(total)
            .map_err(|_| ConfigError::Alloc { level: name, lines: total })?;
        lines.resize(total, Line::default());

        Ok(Level {
            name,
            lines,
            n_ways,
            hit_time,
            set_sec,
            tag_sec,
            stats: LevelStats::default(),
        })
    }

    fn split(&self, addr: usize) -> Addr {
        Addr {
            set: self.set_sec.apply(addr),
            tag: self.tag_sec.apply(addr),
        }
    }

    /// Rebuild the block-aligned address a resident line maps to.
    fn block_addr(&self, addr: Addr) -> usize {
        (addr.tag << self.tag_sec.shift) | (addr.set << self.set_sec.shift)
    }

    fn set_range(&self, set: usize) -> Range<usize> {
        set * self.n_ways..(set + 1) * self.n_ways
    }

    fn lookup(&mut self, addr: Addr, now: u64) -> Option<u32> {
        let set = self.set_range(addr.set);
        for line in &mut self.lines[set] {
            if line.valid && line.tag == addr.tag {
                line.last_access = now;
                return Some(self.hit_time);
            }
        }
        None
    }

    /// Install `addr` over the least recently stamped line in its set
    /// and hand back whatever block that line previously held. The
    /// oldest stamp loses; equal stamps fall to the lowest way.
    fn fill(&mut self, addr: Addr, now: u64) -> Option<Addr> {
        let set = self.set_range(addr.set);
        let lines = &mut self.lines[set];
        let mut victim = 0;
        for way in 1..lines.len() {
            if lines[way].last_access < lines[victim].last_access {
                victim = way;
            }
        }
        let line = &mut lines[victim];
        let evicted = line.valid.then_some(Addr {
            set: addr.set,
            tag: line.tag,
        });
        line.tag = addr.tag;
        line.valid = true;
        line.last_access = now;
        evicted
    }

    /// Invalidation entry point for inclusive evictions from the level
    /// below: drop our copy of `block` without touching its tag or stamp.
    fn invalidate_block(&mut self, block: usize) {
        let addr = self.split(block);
        let set = self.set_range(addr.set);
        for line in &mut self.lines[set] {
            if line.valid && line.tag == addr.tag {
                log::debug!("{}: invalidating block {block:#010x}", self.name);
                line.valid = false;
            }
        }
    }

    fn report(&self) -> LevelReport {
        let LevelStats { refs, misses, penalty_cycles } = self.stats;
        let (miss_rate, avg_access_time) = if refs > 0 {
            (
                misses as f64 / refs as f64,
                f64::from(self.hit_time) + penalty_cycles as f64 / refs as f64,
            )
        } else {
            (0.0, f64::from(self.hit_time))
        };
        LevelReport {
            name: self.name,
            refs,
            misses,
            miss_rate,
            penalty_cycles,
            avg_access_time,
        }
    }
}

/// Shared second level, backed directly by main memory. Owns the
/// inclusion invariant: when a block is evicted here, both first-level
/// caches are told to drop their copies before the slot is reused.
#[derive(Debug)]
struct L2 {
    level: Option<Level>,
    inclusive: bool,
    mem_latency: u32,
}

impl L2 {
    fn access(&mut self, addr: usize, l1s: [Option<&mut Level>; 2], clock: &mut Clock) -> u32 {
        let Some(level) = self.level.as_mut() else {
            // Disabled shared level: every reference is a memory round trip.
            return self.mem_latency;
        };
        level.stats.refs += 1;
        let split = level.split(addr);
        let now = clock.tick();
        if let Some(latency) = level.lookup(split, now) {
            return latency;
        }
        level.stats.misses += 1;
        if let Some(evicted) = level.fill(split, now) {
            if self.inclusive {
                let block = level.block_addr(evicted);
                for l1 in l1s.into_iter().flatten() {
                    l1.invalidate_block(block);
                }
            }
        }
        level.stats.penalty_cycles += u64::from(self.mem_latency);
        self.mem_latency + level.hit_time
    }

    fn stats(&self) -> LevelStats {
        self.level.as_ref().map(|l| l.stats).unwrap_or_default()
    }
}

/// The full hierarchy: split instruction/data first level in front of a
/// shared second level. All state lives here; accesses are sequential.
#[derive(Debug)]
pub struct Hierarchy {
    icache: Option<Level>,
    dcache: Option<Level>,
    l2: L2,
    clock: Clock,
}

impl Hierarchy {
    /// Build a zeroed hierarchy from validated geometry. A level with
    /// `sets == 0` is not instantiated at all.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.check()?;
        let build = |name: &'static str, lc: &LevelConfig| -> Result<Option<Level>, ConfigError> {
            if lc.sets == 0 {
                return Ok(None);
            }
            Level::new(name, config.block_size, lc.sets, lc.assoc, lc.hit_time).map(Some)
        };
        Ok(Hierarchy {
            icache: build("icache", &config.icache)?,
            dcache: build("dcache", &config.dcache)?,
            l2: L2 {
                level: build("l2", &config.l2)?,
                inclusive: config.inclusive,
                mem_latency: config.mem_latency,
            },
            clock: Clock::default(),
        })
    }

    /// Instruction-fetch reference. Returns the access latency in cycles.
    pub fn access_instruction(&mut self, addr: u32) -> u32 {
        let Hierarchy { icache, dcache, l2, clock } = self;
        Self::l1_access(icache, dcache, l2, clock, addr as usize)
    }

    /// Data reference, load or store alike. Returns the access latency
    /// in cycles.
    pub fn access_data(&mut self, addr: u32) -> u32 {
        let Hierarchy { icache, dcache, l2, clock } = self;
        Self::l1_access(dcache, icache, l2, clock, addr as usize)
    }

    fn l1_access(
        active: &mut Option<Level>,
        other: &mut Option<Level>,
        l2: &mut L2,
        clock: &mut Clock,
        addr: usize,
    ) -> u32 {
        let Some(l1) = active.as_mut() else {
            // Disabled level: traffic falls straight through to the
            // shared level, which still sees the other invalidation target.
            return l2.access(addr, [other.as_mut(), None], clock);
        };
        l1.stats.refs += 1;
        let split = l1.split(addr);
        if let Some(latency) = l1.lookup(split, clock.tick()) {
            return latency;
        }
        l1.stats.misses += 1;
        // The shared level may invalidate lines in either first-level
        // cache while it makes room, this one included.
        let penalty = l2.access(addr, [Some(&mut *l1), other.as_mut()], clock);
        l1.fill(split, clock.tick());
        l1.stats.penalty_cycles += u64::from(penalty);
        penalty + l1.hit_time
    }

    pub fn icache_stats(&self) -> LevelStats {
        self.icache.as_ref().map(|l| l.stats).unwrap_or_default()
    }

    pub fn dcache_stats(&self) -> LevelStats {
        self.dcache.as_ref().map(|l| l.stats).unwrap_or_default()
    }

    pub fn l2_stats(&self) -> LevelStats {
        self.l2.stats()
    }

    /// Report rows for the enabled levels, in hierarchy order.
    pub fn report(&self) -> Vec<LevelReport> {
        [
            self.icache.as_ref(),
            self.dcache.as_ref(),
            self.l2.level.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(Level::report)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LevelConfig};

    fn level(sets: usize, assoc: usize, hit_time: u32) -> LevelConfig {
        LevelConfig { sets, assoc, hit_time }
    }

    fn disabled() -> LevelConfig {
        level(0, 0, 0)
    }

    fn hierarchy(
        icache: LevelConfig,
        dcache: LevelConfig,
        l2: LevelConfig,
        inclusive: bool,
    ) -> Hierarchy {
        Hierarchy::new(&Config {
            block_size: 4,
            mem_latency: 100,
            inclusive,
            icache,
            dcache,
            l2,
        })
        .unwrap()
    }

    #[test]
    fn address_split_follows_level_geometry() {
        // 4 byte blocks, 4 sets: 2 offset bits, 2 index bits, 28 tag bits.
        let l = Level::new("dcache", 4, 4, 2, 1).unwrap();
        let addr = l.split(0xDEAD_BEEF);
        assert_eq!(addr, Addr { set: 3, tag: 0x0DEA_DBEE });
        assert_eq!(l.block_addr(addr), 0xDEAD_BEEC);
    }

    #[test]
    fn repeat_access_hits_at_level_hit_time() {
        let mut h = hierarchy(disabled(), level(4, 2, 1), level(16, 4, 10), false);
        h.access_data(0x1234);
        assert_eq!(h.access_data(0x1234), 1);
        assert_eq!(h.dcache_stats().refs, 2);
        assert_eq!(h.dcache_stats().misses, 1);
        assert_eq!(h.l2_stats().refs, 1);
    }

    #[test]
    fn lru_evicts_oldest_line_in_set() {
        // One set, two ways: filling three distinct blocks pushes out
        // the first while the last two stay resident.
        let mut h = hierarchy(disabled(), level(1, 2, 1), level(16, 4, 10), false);
        for addr in [0x00, 0x10, 0x20] {
            h.access_data(addr);
        }
        assert_eq!(h.dcache_stats().misses, 3);
        h.access_data(0x20);
        h.access_data(0x10);
        assert_eq!(h.dcache_stats().misses, 3);
        h.access_data(0x00);
        assert_eq!(h.dcache_stats().misses, 4);
    }

    #[test]
    fn touching_a_line_refreshes_its_recency() {
        let mut h = hierarchy(disabled(), level(1, 2, 1), level(16, 4, 10), false);
        h.access_data(0x00);
        h.access_data(0x10);
        h.access_data(0x00); // now 0x10 is the oldest
        h.access_data(0x20);
        assert_eq!(h.dcache_stats().misses, 3);
        h.access_data(0x00);
        assert_eq!(h.dcache_stats().misses, 3);
        h.access_data(0x10);
        assert_eq!(h.dcache_stats().misses, 4);
    }

    #[test]
    fn miss_latency_stacks_level_by_level() {
        let mut h = hierarchy(disabled(), level(1, 1, 1), level(1, 2, 10), false);
        assert_eq!(h.access_data(0x00), 111); // misses both levels
        assert_eq!(h.access_data(0x10), 111); // evicts 0x00 from the d-cache only
        assert_eq!(h.access_data(0x00), 11); // d-cache miss, shared hit
        assert_eq!(h.l2_stats().misses, 2);
        assert_eq!(h.dcache_stats().penalty_cycles, 230);
        assert_eq!(h.l2_stats().penalty_cycles, 200);
    }

    #[test]
    fn single_line_shared_level_thrashes() {
        let mut h = hierarchy(disabled(), level(1, 2, 1), level(1, 1, 10), true);
        let latencies: Vec<u32> = [0x00, 0x10, 0x20]
            .into_iter()
            .map(|addr| h.access_data(addr))
            .collect();
        assert_eq!(latencies, [111, 111, 111]);
        assert_eq!(h.dcache_stats().misses, 3);
        assert_eq!(h.l2_stats().misses, 3);
    }

    #[test]
    fn shared_eviction_invalidates_first_level_copies() {
        let mut h = hierarchy(disabled(), level(1, 2, 1), level(1, 1, 10), true);
        h.access_data(0x00);
        h.access_data(0x10); // shared level evicts 0x00, d-cache copy dropped
        assert_eq!(h.access_data(0x00), 111);
        assert_eq!(h.dcache_stats().misses, 3);
    }

    #[test]
    fn non_inclusive_hierarchy_keeps_first_level_copies() {
        let mut h = hierarchy(disabled(), level(1, 2, 1), level(1, 1, 10), false);
        h.access_data(0x00);
        h.access_data(0x10);
        assert_eq!(h.access_data(0x00), 1);
        assert_eq!(h.dcache_stats().misses, 2);
    }

    #[test]
    fn fetch_side_copies_are_invalidated_too() {
        let mut h = hierarchy(level(1, 2, 1), level(1, 2, 1), level(1, 1, 10), true);
        h.access_instruction(0x00);
        h.access_data(0x10); // shared level evicts 0x00 out from under the i-cache
        assert_eq!(h.access_instruction(0x00), 111);
        assert_eq!(h.icache_stats().misses, 2);
    }

    #[test]
    fn disabled_first_level_passes_through() {
        let mut h = hierarchy(disabled(), level(1, 2, 1), level(1, 2, 10), false);
        assert_eq!(h.access_instruction(0x00), 110);
        assert_eq!(h.icache_stats(), LevelStats::default());
        assert_eq!(h.l2_stats().refs, 1);
    }

    #[test]
    fn disabled_shared_level_charges_memory_directly() {
        let mut h = hierarchy(disabled(), level(1, 2, 1), disabled(), false);
        assert_eq!(h.access_data(0x00), 101);
        assert_eq!(h.access_data(0x00), 1);
        assert_eq!(h.l2_stats(), LevelStats::default());
        assert_eq!(h.dcache_stats().penalty_cycles, 100);
    }

    #[test]
    fn fully_disabled_hierarchy_is_flat_memory_latency() {
        let mut h = hierarchy(disabled(), disabled(), disabled(), false);
        assert_eq!(h.access_instruction(0x00), 100);
        assert_eq!(h.access_data(0x00), 100);
    }

    #[test]
    fn report_covers_enabled_levels_only() {
        let mut h = hierarchy(disabled(), level(1, 2, 1), level(1, 2, 10), false);
        h.access_data(0x00);
        h.access_data(0x00);
        let report = h.report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].name, "dcache");
        assert_eq!(report[0].miss_rate, 0.5);
        assert_eq!(report[0].avg_access_time, 1.0 + 110.0 / 2.0);
        assert_eq!(report[1].name, "l2");
    }
}
