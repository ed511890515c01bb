use serde::Deserialize;

/// Geometry of one cache level. `sets == 0` disables the level; every
/// access then passes through to the next level unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelConfig {
    pub sets: usize,
    pub assoc: usize,
    pub hit_time: u32,
}

/// Full hierarchy geometry, normally deserialized from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub block_size: usize,
    pub mem_latency: u32,
    #[serde(default)]
    pub inclusive: bool,
    pub icache: LevelConfig,
    pub dcache: LevelConfig,
    pub l2: LevelConfig,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("block size must be a power of two, got {0}")]
    BlockSize(usize),
    #[error("{level}: set count must be a power of two or zero, got {sets}")]
    SetCount { level: &'static str, sets: usize },
    #[error("{level}: associativity must be at least one")]
    ZeroAssoc { level: &'static str },
    #[error("{level}: {sets} sets of {block_size} byte blocks exceed a 32-bit address")]
    AddressSpace {
        level: &'static str,
        sets: usize,
        block_size: usize,
    },
    #[error("{level}: {sets} sets x {assoc} ways overflows the line count")]
    TooManyLines {
        level: &'static str,
        sets: usize,
        assoc: usize,
    },
    #[error("{level}: failed to allocate {lines} lines")]
    Alloc { level: &'static str, lines: usize },
}

impl Config {
    /// Reject geometry the bit-level address split cannot represent.
    /// Disabled levels are skipped; their other fields are ignored.
    pub fn check(&self) -> Result<(), ConfigError> {
        if !self.block_size.is_power_of_two() {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        let block_bits = self.block_size.ilog2();
        for (level, lc) in [
            ("icache", &self.icache),
            ("dcache", &self.dcache),
            ("l2", &self.l2),
        ] {
            if lc.sets == 0 {
                continue;
            }
            if !lc.sets.is_power_of_two() {
                return Err(ConfigError::SetCount { level, sets: lc.sets });
            }
            if lc.assoc == 0 {
                return Err(ConfigError::ZeroAssoc { level });
            }
            if block_bits + lc.sets.ilog2() > 32 {
                return Err(ConfigError::AddressSpace {
                    level,
                    sets: lc.sets,
                    block_size: self.block_size,
                });
            }
            if lc.sets.checked_mul(lc.assoc).is_none() {
                return Err(ConfigError::TooManyLines {
                    level,
                    sets: lc.sets,
                    assoc: lc.assoc,
                });
            }
        }
        Ok(())
    }
}
