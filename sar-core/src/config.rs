//! Configuration validation and derived settings

use sar_api::config::{MAXIMUM_RECEIVE_BUFFERS, MINIMUM_RECEIVE_BUFFERS};
use sar_api::error::config_error;
use sar_api::hw::MAX_VC_TABLE_SIZE;
use sar_api::{ConfigSource, Result, SarConfig, SizeClass};

/// Smallest small-buffer size the Control2 register can express, in words.
pub const CTRL2_MIN_SMALL_WORDS: u32 = 16;
/// Largest small-buffer size, in words; programmed as 0.
pub const CTRL2_MAX_SMALL_WORDS: u32 = 512;
/// Largest big buffer the hardware supports.
pub const MAX_BIG_BUFFER_SIZE: u32 = 16 * 1024;

/// Validated adapter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub vc_hash_table_size: usize,
    /// Receive buffer cap per size class, after clamping
    pub max_receive_buffers: usize,
    pub receive_buffers_per_pool: usize,
    pub big_buffer_size: usize,
    pub small_buffer_size: usize,
    pub num_vcs: usize,
    /// Receive circuits each size class may serve
    pub receive_vcs_per_class: usize,
}

impl EngineConfig {
    /// Loads and validates the configuration from `source`.
    pub fn load<C: ConfigSource + ?Sized>(source: &C) -> Result<Self> {
        let config = source.query_configuration()?;
        validate(&config)
    }

    pub fn buffer_size(&self, class: SizeClass) -> usize {
        match class {
            SizeClass::Big => self.big_buffer_size,
            SizeClass::Small => self.small_buffer_size,
        }
    }

    /// Size class serving a receive direction with the given maximum SDU.
    pub fn receive_class(&self, max_sdu_size: u32) -> SizeClass {
        if (max_sdu_size as usize).next_power_of_two() > self.small_buffer_size {
            SizeClass::Big
        } else {
            SizeClass::Small
        }
    }

    /// Control2 register value encoding both receive buffer sizes.
    pub fn control2(&self) -> u32 {
        let mut small_words = (self.small_buffer_size as u32 / 4)
            .clamp(CTRL2_MIN_SMALL_WORDS, CTRL2_MAX_SMALL_WORDS);
        if small_words == CTRL2_MAX_SMALL_WORDS {
            small_words = 0;
        }
        let big_code = match self.big_buffer_size {
            0..=1024 => 0,
            1025..=2048 => 1,
            2049..=4096 => 2,
            4097..=8192 => 3,
            8193..=10240 => 4,
            _ => 5,
        };
        small_words | (big_code << 12)
    }
}

/// Checks a raw configuration and derives the engine settings.
///
/// The receive buffer total is clamped into range rather than rejected.
pub fn validate(config: &SarConfig) -> Result<EngineConfig> {
    if config.vc_hash_table_size == 0 {
        return Err(config_error("vc_hash_table_size must be non-zero"));
    }
    if config.num_vcs == 0 || config.num_vcs > MAX_VC_TABLE_SIZE {
        return Err(config_error("num_vcs must be within 1..=4096"));
    }
    if config.small_buffer_size % 4 != 0
        || config.small_buffer_size < CTRL2_MIN_SMALL_WORDS * 4
        || config.small_buffer_size > CTRL2_MAX_SMALL_WORDS * 4
    {
        return Err(config_error("small_buffer_size must be a multiple of 4 within 64..=2048"));
    }
    if config.big_buffer_size % 4 != 0
        || config.big_buffer_size > MAX_BIG_BUFFER_SIZE
        || config.big_buffer_size <= config.small_buffer_size
    {
        return Err(config_error(
            "big_buffer_size must be a multiple of 4, at most 16384 and larger than small_buffer_size",
        ));
    }
    if config.receive_buffers_per_pool == 0 {
        return Err(config_error("receive_buffers_per_pool must be non-zero"));
    }

    let total = config
        .total_receive_buffers
        .clamp(MINIMUM_RECEIVE_BUFFERS, MAXIMUM_RECEIVE_BUFFERS);
    if total != config.total_receive_buffers {
        log::warn!(
            "total_receive_buffers {} clamped to {}",
            config.total_receive_buffers,
            total
        );
    }

    Ok(EngineConfig {
        vc_hash_table_size: config.vc_hash_table_size as usize,
        max_receive_buffers: total as usize,
        receive_buffers_per_pool: config.receive_buffers_per_pool as usize,
        big_buffer_size: config.big_buffer_size as usize,
        small_buffer_size: config.small_buffer_size as usize,
        num_vcs: config.num_vcs as usize,
        receive_vcs_per_class: (total / 3) as usize,
    })
}
