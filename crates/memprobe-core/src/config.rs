//! # Probe Configuration
//!
//! [`ProbeConfig`] fixes everything a run needs before any memory is
//! touched. Build it with [`ProbeConfig::builder`]; `build()` validates.

use serde::{Deserialize, Serialize};

use crate::numa::Placement;
use crate::strategy::{AccessStrategy, SimdWidth, StrategyKind};
use crate::{ProbeError, Result};

/// Default payload: 4 GiB.
pub const DEFAULT_PAYLOAD_BYTES: usize = 4 << 30;

/// Default byte written by the flush and fixed-stride strategies.
pub const DEFAULT_FILL_BYTE: u8 = 0x00;

/// Default byte of the adaptive strategy's source buffer.
pub const DEFAULT_SOURCE_BYTE: u8 = 0xAA;

/// Configuration of a single probe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Access strategy
    pub strategy: StrategyKind,
    /// Region size in bytes
    pub payload_bytes: usize,
    /// Byte written by the flush and fixed-stride strategies
    pub fill_byte: u8,
    /// Byte the adaptive strategy's source buffer is filled with
    pub source_byte: u8,
    /// Page placement of the measured region
    pub placement: Placement,
    /// Forced SIMD width; `None` picks the widest the CPU supports
    pub simd_width: Option<SimdWidth>,
    /// Advise transparent huge pages for the measured region
    pub huge_pages: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            payload_bytes: DEFAULT_PAYLOAD_BYTES,
            fill_byte: DEFAULT_FILL_BYTE,
            source_byte: DEFAULT_SOURCE_BYTE,
            placement: Placement::FirstTouch,
            simd_width: None,
            huge_pages: false,
        }
    }
}

impl ProbeConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ProbeConfigBuilder {
        ProbeConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// Placement nodes are checked against the topology at allocation time.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] for a zero payload or a forced
    /// SIMD width the CPU cannot execute.
    pub fn validate(&self) -> Result<()> {
        if self.payload_bytes == 0 {
            return Err(ProbeError::InvalidConfig(
                "payload_bytes must be > 0".to_string(),
            ));
        }
        if let Some(width) = self.simd_width {
            if !width.is_supported() {
                return Err(ProbeError::InvalidConfig(format!(
                    "SIMD width {width} not supported by this CPU (widest is {})",
                    SimdWidth::detect()
                )));
            }
        }
        Ok(())
    }

    /// The parameterised strategy this configuration selects.
    #[must_use]
    pub fn access_strategy(&self) -> AccessStrategy {
        match self.strategy {
            StrategyKind::FlushBased => AccessStrategy::FlushBased {
                fill: self.fill_byte,
            },
            StrategyKind::StreamingFixedStride => AccessStrategy::StreamingFixedStride {
                fill: self.fill_byte,
            },
            StrategyKind::StreamingAdaptiveWidth => AccessStrategy::StreamingAdaptiveWidth {
                width: self.simd_width.unwrap_or_else(SimdWidth::detect),
            },
        }
    }
}

/// Builder for [`ProbeConfig`].
#[derive(Debug, Default)]
pub struct ProbeConfigBuilder {
    strategy: Option<StrategyKind>,
    payload_bytes: Option<usize>,
    fill_byte: Option<u8>,
    source_byte: Option<u8>,
    placement: Option<Placement>,
    simd_width: Option<SimdWidth>,
    huge_pages: Option<bool>,
}

impl ProbeConfigBuilder {
    /// Sets the access strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the payload size in bytes.
    #[must_use]
    pub fn payload_bytes(mut self, bytes: usize) -> Self {
        self.payload_bytes = Some(bytes);
        self
    }

    /// Sets the fill byte.
    #[must_use]
    pub fn fill_byte(mut self, byte: u8) -> Self {
        self.fill_byte = Some(byte);
        self
    }

    /// Sets the adaptive strategy's source byte.
    #[must_use]
    pub fn source_byte(mut self, byte: u8) -> Self {
        self.source_byte = Some(byte);
        self
    }

    /// Sets the page placement policy.
    #[must_use]
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Forces a SIMD width instead of the detected one.
    #[must_use]
    pub fn simd_width(mut self, width: SimdWidth) -> Self {
        self.simd_width = Some(width);
        self
    }

    /// Enables or disables transparent huge pages.
    #[must_use]
    pub fn huge_pages(mut self, enabled: bool) -> Self {
        self.huge_pages = Some(enabled);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<ProbeConfig> {
        let config = ProbeConfig {
            strategy: self.strategy.unwrap_or_default(),
            payload_bytes: self.payload_bytes.unwrap_or(DEFAULT_PAYLOAD_BYTES),
            fill_byte: self.fill_byte.unwrap_or(DEFAULT_FILL_BYTE),
            source_byte: self.source_byte.unwrap_or(DEFAULT_SOURCE_BYTE),
            placement: self.placement.unwrap_or_default(),
            simd_width: self.simd_width,
            huge_pages: self.huge_pages.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parses a byte count such as `4096`, `64KiB`, `512M` or `4GiB`.
///
/// Suffixes are binary (`K` = 1024) and case-insensitive; a trailing
/// `iB` or `B` is optional.
///
/// # Errors
///
/// Returns [`ProbeError::InvalidConfig`] on malformed input or overflow.
pub fn parse_byte_size(input: &str) -> Result<usize> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);

    let invalid = || ProbeError::InvalidConfig(format!("invalid byte size '{input}'"));

    let value: usize = digits.parse().map_err(|_| invalid())?;
    let shift = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        _ => return Err(invalid()),
    };

    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| ProbeError::InvalidConfig(format!("byte size '{input}' overflows")))
}

/// Parses a byte value, decimal or `0x`-prefixed hex.
///
/// # Errors
///
/// Returns [`ProbeError::InvalidConfig`] if the value does not fit a byte.
pub fn parse_byte(input: &str) -> Result<u8> {
    let s = input.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| ProbeError::InvalidConfig(format!("invalid byte value '{input}'")))
}
