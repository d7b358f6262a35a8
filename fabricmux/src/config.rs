//! Tunable constants and the configuration surface embedders use to adjust
//! them without forking the crate.

use std::time::Duration;

/// Default per-stream send window: 256 KiB.
pub const WINDOW_SIZE: u32 = 256 * 1024;
/// Default timeout for `Fabric::dial`.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard cap on a single frame's payload length; also the upper bound used by
/// the write-chunk randomizer.
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024;
/// Lower bound used by the write-chunk randomizer.
pub const MIN_WRITE_CHUNK: usize = 16 * 1024;

/// Per-fabric tunables. `Default` matches the normative values above.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Initial send window credited to each newly established stream.
    pub window_size: u32,
    /// How long `dial` waits for a RESULT frame before failing.
    pub dial_timeout: Duration,
    /// Maximum payload length accepted by the frame codec; frames claiming a
    /// larger length are a protocol error and tear down the fabric.
    pub max_frame_payload: usize,
    /// Lower bound (inclusive) of the randomized write-chunk size.
    pub min_write_chunk: usize,
    /// Upper bound (exclusive) of the randomized write-chunk size.
    pub max_write_chunk: usize,
    /// Label reported by `Stream::local_addr`. The core has no transport
    /// addresses of its own; this is purely a caller-supplied tag.
    pub local_endpoint: String,
    /// Label reported by `Stream::remote_addr`.
    pub remote_endpoint: String,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            window_size: WINDOW_SIZE,
            dial_timeout: DIAL_TIMEOUT,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            min_write_chunk: MIN_WRITE_CHUNK,
            max_write_chunk: MAX_FRAME_PAYLOAD,
            local_endpoint: "local".into(),
            remote_endpoint: "remote".into(),
        }
    }
}

impl FabricConfig {
    /// Validate the configuration, rejecting degenerate values that would
    /// make the multiplexer unable to make progress.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("window_size must be nonzero".into());
        }
        if self.max_frame_payload == 0 {
            return Err("max_frame_payload must be nonzero".into());
        }
        if self.min_write_chunk == 0 || self.min_write_chunk >= self.max_write_chunk {
            return Err("min_write_chunk must be nonzero and less than max_write_chunk".into());
        }
        if self.max_write_chunk > self.max_frame_payload {
            return Err("max_write_chunk must not exceed max_frame_payload".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(FabricConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_window_rejected() {
        let mut cfg = FabricConfig::default();
        cfg.window_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_chunk_bounds_rejected() {
        let mut cfg = FabricConfig::default();
        cfg.min_write_chunk = cfg.max_write_chunk;
        assert!(cfg.validate().is_err());
    }
}
