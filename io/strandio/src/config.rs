/// Configuration for a worker's io_uring instance.
#[derive(Clone, Debug)]
pub struct RingConfig {
    /// Number of SQ entries. The CQ is sized at 4x this.
    pub queue_depth: u32,
    /// Provided buffer ring used for buffer-select recv.
    pub recv_buffers: BufRingConfig,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4096,
            recv_buffers: BufRingConfig::default(),
        }
    }
}

/// Configuration for the provided buffer ring.
#[derive(Clone, Debug)]
pub struct BufRingConfig {
    /// Number of buffers in the ring (must be a power of 2).
    pub ring_entries: u16,
    /// Size of each buffer in bytes.
    pub buffer_size: u32,
    /// Buffer group ID registered with the kernel.
    pub bgid: u16,
}

impl Default for BufRingConfig {
    fn default() -> Self {
        Self {
            ring_entries: 256,
            buffer_size: 4096,
            bgid: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_dimensions() {
        let config = RingConfig::default();
        assert_eq!(config.queue_depth, 4096);
        assert_eq!(config.recv_buffers.ring_entries, 256);
        assert_eq!(config.recv_buffers.buffer_size, 4096);
        assert_eq!(config.recv_buffers.bgid, 1);
        assert!(config.recv_buffers.ring_entries.is_power_of_two());
    }
}
