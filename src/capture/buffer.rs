use super::resample::encode_pcm16;

/// Fraction of capacity at which the buffer flushes early
const EARLY_FLUSH_NUMERATOR: usize = 3;
const EARLY_FLUSH_DENOMINATOR: usize = 4;

/// Fixed-size sample buffer holding exactly one chunk of target-rate audio.
///
/// Flushes before it would overflow, and early once 75% full so no sample waits
/// longer than a quarter chunk past the early-flush point.
#[derive(Debug)]
pub struct ChunkBuffer {
    samples: Vec<f32>,
    capacity: usize,
}

impl ChunkBuffer {
    pub fn new(target_sample_rate: u32, buffer_duration_ms: u32) -> Self {
        let capacity = ((target_sample_rate as u64 * buffer_duration_ms as u64) / 1000).max(1) as usize;
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append samples, returning every chunk completed along the way as PCM16 bytes
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let room = self.capacity - self.samples.len();
            if room == 0 {
                chunks.extend(self.flush());
                continue;
            }
            let take = room.min(rest.len());
            self.samples.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }

        if self.samples.len() * EARLY_FLUSH_DENOMINATOR >= self.capacity * EARLY_FLUSH_NUMERATOR {
            chunks.extend(self.flush());
        }

        chunks
    }

    /// Emit whatever is buffered; the allocation is kept
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.samples.is_empty() {
            return None;
        }
        let bytes = encode_pcm16(&self.samples);
        self.samples.clear();
        Some(bytes)
    }

    /// Drop buffered samples without emitting them
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_one_chunk() {
        let buffer = ChunkBuffer::new(16_000, 100);
        assert_eq!(buffer.capacity(), 1600);
    }

    #[test]
    fn test_early_flush_at_three_quarters() {
        let mut buffer = ChunkBuffer::new(16_000, 100);

        assert!(buffer.push(&[0.0; 1000]).is_empty());
        assert_eq!(buffer.len(), 1000);

        let chunks = buffer.push(&[0.0; 200]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1200 * 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_flushes_before_filling() {
        let mut buffer = ChunkBuffer::new(16_000, 100);
        buffer.push(&[0.0; 1100]);

        // 1100 + 3000: full chunk at 1600, then 1600 more, then 900 left over
        let chunks = buffer.push(&[0.5; 3000]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1600 * 2);
        assert_eq!(chunks[1].len(), 1600 * 2);
        assert_eq!(buffer.len(), 900);
    }

    #[test]
    fn test_flush_keeps_allocation() {
        let mut buffer = ChunkBuffer::new(16_000, 100);
        buffer.push(&[0.1; 100]);

        assert_eq!(buffer.flush().map(|b| b.len()), Some(200));
        assert!(buffer.is_empty());
        assert!(buffer.samples.capacity() >= 1600);
        assert_eq!(buffer.flush(), None);
    }
}
