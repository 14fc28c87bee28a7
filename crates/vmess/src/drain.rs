//! Discarding input after a failed handshake.
//!
//! A rejected connection is not closed where validation failed. The server
//! first reads up to a fixed per-server amount of bytes, counting what the
//! handshake already consumed.

use std::io;

use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt};

const DRAIN_FOUNDATION: usize = 16 + 38;
const MAX_BASE_DRAIN: usize = 3266;
const MAX_RAND_DRAIN: usize = 64;

#[derive(Debug, Clone)]
pub struct Drainer {
    size: usize,
    received: usize,
}

impl Drainer {
    pub fn new(behavior_seed: u64) -> Self {
        let mut seeded = StdRng::seed_from_u64(behavior_seed);
        let size = DRAIN_FOUNDATION
            + seeded.gen_range(0..MAX_BASE_DRAIN)
            + rand::thread_rng().gen_range(0..MAX_RAND_DRAIN);
        Self { size, received: 0 }
    }

    pub fn acknowledge_receive(&mut self, n: usize) {
        self.received += n;
    }

    /// Bytes still to be discarded.
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.received)
    }

    /// Reads and drops the remaining bytes, stopping early at EOF.
    pub async fn drain<R>(&self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.remaining() as u64;
        let drained = tokio::io::copy(&mut reader.take(limit), &mut tokio::io::sink()).await?;
        debug!("drained {} bytes after failed handshake", drained);
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_depends_on_seed_within_bounds() {
        for seed in 0..64 {
            let drainer = Drainer::new(seed);
            assert!(drainer.size >= DRAIN_FOUNDATION);
            assert!(drainer.size < DRAIN_FOUNDATION + MAX_BASE_DRAIN + MAX_RAND_DRAIN);

            let again = Drainer::new(seed);
            assert!(drainer.size.abs_diff(again.size) < MAX_RAND_DRAIN);
        }
    }

    #[tokio::test]
    async fn drains_what_is_left() {
        let mut drainer = Drainer::new(42);
        drainer.acknowledge_receive(16);
        let expected = drainer.remaining();

        let input = vec![0u8; expected + 100];
        let mut reader = input.as_slice();
        let drained = drainer.drain(&mut reader).await.unwrap();

        assert_eq!(drained as usize, expected);
        assert_eq!(reader.len(), 100);
    }
}
