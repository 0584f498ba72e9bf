//! Bit-packed logic samples.
//!
//! A logic payload stores one sample every `unitsize` bytes. Channel `i` of
//! a sample lives in byte `i / 8`, bit `i % 8` of that sample.

use crate::datafeed::FeedError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logic {
    unitsize: usize,
    data: Vec<u8>,
}

impl Logic {
    pub fn new(unitsize: usize, data: Vec<u8>) -> Result<Self, FeedError> {
        check_layout(data.len(), unitsize)?;
        Ok(Self { unitsize, data })
    }

    pub fn unitsize(&self) -> usize {
        self.unitsize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn num_samples(&self) -> usize {
        self.data.len() / self.unitsize
    }

    pub fn samples(&self) -> LogicSamples<'_> {
        LogicSamples {
            data: &self.data,
            unitsize: self.unitsize,
        }
    }
}

fn check_layout(len: usize, unitsize: usize) -> Result<(), FeedError> {
    if unitsize == 0 {
        return Err(FeedError::ZeroUnitSize);
    }
    if len % unitsize != 0 {
        return Err(FeedError::Misaligned { len, unitsize });
    }
    Ok(())
}

/// Read-only view over bit-packed samples with checked bounds.
#[derive(Debug, Clone, Copy)]
pub struct LogicSamples<'a> {
    data: &'a [u8],
    unitsize: usize,
}

impl<'a> LogicSamples<'a> {
    pub fn new(data: &'a [u8], unitsize: usize) -> Result<Self, FeedError> {
        check_layout(data.len(), unitsize)?;
        Ok(Self { data, unitsize })
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.unitsize
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn unitsize(&self) -> usize {
        self.unitsize
    }

    /// Number of channel slots a sample can hold.
    pub fn width(&self) -> usize {
        self.unitsize * 8
    }

    pub fn sample(&self, index: usize) -> Option<&'a [u8]> {
        let start = index.checked_mul(self.unitsize)?;
        let end = start.checked_add(self.unitsize)?;
        self.data.get(start..end)
    }

    pub fn bit(&self, sample: usize, channel: usize) -> Option<bool> {
        let byte = self.sample(sample)?.get(channel / 8)?;
        Some((byte >> (channel % 8)) & 1 == 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.data.chunks_exact(self.unitsize)
    }

    /// All values of one channel, in sample order.
    pub fn channel(&self, channel: usize) -> Option<Vec<bool>> {
        if channel >= self.width() {
            return None;
        }
        Some(
            self.iter()
                .map(|sample| (sample[channel / 8] >> (channel % 8)) & 1 == 1)
                .collect(),
        )
    }
}

/// Accumulates samples channel by channel before they are sent.
#[derive(Debug, Clone)]
pub struct LogicBuilder {
    unitsize: usize,
    data: Vec<u8>,
}

impl LogicBuilder {
    /// A builder whose samples are wide enough for `num_channels` channels.
    pub fn for_channels(num_channels: usize) -> Self {
        Self {
            unitsize: num_channels.div_ceil(8).max(1),
            data: Vec::new(),
        }
    }

    pub fn with_capacity(mut self, samples: usize) -> Self {
        self.data.reserve(samples * self.unitsize);
        self
    }

    pub fn unitsize(&self) -> usize {
        self.unitsize
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.unitsize
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends one sample given as raw bytes; excess bytes are ignored and
    /// missing bytes are zero.
    pub fn push_raw(&mut self, sample: &[u8]) {
        for i in 0..self.unitsize {
            self.data.push(sample.get(i).copied().unwrap_or(0));
        }
    }

    /// Appends one sample with `bits[i]` as the level of channel `i`.
    pub fn push_bits(&mut self, bits: &[bool]) -> Result<(), FeedError> {
        if bits.len() > self.unitsize * 8 {
            return Err(FeedError::TooManyChannels {
                channels: bits.len(),
                unitsize: self.unitsize,
            });
        }
        let mut sample = vec![0u8; self.unitsize];
        for (channel, _) in bits.iter().enumerate().filter(|(_, high)| **high) {
            sample[channel / 8] |= 1 << (channel % 8);
        }
        self.data.extend_from_slice(&sample);
        Ok(())
    }

    pub fn build(self) -> Logic {
        Logic {
            unitsize: self.unitsize,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternating_bytes_decode_to_two_samples() {
        let logic = Logic::new(1, vec![0b1010_1010, 0b0101_0101]).unwrap();
        let samples = logic.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples.width(), 8);
        for s in 0..2 {
            for i in 0..8 {
                let expected = (logic.data()[s] >> i) & 1 == 1;
                assert_eq!(samples.bit(s, i), Some(expected));
            }
        }
        assert_eq!(samples.bit(0, 0), Some(false));
        assert_eq!(samples.bit(0, 1), Some(true));
        assert_eq!(samples.bit(1, 0), Some(true));
    }

    #[test]
    fn test_bounds_are_checked() {
        let logic = Logic::new(2, vec![0xff, 0x01, 0x00, 0x80]).unwrap();
        let samples = logic.samples();
        assert_eq!(samples.bit(0, 8), Some(true));
        assert_eq!(samples.bit(1, 15), Some(true));
        assert_eq!(samples.bit(1, 16), None);
        assert_eq!(samples.bit(2, 0), None);
        assert_eq!(samples.channel(16), None);
    }

    #[test]
    fn test_huge_index_is_out_of_range() {
        let logic = Logic::new(1, vec![0xff]).unwrap();
        let samples = logic.samples();
        assert_eq!(samples.sample(usize::MAX), None);
        assert_eq!(samples.bit(usize::MAX, 0), None);
        let wide = Logic::new(2, vec![0xff, 0xff]).unwrap();
        assert_eq!(wide.samples().bit(usize::MAX / 2, 0), None);
    }

    #[test]
    fn test_layout_errors() {
        assert!(matches!(Logic::new(0, vec![1]), Err(FeedError::ZeroUnitSize)));
        assert!(matches!(
            Logic::new(2, vec![1, 2, 3]),
            Err(FeedError::Misaligned { len: 3, unitsize: 2 })
        ));
    }

    #[test]
    fn test_builder_packs_bits() {
        let mut builder = LogicBuilder::for_channels(10);
        assert_eq!(builder.unitsize(), 2);
        let mut bits = [false; 10];
        bits[0] = true;
        bits[9] = true;
        builder.push_bits(&bits).unwrap();
        builder.push_raw(&[0x0f]);
        let logic = builder.build();
        assert_eq!(logic.data(), &[0x01, 0x02, 0x0f, 0x00]);
        assert_eq!(
            logic.samples().channel(0),
            Some(vec![true, true])
        );
        assert!(LogicBuilder::for_channels(8).push_bits(&[false; 9]).is_err());
    }
}
