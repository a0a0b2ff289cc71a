//! The memory-mapped capture region
//!
//! This is the only module that touches raw pointers into the DMA memory.
//! Everything else gets bounds-checked [`PhaseBuffer`] views.
//!
//! The region is written by the FPGA's DMA engine while we read it. That is
//! sound as long as we only ever look at the bank the engine is *not*
//! currently targeting, which [`crate::capture::CaptureBuffer`] guarantees by
//! only handing out slices of the bank that just completed.

use std::{fs::File, ops::Range, ptr, sync::Arc};

use byte_slice_cast::{AsByteSlice, AsSliceOf};
use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::{AdcPolarity, Error, Result, SAMPLE_SIZE};

enum Mapping {
    Device(MmapRaw),
    Anonymous(MmapMut),
}

struct Inner {
    // Keeps the pages mapped; `base` points into it
    _mapping: Mapping,
    base: *mut u8,
    len: usize,
    phys_base: u64,
}

// Safety: the mapping lives as long as `Inner`, and access to the bytes is
// either read-only or limited to the bank the DMA engine is not using
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Handle to the whole capture area. Clones share one mapping.
#[derive(Clone)]
pub struct CaptureRegion {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CaptureRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner._mapping {
            Mapping::Device(_) => "device",
            Mapping::Anonymous(_) => "anonymous",
        };
        f.debug_struct("CaptureRegion")
            .field("kind", &kind)
            .field("len", &self.inner.len)
            .field("phys_base", &format_args!("{:#x}", self.inner.phys_base))
            .finish()
    }
}

impl CaptureRegion {
    /// Map `len` bytes of the device's capture memory
    pub fn from_device(file: &File, len: usize, phys_base: u64) -> Result<Self> {
        let map = MmapOptions::new()
            .len(len)
            .map_raw(file)
            .map_err(|source| Error::Map { len, source })?;
        let base = map.as_mut_ptr();
        Ok(Self::wrap(Mapping::Device(map), base, len, phys_base))
    }

    /// Plain memory standing in for the device (simulation and tests)
    pub fn anonymous(len: usize, phys_base: u64) -> Result<Self> {
        let mut map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|source| Error::Map { len, source })?;
        let base = map.as_mut_ptr();
        Ok(Self::wrap(Mapping::Anonymous(map), base, len, phys_base))
    }

    fn wrap(mapping: Mapping, base: *mut u8, len: usize, phys_base: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                _mapping: mapping,
                base,
                len,
                phys_base,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Bus address of byte 0
    pub fn phys_base(&self) -> u64 {
        self.inner.phys_base
    }

    fn check(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds {
            offset,
            end: usize::MAX,
            len: self.inner.len,
        })?;
        if end > self.inner.len {
            return Err(Error::OutOfBounds {
                offset,
                end,
                len: self.inner.len,
            });
        }
        if offset % SAMPLE_SIZE != 0 {
            return Err(Error::Misaligned(format!("offset {offset} is not sample aligned")));
        }
        Ok(offset..end)
    }

    /// Read-only view of `len` bytes at `offset`
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.check(offset, len)?;
        // Safety: range was checked against the mapping, which outlives `self`
        Ok(unsafe { std::slice::from_raw_parts(self.inner.base.add(range.start), len) })
    }

    /// `count` samples starting at byte `offset`
    pub fn phase_buffer(
        &self,
        offset: usize,
        count: usize,
        polarity: AdcPolarity,
    ) -> Result<PhaseBuffer<'_>> {
        let bytes = self.bytes(offset, count * SAMPLE_SIZE)?;
        PhaseBuffer::from_bytes(bytes, polarity, self.inner.phys_base + offset as u64)
    }

    /// Copy raw sample words into the region
    pub fn write_samples(&self, offset: usize, samples: &[u16]) -> Result<()> {
        let src = samples.as_byte_slice();
        let range = self.check(offset, src.len())?;
        // Safety: destination range is inside the mapping and does not overlap `src`
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.inner.base.add(range.start), src.len());
        }
        Ok(())
    }

    /// Set `count` samples at `offset` to `word`
    pub fn fill(&self, offset: usize, count: usize, word: u16) -> Result<()> {
        let range = self.check(offset, count * SAMPLE_SIZE)?;
        let base = self.inner.base;
        for i in 0..count {
            // Safety: every write lands inside the checked range
            unsafe {
                ptr::write_volatile(base.add(range.start + i * SAMPLE_SIZE) as *mut u16, word);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Samples<'a> {
    Signed(&'a [i16]),
    Unsigned(&'a [u16]),
}

/// Read-only view of one phase slice of one bank
#[derive(Clone, Copy, Debug)]
pub struct PhaseBuffer<'a> {
    samples: Samples<'a>,
    address: u64,
}

impl<'a> PhaseBuffer<'a> {
    pub fn from_bytes(bytes: &'a [u8], polarity: AdcPolarity, address: u64) -> Result<Self> {
        let samples = match polarity {
            AdcPolarity::Signed => Samples::Signed(
                bytes
                    .as_slice_of::<i16>()
                    .map_err(|e| Error::Misaligned(e.to_string()))?,
            ),
            AdcPolarity::Unsigned => Samples::Unsigned(
                bytes
                    .as_slice_of::<u16>()
                    .map_err(|e| Error::Misaligned(e.to_string()))?,
            ),
        };
        Ok(Self { samples, address })
    }

    pub fn signed(samples: &'a [i16], address: u64) -> Self {
        Self {
            samples: Samples::Signed(samples),
            address,
        }
    }

    pub fn unsigned(samples: &'a [u16], address: u64) -> Self {
        Self {
            samples: Samples::Unsigned(samples),
            address,
        }
    }

    pub fn len(&self) -> usize {
        match self.samples {
            Samples::Signed(s) => s.len(),
            Samples::Unsigned(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn polarity(&self) -> AdcPolarity {
        match self.samples {
            Samples::Signed(_) => AdcPolarity::Signed,
            Samples::Unsigned(_) => AdcPolarity::Unsigned,
        }
    }

    /// Bus address of the first sample
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Raw sample value at `idx`
    #[inline]
    pub fn get(&self, idx: usize) -> Option<i32> {
        match self.samples {
            Samples::Signed(s) => s.get(idx).map(|&v| v as i32),
            Samples::Unsigned(s) => s.get(idx).map(|&v| v as i32),
        }
    }

    /// Raw sample word at `idx`, as stored in memory
    pub fn word(&self, idx: usize) -> Option<u16> {
        match self.samples {
            Samples::Signed(s) => s.get(idx).map(|&v| v as u16),
            Samples::Unsigned(s) => s.get(idx).copied(),
        }
    }

    pub fn iter(&self) -> Iter<'a> {
        Iter {
            buf: *self,
            pos: 0,
        }
    }

    /// Sub-view over `range`, clamped to the buffer
    pub fn window(&self, range: Range<usize>) -> PhaseBuffer<'a> {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        let samples = match self.samples {
            Samples::Signed(s) => Samples::Signed(&s[start..end]),
            Samples::Unsigned(s) => Samples::Unsigned(&s[start..end]),
        };
        PhaseBuffer {
            samples,
            address: self.address + (start * SAMPLE_SIZE) as u64,
        }
    }

    /// The underlying bytes, for export
    pub fn as_bytes(&self) -> &'a [u8] {
        match self.samples {
            Samples::Signed(s) => s.as_byte_slice(),
            Samples::Unsigned(s) => s.as_byte_slice(),
        }
    }
}

pub struct Iter<'a> {
    buf: PhaseBuffer<'a>,
    pos: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        let v = self.buf.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.buf.len() - self.pos;
        (rem, Some(rem))
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_view() {
        let region = CaptureRegion::anonymous(4096, 0x1000_0000).unwrap();
        let words: Vec<u16> = [1i16, -2, 300, -32768].iter().map(|&v| v as u16).collect();
        region.write_samples(64, &words).unwrap();

        let buf = region.phase_buffer(64, 4, AdcPolarity::Signed).unwrap();
        assert_eq!(buf.iter().collect::<Vec<_>>(), vec![1, -2, 300, -32768]);
        assert_eq!(buf.address(), 0x1000_0040);

        let unsigned = region.phase_buffer(64, 4, AdcPolarity::Unsigned).unwrap();
        assert_eq!(unsigned.get(1), Some(65534));
        assert_eq!(unsigned.get(4), None);
    }

    #[test]
    fn reads_past_the_end_are_rejected() {
        let region = CaptureRegion::anonymous(4096, 0).unwrap();
        assert!(matches!(
            region.bytes(4000, 200),
            Err(Error::OutOfBounds { end: 4200, .. })
        ));
        assert!(region.phase_buffer(3, 2, AdcPolarity::Signed).is_err());
        assert!(region.write_samples(4094, &[0, 0]).is_err());
    }

    #[test]
    fn fill_sets_every_word() {
        let region = CaptureRegion::anonymous(4096, 0).unwrap();
        region.fill(0, 16, 0xdead).unwrap();
        let buf = region.phase_buffer(0, 17, AdcPolarity::Unsigned).unwrap();
        assert!((0..16).all(|i| buf.word(i) == Some(0xdead)));
        assert_eq!(buf.word(16), Some(0));
    }

    #[test]
    fn window_clamps_and_tracks_address() {
        let data = [5i16, 6, 7, 8, 9];
        let buf = PhaseBuffer::signed(&data, 0x100);
        let w = buf.window(2..10);
        assert_eq!(w.len(), 3);
        assert_eq!(w.get(0), Some(7));
        assert_eq!(w.address(), 0x104);
        assert!(buf.window(8..9).is_empty());
    }
}
