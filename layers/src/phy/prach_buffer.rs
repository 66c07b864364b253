//! PRACH Buffer Pool
//!
//! Frequency-domain PRACH samples for one PRACH window, per antenna port,
//! time/frequency occasion and preamble symbol (3GPP TS 38.211 Section 6.3.3).

use crate::LayerError;
use common::types::SlotPoint;
use num_complex::Complex32;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::debug;

/// PRACH constants according to 3GPP
pub mod constants {
    /// Long sequence length (for formats 0-3)
    pub const LONG_SEQUENCE_LENGTH: usize = 839;
    /// Short sequence length (for formats A1-C2)
    pub const SHORT_SEQUENCE_LENGTH: usize = 139;
    /// Maximum number of symbols of a long preamble (formats 2 and 3)
    pub const MAX_NOF_LONG_SYMBOLS: usize = 4;
    /// Maximum number of symbols of a short preamble (format B4)
    pub const MAX_NOF_SHORT_SYMBOLS: usize = 12;
}

/// PRACH buffer dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrachBufferDimensions {
    pub nof_ports: usize,
    pub nof_td_occasions: usize,
    pub nof_fd_occasions: usize,
    pub nof_symbols: usize,
    pub sequence_length: usize,
}

impl PrachBufferDimensions {
    /// Buffer able to hold any long preamble format
    pub fn long(nof_ports: usize) -> Self {
        Self {
            nof_ports,
            nof_td_occasions: 1,
            nof_fd_occasions: 1,
            nof_symbols: constants::MAX_NOF_LONG_SYMBOLS,
            sequence_length: constants::LONG_SEQUENCE_LENGTH,
        }
    }

    /// Buffer able to hold any short preamble format
    pub fn short(nof_ports: usize, nof_td_occasions: usize, nof_fd_occasions: usize) -> Self {
        Self {
            nof_ports,
            nof_td_occasions,
            nof_fd_occasions,
            nof_symbols: constants::MAX_NOF_SHORT_SYMBOLS,
            sequence_length: constants::SHORT_SEQUENCE_LENGTH,
        }
    }

    fn len(&self) -> usize {
        self.nof_ports * self.nof_td_occasions * self.nof_fd_occasions * self.nof_symbols * self.sequence_length
    }
}

/// PRACH sample buffer
#[derive(Debug, Clone)]
pub struct PrachBuffer {
    dims: PrachBufferDimensions,
    samples: Vec<Complex32>,
}

impl PrachBuffer {
    pub fn new(dims: PrachBufferDimensions) -> Result<Self, LayerError> {
        if dims.len() == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "PRACH buffer dimensions must be non-zero: {:?}",
                dims
            )));
        }
        Ok(Self {
            dims,
            samples: vec![Complex32::new(0.0, 0.0); dims.len()],
        })
    }

    pub fn dimensions(&self) -> PrachBufferDimensions {
        self.dims
    }

    fn offset(&self, port: usize, td_occasion: usize, fd_occasion: usize, symbol: usize) -> usize {
        let d = &self.dims;
        assert!(
            port < d.nof_ports
                && td_occasion < d.nof_td_occasions
                && fd_occasion < d.nof_fd_occasions
                && symbol < d.nof_symbols,
            "PRACH buffer index out of range: port={} td={} fd={} symbol={} ({:?})",
            port,
            td_occasion,
            fd_occasion,
            symbol,
            d
        );
        (((port * d.nof_td_occasions + td_occasion) * d.nof_fd_occasions + fd_occasion) * d.nof_symbols + symbol)
            * d.sequence_length
    }

    /// Samples of one preamble symbol
    pub fn symbol(&self, port: usize, td_occasion: usize, fd_occasion: usize, symbol: usize) -> &[Complex32] {
        let start = self.offset(port, td_occasion, fd_occasion, symbol);
        &self.samples[start..start + self.dims.sequence_length]
    }

    /// Mutable samples of one preamble symbol
    pub fn symbol_mut(&mut self, port: usize, td_occasion: usize, fd_occasion: usize, symbol: usize) -> &mut [Complex32] {
        let start = self.offset(port, td_occasion, fd_occasion, symbol);
        let len = self.dims.sequence_length;
        &mut self.samples[start..start + len]
    }
}

/// Handle onto one pooled PRACH buffer
#[derive(Clone)]
pub struct SharedPrachBuffer {
    id: usize,
    buffer: Arc<Mutex<PrachBuffer>>,
}

impl SharedPrachBuffer {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, PrachBuffer> {
        self.buffer.lock()
    }
}

/// Cyclic pool of PRACH buffers selected by slot
pub struct PrachBufferPool {
    buffers: Vec<Arc<Mutex<PrachBuffer>>>,
}

impl PrachBufferPool {
    pub fn new(nof_buffers: usize, dims: PrachBufferDimensions) -> Result<Self, LayerError> {
        if nof_buffers == 0 {
            return Err(LayerError::InvalidConfiguration(
                "PRACH buffer pool needs at least one buffer".to_string(),
            ));
        }
        let buffers = (0..nof_buffers)
            .map(|_| PrachBuffer::new(dims).map(|b| Arc::new(Mutex::new(b))))
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Allocated {} PRACH buffers ({:?})", nof_buffers, dims);
        Ok(Self { buffers })
    }

    pub fn nof_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Get the buffer for the PRACH window starting at `slot`
    pub fn get_prach_buffer(&self, slot: SlotPoint) -> SharedPrachBuffer {
        let id = slot.cycle_index(self.buffers.len());
        let buffer = &self.buffers[id];
        assert!(
            Arc::strong_count(buffer) == 1,
            "PRACH buffer {} requested for slot {} is still in use",
            id,
            slot
        );
        SharedPrachBuffer {
            id,
            buffer: buffer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prach_buffer_layout() {
        let mut buffer = PrachBuffer::new(PrachBufferDimensions::short(2, 2, 1)).unwrap();
        assert_eq!(buffer.symbol(0, 0, 0, 0).len(), constants::SHORT_SEQUENCE_LENGTH);

        buffer.symbol_mut(1, 1, 0, 11)[138] = Complex32::new(1.0, 2.0);
        assert_eq!(buffer.symbol(1, 1, 0, 11)[138], Complex32::new(1.0, 2.0));
        assert_eq!(buffer.symbol(1, 1, 0, 10)[138], Complex32::new(0.0, 0.0));
        assert_eq!(buffer.symbol(0, 1, 0, 11)[138], Complex32::new(0.0, 0.0));
    }

    #[test]
    #[should_panic(expected = "PRACH buffer index out of range")]
    fn test_prach_buffer_port_out_of_range() {
        let buffer = PrachBuffer::new(PrachBufferDimensions::long(1)).unwrap();
        let _ = buffer.symbol(1, 0, 0, 0);
    }

    #[test]
    fn test_pool_is_cyclic() {
        let pool = PrachBufferPool::new(4, PrachBufferDimensions::long(1)).unwrap();
        let first = pool.get_prach_buffer(SlotPoint::from_system_slot(0, 1));
        let first_id = first.id();
        drop(first);

        let again = pool.get_prach_buffer(SlotPoint::from_system_slot(0, 5));
        assert_eq!(again.id(), first_id);

        // Last slot of the SFN period and the one after it
        let last = SlotPoint::from_system_slot(0, 10_239);
        assert_eq!(pool.get_prach_buffer(last).id(), 3);
        assert_eq!(pool.get_prach_buffer(last + 1).id(), 0);
    }

    #[test]
    #[should_panic(expected = "does not divide the SFN period")]
    fn test_pool_size_must_divide_sfn_period() {
        let pool = PrachBufferPool::new(3, PrachBufferDimensions::long(1)).unwrap();
        let _ = pool.get_prach_buffer(SlotPoint::from_system_slot(0, 1));
    }

    #[test]
    #[should_panic(expected = "is still in use")]
    fn test_pool_rejects_borrowed_buffer() {
        let pool = PrachBufferPool::new(2, PrachBufferDimensions::long(1)).unwrap();
        let _held = pool.get_prach_buffer(SlotPoint::from_system_slot(0, 0));
        let _again = pool.get_prach_buffer(SlotPoint::from_system_slot(0, 2));
    }
}
