//! Resource Grid for 5G NR
//!
//! Time-frequency buffer of one slot for every antenna port, according to
//! 3GPP TS 38.211 Section 4.4.4

use crate::LayerError;
use num_complex::Complex32;
use ndarray::{Array2, ArrayView1};
use tracing::trace;

/// Number of subcarriers per resource block
pub const NRE: usize = 12;

/// Number of OFDM symbols per slot for normal cyclic prefix
pub const NSYMB_PER_SLOT_NORM: usize = 14;

/// Resource grid dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceGridDimensions {
    /// Number of antenna ports
    pub nof_ports: usize,
    /// Number of OFDM symbols
    pub nof_symbols: usize,
    /// Number of subcarriers
    pub nof_subc: usize,
}

impl ResourceGridDimensions {
    /// Dimensions of a normal cyclic prefix slot spanning `nof_prb` resource blocks
    pub fn with_prb(nof_ports: usize, nof_prb: usize) -> Self {
        Self {
            nof_ports,
            nof_symbols: NSYMB_PER_SLOT_NORM,
            nof_subc: nof_prb * NRE,
        }
    }

    /// Number of resource elements in one port
    pub fn nof_re_per_port(&self) -> usize {
        self.nof_symbols * self.nof_subc
    }
}

/// Resource grid for one slot and one sector
#[derive(Debug, Clone)]
pub struct ResourceGrid {
    dims: ResourceGridDimensions,
    /// One [symbol, subcarrier] plane per port
    ports: Vec<Array2<Complex32>>,
    /// Set while the port is known to contain only zeros
    empty: Vec<bool>,
}

impl ResourceGrid {
    /// Create a new zeroed resource grid
    pub fn new(dims: ResourceGridDimensions) -> Result<Self, LayerError> {
        if dims.nof_ports == 0 || dims.nof_symbols == 0 || dims.nof_subc == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Resource grid dimensions must be non-zero: {:?}",
                dims
            )));
        }

        let ports = (0..dims.nof_ports)
            .map(|_| Array2::zeros((dims.nof_symbols, dims.nof_subc)))
            .collect();

        Ok(Self {
            dims,
            ports,
            empty: vec![true; dims.nof_ports],
        })
    }

    /// Grid dimensions
    pub fn dimensions(&self) -> ResourceGridDimensions {
        self.dims
    }

    pub fn nof_ports(&self) -> usize {
        self.dims.nof_ports
    }

    pub fn nof_symbols(&self) -> usize {
        self.dims.nof_symbols
    }

    pub fn nof_subc(&self) -> usize {
        self.dims.nof_subc
    }

    fn check_port(&self, port: usize) {
        assert!(
            port < self.dims.nof_ports,
            "port index {} out of range (nof_ports={})",
            port,
            self.dims.nof_ports
        );
    }

    fn check_re(&self, symbol: usize, subcarrier: usize, len: usize) -> Result<(), LayerError> {
        let end = subcarrier.checked_add(len);
        if symbol >= self.dims.nof_symbols || end.map_or(true, |end| end > self.dims.nof_subc) {
            return Err(LayerError::OutOfBounds(format!(
                "RE out of bounds: symbol={}, subcarriers={}..{} (grid {}x{})",
                symbol,
                subcarrier,
                subcarrier.saturating_add(len),
                self.dims.nof_symbols,
                self.dims.nof_subc
            )));
        }
        Ok(())
    }

    /// Set every resource element of every port to zero.
    ///
    /// Ports that are already empty are skipped.
    pub fn set_all_zero(&mut self) {
        for (port, plane) in self.ports.iter_mut().enumerate() {
            if self.empty[port] {
                continue;
            }
            plane.fill(Complex32::new(0.0, 0.0));
            self.empty[port] = true;
        }
        trace!("Resource grid zeroed");
    }

    /// Whether the port has not been written since it was last zeroed
    pub fn is_empty(&self, port: usize) -> bool {
        self.check_port(port);
        self.empty[port]
    }

    /// Check every element of every port, regardless of the empty flags
    pub fn is_all_zero(&self) -> bool {
        self.ports
            .iter()
            .all(|plane| plane.iter().all(|re| re.re == 0.0 && re.im == 0.0))
    }

    /// Write a single resource element
    pub fn put(&mut self, port: usize, symbol: usize, subcarrier: usize, value: Complex32) -> Result<(), LayerError> {
        self.check_port(port);
        self.check_re(symbol, subcarrier, 1)?;

        self.ports[port][(symbol, subcarrier)] = value;
        self.empty[port] = false;
        Ok(())
    }

    /// Write consecutive resource elements of one symbol starting at `start_subc`
    pub fn put_symbols(&mut self, port: usize, symbol: usize, start_subc: usize, values: &[Complex32]) -> Result<(), LayerError> {
        self.check_port(port);
        self.check_re(symbol, start_subc, values.len())?;

        let mut row = self.ports[port].row_mut(symbol);
        for (i, &value) in values.iter().enumerate() {
            row[start_subc + i] = value;
        }
        self.empty[port] = false;
        Ok(())
    }

    /// Write one resource block of one symbol
    pub fn put_rb(&mut self, port: usize, symbol: usize, rb_index: usize, values: &[Complex32; NRE]) -> Result<(), LayerError> {
        self.put_symbols(port, symbol, rb_index.saturating_mul(NRE), values)
    }

    /// Read a single resource element
    pub fn get(&self, port: usize, symbol: usize, subcarrier: usize) -> Option<Complex32> {
        self.check_port(port);
        if symbol >= self.dims.nof_symbols || subcarrier >= self.dims.nof_subc {
            return None;
        }
        Some(self.ports[port][(symbol, subcarrier)])
    }

    /// View of one OFDM symbol (no copy)
    pub fn symbol(&self, port: usize, symbol: usize) -> Option<ArrayView1<'_, Complex32>> {
        self.check_port(port);
        if symbol >= self.dims.nof_symbols {
            return None;
        }
        Some(self.ports[port].row(symbol))
    }

    /// Clear a specific symbol of one port
    pub fn clear_symbol(&mut self, port: usize, symbol: usize) -> Result<(), LayerError> {
        self.check_port(port);
        self.check_re(symbol, 0, 0)?;

        self.ports[port].row_mut(symbol).fill(Complex32::new(0.0, 0.0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> ResourceGrid {
        ResourceGrid::new(ResourceGridDimensions::with_prb(2, 52)).unwrap()
    }

    #[test]
    fn test_resource_grid_creation() {
        let grid = grid();

        assert_eq!(grid.nof_ports(), 2);
        assert_eq!(grid.nof_symbols(), 14);
        assert_eq!(grid.nof_subc(), 52 * 12);
        assert!(grid.is_empty(0));
        assert!(grid.is_empty(1));
        assert!(grid.is_all_zero());
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let dims = ResourceGridDimensions { nof_ports: 1, nof_symbols: 14, nof_subc: 0 };
        assert!(matches!(ResourceGrid::new(dims), Err(LayerError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_resource_element_mapping() {
        let mut grid = grid();

        let value = Complex32::new(1.0, -1.0);
        grid.put(1, 3, 100, value).unwrap();

        assert_eq!(grid.get(1, 3, 100), Some(value));
        assert_eq!(grid.get(0, 3, 100), Some(Complex32::new(0.0, 0.0)));
        assert!(grid.is_empty(0));
        assert!(!grid.is_empty(1));
        assert!(grid.put(0, 14, 0, value).is_err());
        assert!(grid.put(0, 0, 52 * 12, value).is_err());
    }

    #[test]
    fn test_rb_mapping() {
        let mut grid = grid();

        let values = [Complex32::new(1.0, 0.0); NRE];
        grid.put_rb(0, 0, 2, &values).unwrap();

        for sc in 24..36 {
            assert_eq!(grid.get(0, 0, sc), Some(Complex32::new(1.0, 0.0)));
        }
        assert_eq!(grid.get(0, 0, 23), Some(Complex32::new(0.0, 0.0)));
        assert!(grid.put_rb(0, 0, 52, &values).is_err());
    }

    #[test]
    fn test_out_of_range_start_is_rejected() {
        let mut grid = grid();

        let values = [Complex32::new(1.0, 0.0); NRE];
        assert!(matches!(grid.put_symbols(0, 0, usize::MAX, &values), Err(LayerError::OutOfBounds(_))));
        assert!(matches!(grid.put_symbols(0, 0, usize::MAX - 5, &values), Err(LayerError::OutOfBounds(_))));
        assert!(grid.put_rb(0, 0, usize::MAX / 4, &values).is_err());
        assert!(grid.is_empty(0));
    }

    #[test]
    fn test_set_all_zero() {
        let mut grid = grid();
        grid.put_symbols(0, 5, 10, &[Complex32::new(0.5, 0.5); 4]).unwrap();
        grid.put(1, 13, 0, Complex32::new(2.0, 0.0)).unwrap();
        assert!(!grid.is_all_zero());

        grid.set_all_zero();

        assert!(grid.is_all_zero());
        assert!(grid.is_empty(0));
        assert!(grid.is_empty(1));
    }

    #[test]
    fn test_clear_symbol() {
        let mut grid = grid();
        grid.put_symbols(0, 2, 0, &[Complex32::new(1.0, 1.0); 24]).unwrap();
        grid.put(0, 3, 0, Complex32::new(1.0, 1.0)).unwrap();

        grid.clear_symbol(0, 2).unwrap();

        let symbol = grid.symbol(0, 2).unwrap();
        assert!(symbol.iter().all(|re| *re == Complex32::new(0.0, 0.0)));
        assert_eq!(grid.get(0, 3, 0), Some(Complex32::new(1.0, 1.0)));
    }

    #[test]
    #[should_panic(expected = "port index 2 out of range")]
    fn test_port_out_of_range_is_fatal() {
        let grid = grid();
        let _ = grid.is_empty(2);
    }
}
