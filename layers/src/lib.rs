//! Upper PHY Slot Processing Library
//! 
//! This crate implements the slot-pipelined buffer pools and task dispatch
//! that sit between the scheduler and the 5G NR channel processing kernels.

pub mod phy;

use thiserror::Error;

/// Common errors for the upper PHY layer
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
}
