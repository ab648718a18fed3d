//! Core library for scope_cal.
//!
//! Automates calibration and verification of bench oscilloscopes. A results
//! workbook lists the tests to run, one per row; the sequencer drives a DC
//! calibrator, a pulse generator, an RF generator and a 3458A multimeter
//! against the oscilloscope under test and writes each measured value back
//! into the workbook.
//!
//! - [`adapters`]: VISA and simulated transports
//! - [`instrument`]: drivers for the UUT and the reference instruments
//! - [`workbook`]: results workbook access
//! - [`sequencer`]: the test procedures and run bookkeeping
//! - [`simulation`]: a simulated bench for dry runs and tests

pub mod adapters;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod operator;
pub mod sequencer;
pub mod simulation;
pub mod workbook;
