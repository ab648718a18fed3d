//! Bench instrument drivers
//!
//! Every driver owns a [`ScpiSession`](session::ScpiSession), which wraps a
//! transport with the retry and logging rules shared by all instruments:
//! - `scope`: the oscilloscope under test (Keysight, Tektronix, R&S)
//! - `calibrator`: Fluke 5700A family and Meatest M-142 DC sources
//! - `function_generator`, `rf_generator`, `dmm`: the remaining references

pub mod calibrator;
pub mod dmm;
pub mod function_generator;
pub mod identity;
pub mod rf_generator;
pub mod scope;
pub mod session;

pub use calibrator::{open_calibrator, Calibrator};
pub use dmm::{DmmFunction, Ks3458A, ReadingStats};
pub use function_generator::Ks33250A;
pub use identity::{Identity, Manufacturer};
pub use rf_generator::RfSignalGenerator;
pub use scope::{load_uut_driver, Oscilloscope};
pub use session::ScpiSession;
