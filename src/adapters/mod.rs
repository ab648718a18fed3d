//! Transport adapters
//!
//! Instrument drivers never talk to VISA directly. They hold a
//! [`Transport`] which is either a [`VisaAdapter`] (real hardware, behind the
//! `instrument_visa` feature) or a [`SimulatedTransport`] (bench-free runs and
//! tests).

pub mod resource;
pub mod simulated;
pub mod visa_adapter;

pub use resource::{gpib_resource, list_resources, ResourceAddress};
pub use simulated::SimulatedTransport;
pub use visa_adapter::VisaAdapter;

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

/// Byte-level message channel to a single instrument.
///
/// Implementations append and strip message terminators themselves; callers
/// pass bare SCPI strings and receive trimmed replies.
#[async_trait]
pub trait Transport: Send + Sync {
    /// VISA resource string this transport is bound to.
    fn resource_name(&self) -> &str;

    /// Send a command without waiting for a reply.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Read one terminated reply.
    async fn read(&mut self) -> AppResult<String>;

    /// Read exactly `count` raw bytes (binary block transfers).
    async fn read_bytes(&mut self, count: usize) -> AppResult<Vec<u8>>;

    /// Write `command` then read its reply.
    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command).await?;
        self.read().await
    }

    /// Current I/O timeout.
    fn timeout(&self) -> Duration;

    /// Change the I/O timeout for subsequent operations.
    fn set_timeout(&mut self, timeout: Duration);

    /// Return the instrument to front-panel control.
    ///
    /// Only meaningful on GPIB; other buses ignore it.
    async fn go_to_local(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Release the underlying session.
    async fn close(&mut self) -> AppResult<()>;
}

/// Open a VISA transport for `resource`.
///
/// Fails with [`crate::error::CalError::FeatureNotEnabled`] unless the crate
/// is built with `instrument_visa`. Simulated runs use [`crate::simulation`].
pub async fn open_transport(
    resource: &str,
    timeout: Duration,
) -> AppResult<Box<dyn Transport>> {
    let adapter = VisaAdapter::new(resource).with_timeout(timeout).connect().await?;
    Ok(Box::new(adapter))
}
