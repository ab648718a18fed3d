//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Wraps the vendor VISA runtime through `visa-rs`. VISA calls are blocking,
//! so every operation runs on Tokio's blocking pool with the session behind an
//! `Arc<Mutex<_>>`.
//!
//! Supports resource strings like:
//! - "GPIB0::6::INSTR" (GPIB interface)
//! - "USB0::0x0957::0x179B::MY51250123::INSTR" (USBTMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! Without the `instrument_visa` feature the adapter can still be built and
//! configured, but [`VisaAdapter::connect`] returns
//! [`CalError::FeatureNotEnabled`].

use super::Transport;
use crate::error::{AppResult, CalError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// VISA session bound to one instrument.
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::6::INSTR")
    pub(crate) resource_name: String,

    /// Read/write timeout
    pub(crate) timeout: Duration,

    /// Terminator appended to every command
    pub(crate) write_terminator: String,

    /// Characters stripped from the end of every reply
    pub(crate) read_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<Instrument>>>,
}

impl VisaAdapter {
    /// Create a new, unconnected adapter with default settings
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            timeout: Duration::from_secs(5),
            write_terminator: "\n".to_string(),
            read_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the command terminator
    pub fn with_write_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }

    /// Set the reply terminator
    pub fn with_read_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.read_terminator = terminator.into();
        self
    }

    /// Human-readable description for logs.
    pub fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_name,
            self.timeout.as_millis()
        )
    }

    fn trim_reply(&self, reply: &str) -> String {
        let trimmed = reply.trim_end_matches(|c: char| self.read_terminator.contains(c) || c == '\r');
        trimmed.trim().to_string()
    }

    /// Open the VISA session.
    #[cfg(feature = "instrument_visa")]
    pub async fn connect(mut self) -> AppResult<Self> {
        let resource = self.resource_name.clone();
        let instrument = tokio::task::spawn_blocking(move || -> AppResult<Instrument> {
            let rm = DefaultRM::new().map_err(|e| CalError::transport(&resource, e.to_string()))?;
            let c_string = std::ffi::CString::new(resource.as_str())
                .map_err(|e| CalError::InvalidArgument(e.to_string()))?;
            let visa_string = visa_rs::VisaString::from(c_string);
            rm.open(&visa_string.into(), AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| CalError::transport(&resource, format!("open failed: {}", e)))
        })
        .await
        .map_err(|e| CalError::transport(&self.resource_name, format!("VISA open task panicked: {}", e)))??;

        self.instrument = Some(Arc::new(Mutex::new(instrument)));
        debug!("{} opened", self.info());
        Ok(self)
    }

    /// Open the VISA session.
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn connect(self) -> AppResult<Self> {
        Err(CalError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&self) -> AppResult<Arc<Mutex<Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| CalError::NotConnected(self.resource_name.clone()))
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Transport for VisaAdapter {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        use std::io::Write;

        let session = self.session()?;
        let resource = self.resource_name.clone();
        let payload = format!("{}{}", command, self.write_terminator);
        tokio::task::spawn_blocking(move || {
            let instr = session.blocking_lock();
            (&*instr)
                .write_all(payload.as_bytes())
                .map_err(|e| CalError::transport(&resource, e.to_string()))
        })
        .await
        .map_err(|e| CalError::transport(&self.resource_name, e.to_string()))??;

        debug!(resource = %self.resource_name, "VISA write: {}", command);
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        use std::io::{BufRead, BufReader};

        let session = self.session()?;
        let resource = self.resource_name.clone();
        let raw = tokio::task::spawn_blocking(move || {
            let instr = session.blocking_lock();
            let mut reader = BufReader::new(&*instr);
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .map_err(|e| CalError::transport(&resource, e.to_string()))?;
            Ok::<_, CalError>(line)
        })
        .await
        .map_err(|e| CalError::transport(&self.resource_name, e.to_string()))??;

        let reply = self.trim_reply(&raw);
        debug!(resource = %self.resource_name, "VISA read: {}", reply);
        Ok(reply)
    }

    async fn read_bytes(&mut self, count: usize) -> AppResult<Vec<u8>> {
        use std::io::Read;

        let session = self.session()?;
        let resource = self.resource_name.clone();
        tokio::task::spawn_blocking(move || {
            let instr = session.blocking_lock();
            let mut buf = vec![0u8; count];
            (&*instr)
                .read_exact(&mut buf)
                .map_err(|e| CalError::transport(&resource, e.to_string()))?;
            Ok::<_, CalError>(buf)
        })
        .await
        .map_err(|e| CalError::transport(&self.resource_name, e.to_string()))?
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.instrument.take().is_some() {
            debug!("VISA resource '{}' closed", self.resource_name);
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl Transport for VisaAdapter {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    async fn write(&mut self, _command: &str) -> AppResult<()> {
        Err(CalError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn read(&mut self) -> AppResult<String> {
        Err(CalError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn read_bytes(&mut self, _count: usize) -> AppResult<Vec<u8>> {
        Err(CalError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> AppResult<()> {
        debug!("{} closed (VISA disabled)", self.info());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_builder() {
        let adapter = VisaAdapter::new("USB0::0x0957::0x179B::MY51250123::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_write_terminator("\r\n")
            .with_read_terminator("\r\n");

        assert_eq!(adapter.timeout, Duration::from_millis(2000));
        assert_eq!(adapter.write_terminator, "\r\n");
        assert_eq!(adapter.read_terminator, "\r\n");
    }

    #[test]
    fn test_info_string() {
        let adapter = VisaAdapter::new("GPIB0::6::INSTR").with_timeout(Duration::from_millis(3000));
        let info = adapter.info();
        assert!(info.contains("GPIB0::6::INSTR"));
        assert!(info.contains("3000ms"));
    }

    #[test]
    fn test_reply_trimming() {
        let adapter = VisaAdapter::new("GPIB0::6::INSTR");
        assert_eq!(adapter.trim_reply("+1.234E-3\n"), "+1.234E-3");
        assert_eq!(adapter.trim_reply("FLUKE,5730A,123,1.0\r\n"), "FLUKE,5730A,123,1.0");
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_connect_without_feature() {
        let result = VisaAdapter::new("GPIB0::6::INSTR").connect().await;
        assert!(matches!(result, Err(CalError::FeatureNotEnabled(_))));
    }
}
