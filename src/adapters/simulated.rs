//! Simulated transport for bench-free runs and tests
//!
//! This adapter stands in for a VISA session. It provides:
//! - A responder closure mapping each query to a reply
//! - Scripted replies that take precedence over the responder
//! - Controllable failure injection
//! - Call logging for test verification

use super::Transport;
use crate::error::{AppResult, CalError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Maps a command to the reply the simulated instrument would send.
///
/// Called for every command written. Replies to commands without a `?` are
/// discarded, so a responder can also track settings it is sent. Returning
/// `None` to a query simulates an instrument that never answers.
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct SimState {
    pending: VecDeque<String>,
    scripted: VecDeque<String>,
    raw: VecDeque<Vec<u8>>,
    last_write: String,
    call_log: Vec<String>,
}

/// Simulated instrument session
///
/// Clones share state, so a test can keep one handle for inspection while the
/// driver owns another.
///
/// # Example
///
/// ```
/// use scope_cal::adapters::SimulatedTransport;
///
/// let sim = SimulatedTransport::new("GPIB0::7::INSTR")
///     .with_responder(|cmd| (cmd == "*IDN?").then(|| "SIM,SCOPE,0,1".to_string()));
/// assert!(sim.call_log().is_empty());
/// ```
#[derive(Clone)]
pub struct SimulatedTransport {
    resource: String,
    timeout: Duration,
    latency: Duration,
    responder: Responder,
    failures: Arc<AtomicU32>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    /// Create a simulated session that answers every query with `0`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Duration::from_secs(5),
            latency: Duration::ZERO,
            responder: Arc::new(|_| Some("0".to_string())),
            failures: Arc::new(AtomicU32::new(0)),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Replace the responder.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Set simulated latency per operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a reply returned by the next read, ahead of the responder.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.state().scripted.push_back(reply.into());
    }

    /// Queue a raw block returned by the next `read_bytes`.
    pub fn push_bytes(&self, bytes: Vec<u8>) {
        self.state().raw.push_back(bytes);
    }

    /// Make the next `count` operations fail with a transport error.
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.state().call_log.clone()
    }

    /// Commands written so far, queries included.
    pub fn written(&self) -> Vec<String> {
        self.state()
            .call_log
            .iter()
            .filter_map(|entry| entry.strip_prefix("write ").map(str::to_string))
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.state().call_log.clear();
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A poisoned lock only means a test panicked mid-call; the state is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_failure(&self) -> AppResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(CalError::transport(&self.resource, "Injected failure"))
        } else {
            Ok(())
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn resource_name(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.simulate_latency().await;
        self.check_failure()?;
        trace!(resource = %self.resource, "sim write {}", command);

        let reply = (self.responder)(command).filter(|_| command.contains('?'));
        let mut state = self.state();
        state.call_log.push(format!("write {}", command));
        state.last_write = command.to_string();
        if let Some(reply) = reply {
            state.pending.push_back(reply);
        }
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        self.simulate_latency().await;
        self.check_failure()?;

        let mut state = self.state();
        state.call_log.push("read".to_string());
        if let Some(reply) = state.scripted.pop_front() {
            state.pending.pop_front();
            return Ok(reply);
        }
        if let Some(reply) = state.pending.pop_front() {
            return Ok(reply);
        }
        // Triggered readings (e.g. a DMM after TARM SGL) answer the last command.
        let last = state.last_write.clone();
        drop(state);
        (self.responder)(&last)
            .ok_or_else(|| CalError::transport(&self.resource, "VI_ERROR_TMO (simulated)"))
    }

    async fn read_bytes(&mut self, count: usize) -> AppResult<Vec<u8>> {
        self.simulate_latency().await;
        self.check_failure()?;

        let mut state = self.state();
        state.call_log.push(format!("read_bytes {}", count));
        let mut bytes = state.raw.pop_front().unwrap_or_default();
        bytes.resize(count, 0);
        Ok(bytes)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn go_to_local(&mut self) -> AppResult<()> {
        self.state().call_log.push("local".to_string());
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.state().call_log.push("close".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idn_sim() -> SimulatedTransport {
        SimulatedTransport::new("GPIB0::7::INSTR").with_responder(|cmd| match cmd {
            "*IDN?" => Some("KEYSIGHT TECHNOLOGIES,DSOX3034T,MY58490123,07.50".to_string()),
            "TER?" => Some("+1".to_string()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_query_uses_responder() {
        let mut sim = idn_sim();
        let reply = sim.query("*IDN?").await.unwrap();
        assert!(reply.starts_with("KEYSIGHT"));
        assert_eq!(sim.call_log(), vec!["write *IDN?", "read"]);
    }

    #[tokio::test]
    async fn test_unanswered_query_times_out() {
        let mut sim = idn_sim();
        let err = sim.query("SYST:ERR?").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_scripted_reply_takes_precedence() {
        let mut sim = idn_sim();
        sim.push_reply("+0");
        assert_eq!(sim.query("TER?").await.unwrap(), "+0");
        assert_eq!(sim.query("TER?").await.unwrap(), "+1");
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let mut sim = idn_sim();
        sim.inject_failures(1);
        assert!(sim.write("*CLS").await.is_err());
        assert!(sim.write("*CLS").await.is_ok());
        assert_eq!(sim.written(), vec!["*CLS"]);
    }

    #[tokio::test]
    async fn test_clones_share_log() {
        let sim = idn_sim();
        let mut driver_side = sim.clone();
        driver_side.write("*RST").await.unwrap();
        driver_side.go_to_local().await.unwrap();
        assert_eq!(sim.call_log(), vec!["write *RST", "local"]);
    }

    #[tokio::test]
    async fn test_read_bytes_pads_to_requested_length() {
        let mut sim = idn_sim();
        sim.push_bytes(vec![0x01, 0x02]);
        let bytes = sim.read_bytes(4).await.unwrap();
        assert_eq!(bytes, vec![0x01, 0x02, 0x00, 0x00]);
    }
}
