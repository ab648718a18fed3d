//! Retry-wrapped SCPI session shared by every driver.
//!
//! All drivers follow the same rules when talking to hardware:
//! - every write, read and query is retried on transport failure
//!   ([`RetryPolicy`], three attempts, one second apart);
//! - numeric queries that return garbage read as `0.0` and log a warning;
//! - settling delays are skipped entirely when the session is simulated.

use super::identity::Identity;
use crate::adapters::Transport;
use crate::error::{AppResult, CalError};
use crate::error_recovery::{retry_with, RetryPolicy};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout used for `*IDN?`, which some instruments answer slowly after reset.
pub const IDN_TIMEOUT: Duration = Duration::from_millis(2000);

/// SCPI session over a [`Transport`].
pub struct ScpiSession {
    transport: Box<dyn Transport>,
    policy: RetryPolicy,
    simulating: bool,
}

impl ScpiSession {
    /// Session over real hardware with the default retry policy.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            simulating: false,
        }
    }

    /// Session over a simulated transport: no backoff, no settling delays.
    pub fn simulated(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::immediate(3),
            simulating: true,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn resource_name(&self) -> &str {
        self.transport.resource_name()
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    /// Send a command.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        debug!(resource = %self.resource_name(), "write {}", command);
        let owned = command.to_string();
        let label = format!("write '{}'", command);
        retry_with(&self.policy, &label, &mut *self.transport, move |t| {
            let cmd = owned.clone();
            Box::pin(async move { t.write(&cmd).await })
        })
        .await
    }

    /// Read one reply.
    pub async fn read(&mut self) -> AppResult<String> {
        retry_with(&self.policy, "read", &mut *self.transport, |t| {
            Box::pin(async move { t.read().await })
        })
        .await
    }

    /// Read a raw binary block of `count` bytes.
    pub async fn read_bytes(&mut self, count: usize) -> AppResult<Vec<u8>> {
        retry_with(&self.policy, "read_bytes", &mut *self.transport, move |t| {
            Box::pin(async move { t.read_bytes(count).await })
        })
        .await
    }

    /// Query the instrument. `command` must contain a `?`.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        if !command.contains('?') {
            return Err(CalError::InvalidArgument(format!(
                "Query '{}' does not contain '?'",
                command
            )));
        }
        let owned = command.to_string();
        let label = format!("query '{}'", command);
        let reply: String = retry_with(&self.policy, &label, &mut *self.transport, move |t| {
            let cmd = owned.clone();
            Box::pin(async move { t.query(&cmd).await })
        })
        .await?;
        debug!(resource = %self.resource_name(), "query {} -> {}", command, reply);
        Ok(reply)
    }

    /// Query and parse a numeric reply. Unparsable replies read as `0.0`.
    pub async fn read_query(&mut self, command: &str) -> AppResult<f64> {
        let reply = self.query(command).await?;
        Ok(parse_number(&reply).unwrap_or_else(|| {
            warn!(
                resource = %self.resource_name(),
                "Non-numeric reply to '{}': '{}'", command, reply
            );
            0.0
        }))
    }

    /// Query with a temporarily different I/O timeout.
    pub async fn query_with_timeout(&mut self, command: &str, timeout: Duration) -> AppResult<String> {
        let previous = self.transport.timeout();
        self.transport.set_timeout(timeout);
        let result = self.query(command).await;
        self.transport.set_timeout(previous);
        result
    }

    /// `*IDN?` with the identification timeout.
    pub async fn identify(&mut self) -> AppResult<Identity> {
        let reply = self.query_with_timeout("*IDN?", IDN_TIMEOUT).await?;
        Ok(Identity::parse(&reply))
    }

    /// Wait for hardware to settle. No-op on simulated sessions.
    pub async fn pause(&self, duration: Duration) {
        if !self.simulating {
            tokio::time::sleep(duration).await;
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }

    pub async fn go_to_local(&mut self) -> AppResult<()> {
        self.transport.go_to_local().await
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await
    }
}

/// Parse an instrument's numeric reply (`+1.234E-03`, ` 42 `, `9.9E37`).
pub fn parse_number(reply: &str) -> Option<f64> {
    reply.trim().trim_matches('"').parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedTransport;
    use tracing_test::traced_test;

    fn session_with(sim: &SimulatedTransport) -> ScpiSession {
        ScpiSession::simulated(Box::new(sim.clone()))
    }

    #[tokio::test]
    async fn test_query_requires_question_mark() {
        let sim = SimulatedTransport::new("SIM");
        let mut session = session_with(&sim);
        let err = session.query("*RST").await.unwrap_err();
        assert!(matches!(err, CalError::InvalidArgument(_)));
        assert!(sim.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_read_query_parses_scientific() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("+1.2500E-03".into()));
        let mut session = session_with(&sim);
        let value = session.read_query("MEAS:VAV?").await.unwrap();
        assert!((value - 1.25e-3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_read_query_garbage_reads_zero() {
        let sim = SimulatedTransport::new("SIM").with_responder(|_| Some("OVLD".into()));
        let mut session = session_with(&sim);
        assert_eq!(session.read_query("MEAS:VAV?").await.unwrap(), 0.0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_traffic_is_logged_with_resource() {
        let sim = SimulatedTransport::new("GPIB0::7::INSTR").with_responder(|_| Some("0".into()));
        let mut session = session_with(&sim);
        session.write("*CLS").await.unwrap();
        session.query("*OPC?").await.unwrap();
        assert!(logs_contain("resource=GPIB0::7::INSTR"));
        assert!(logs_contain("write *CLS"));
        assert!(logs_contain("query *OPC? -> 0"));
    }

    #[tokio::test]
    async fn test_write_retries_transient_failures() {
        let sim = SimulatedTransport::new("SIM");
        sim.inject_failures(2);
        let mut session = session_with(&sim);
        session.write("*CLS").await.unwrap();
        assert_eq!(sim.written(), vec!["*CLS"]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_timeout() {
        let sim = SimulatedTransport::new("SIM");
        sim.inject_failures(3);
        let mut session = session_with(&sim);
        let err = session.write("OPER").await.unwrap_err();
        match err {
            CalError::Timeout { operation, attempts } => {
                assert_eq!(attempts, 3);
                assert!(operation.contains("OPER"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identify_restores_timeout() {
        let sim = SimulatedTransport::new("SIM")
            .with_responder(|_| Some("FLUKE,5730A,123456,1.2".into()));
        let mut session = session_with(&sim);
        let id = session.identify().await.unwrap();
        assert_eq!(id.model, "5730A");
        assert_eq!(session.transport.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 42 "), Some(42.0));
        assert_eq!(parse_number("9.9E37"), Some(9.9e37));
        assert_eq!(parse_number("\"1.5\""), Some(1.5));
        assert_eq!(parse_number("AUTO"), None);
    }
}
