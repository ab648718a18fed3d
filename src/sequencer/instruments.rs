//! The bench: opening every instrument and handing them back to local.

use crate::adapters::{open_transport, Transport};
use crate::config::InstrumentsConfig;
use crate::error::{AppResult, CalError};
use crate::instrument::{
    load_uut_driver, open_calibrator, Calibrator, Ks33250A, Ks3458A, Oscilloscope,
    RfSignalGenerator, ScpiSession,
};
use crate::simulation::SimulatedBench;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
enum Role<'a> {
    Calibrator(&'a str),
    FunctionGenerator,
    RfGenerator,
    Dmm,
    Uut(&'a str),
}

/// Opens transports on real VISA resources or on a shared simulated bench.
struct Connector {
    bench: Option<SimulatedBench>,
    timeout: Duration,
}

impl Connector {
    fn new(simulate: bool, timeout: Duration) -> Self {
        Self {
            bench: simulate.then(SimulatedBench::new),
            timeout,
        }
    }

    fn simulating(&self) -> bool {
        self.bench.is_some()
    }

    async fn transport(&self, resource: &str, role: Role<'_>) -> AppResult<Box<dyn Transport>> {
        let Some(bench) = &self.bench else {
            return open_transport(resource, self.timeout).await;
        };
        let sim = match role {
            Role::Calibrator(model) => bench.calibrator(resource, model),
            Role::FunctionGenerator => bench.function_generator(resource),
            Role::RfGenerator => bench.rf_generator(resource),
            Role::Dmm => bench.dmm(resource),
            Role::Uut(idn) => bench.uut(resource, idn),
        };
        Ok(Box::new(sim))
    }

    async fn session(&self, resource: &str, role: Role<'_>) -> AppResult<ScpiSession> {
        let transport = self.transport(resource, role).await?;
        Ok(if self.simulating() {
            ScpiSession::simulated(transport)
        } else {
            ScpiSession::new(transport)
        })
    }
}

/// Everything a calibration run drives.
///
/// The calibrator and the UUT are required. The other references are only
/// needed by some tests and are `None` when not configured or not answering.
pub struct Instruments {
    pub calibrator: Box<dyn Calibrator>,
    pub fgen: Option<Ks33250A>,
    pub rfgen: Option<RfSignalGenerator>,
    pub dmm: Option<Ks3458A>,
    pub uut: Box<dyn Oscilloscope>,
}

impl Instruments {
    /// Open the configured bench.
    pub async fn connect(config: &InstrumentsConfig, simulate: bool) -> AppResult<Self> {
        let connector = Connector::new(simulate, config.timeout());

        let session = connector
            .session(&config.calres, Role::Calibrator(&config.calibrator))
            .await?;
        let calibrator = open_calibrator(&config.calibrator, session, config.settle).await?;
        if !calibrator.is_expected_model() {
            warn!("Calibrator identifies as {}", calibrator.identity());
        }

        let uut_transport = connector
            .transport(&config.uut, Role::Uut(&config.simidn))
            .await?;
        let uut = load_uut_driver(uut_transport, connector.simulating()).await?;

        let fgen = match optional(&connector, &config.fgen, Role::FunctionGenerator).await {
            Some(session) => connect_or_warn("33250A", Ks33250A::connect(session).await),
            None => None,
        };
        let rfgen = match optional(&connector, &config.rfgen, Role::RfGenerator).await {
            Some(session) => connect_or_warn("RF generator", RfSignalGenerator::connect(session).await),
            None => None,
        };
        let dmm = match optional(&connector, &config.dmm, Role::Dmm).await {
            Some(session) => connect_or_warn("3458A", Ks3458A::connect(session).await),
            None => None,
        };

        info!(
            uut = %uut.identity(),
            channels = uut.num_channels(),
            fgen = fgen.is_some(),
            rfgen = rfgen.is_some(),
            dmm = dmm.is_some(),
            "Bench connected"
        );
        Ok(Self {
            calibrator,
            fgen,
            rfgen,
            dmm,
            uut,
        })
    }

    pub fn fgen(&mut self) -> AppResult<&mut Ks33250A> {
        self.fgen
            .as_mut()
            .ok_or_else(|| CalError::NotConnected("33250A function generator".into()))
    }

    pub fn rfgen(&mut self) -> AppResult<&mut RfSignalGenerator> {
        self.rfgen
            .as_mut()
            .ok_or_else(|| CalError::NotConnected("RF signal generator".into()))
    }

    pub fn dmm(&mut self) -> AppResult<&mut Ks3458A> {
        self.dmm
            .as_mut()
            .ok_or_else(|| CalError::NotConnected("3458A multimeter".into()))
    }

    /// Return every instrument to front-panel control. Failures are logged.
    pub async fn local_all(&mut self) {
        let mut results = vec![
            ("calibrator", self.calibrator.go_to_local().await),
            ("UUT", self.uut.go_to_local().await),
        ];
        if let Some(fgen) = self.fgen.as_mut() {
            results.push(("33250A", fgen.go_to_local().await));
        }
        if let Some(rfgen) = self.rfgen.as_mut() {
            results.push(("RF generator", rfgen.go_to_local().await));
        }
        if let Some(dmm) = self.dmm.as_mut() {
            results.push(("3458A", dmm.go_to_local().await));
        }
        for (name, result) in results {
            if let Err(e) = result {
                warn!("Could not return {} to local: {}", name, e);
            }
        }
    }
}

async fn optional(connector: &Connector, resource: &str, role: Role<'_>) -> Option<ScpiSession> {
    if resource.trim().is_empty() {
        return None;
    }
    match connector.session(resource, role).await {
        Ok(session) => Some(session),
        Err(e) => {
            warn!("Could not open {}: {}", resource, e);
            None
        }
    }
}

fn connect_or_warn<T>(name: &str, result: AppResult<T>) -> Option<T> {
    match result {
        Ok(instrument) => Some(instrument),
        Err(e) => {
            warn!("{} not available: {}", name, e);
            None
        }
    }
}

/// Result of probing one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub instrument: String,
    pub resource: String,
    pub connected: bool,
    /// Identification, or the reason the instrument could not be opened.
    pub detail: String,
}

impl ConnectionStatus {
    fn new(instrument: &str, resource: &str, check: AppResult<String>) -> Self {
        let (connected, detail) = match check {
            Ok(identity) => (true, identity),
            Err(e) => (false, e.to_string()),
        };
        Self {
            instrument: instrument.to_string(),
            resource: resource.to_string(),
            connected,
            detail,
        }
    }
}

/// Check every configured instrument independently.
///
/// Unlike [`Instruments::connect`] nothing here is fatal; each instrument is
/// reported as connected or not. The UUT is opened through its driver so the
/// report also shows the channel count.
pub async fn check_connections(config: &InstrumentsConfig, simulate: bool) -> Vec<ConnectionStatus> {
    let connector = Connector::new(simulate, config.timeout());
    let mut report = Vec::new();

    let check = async {
        let session = connector
            .session(&config.calres, Role::Calibrator(&config.calibrator))
            .await?;
        let mut cal = open_calibrator(&config.calibrator, session, config.settle).await?;
        let identity = cal.identity().to_string();
        cal.close().await?;
        Ok::<_, CalError>(identity)
    };
    report.push(ConnectionStatus::new("Calibrator", &config.calres, check.await));

    let check = async {
        let session = connector.session(&config.fgen, Role::FunctionGenerator).await?;
        let mut fgen = Ks33250A::connect(session).await?;
        let identity = fgen.identity().to_string();
        fgen.close().await?;
        Ok::<_, CalError>(identity)
    };
    report.push(ConnectionStatus::new("33250A", &config.fgen, check.await));

    let check = async {
        let session = connector.session(&config.rfgen, Role::RfGenerator).await?;
        let mut rfgen = RfSignalGenerator::connect(session).await?;
        let identity = rfgen.identity().to_string();
        rfgen.close().await?;
        Ok::<_, CalError>(identity)
    };
    report.push(ConnectionStatus::new("RF generator", &config.rfgen, check.await));

    let check = async {
        let session = connector.session(&config.dmm, Role::Dmm).await?;
        let mut dmm = Ks3458A::connect(session).await?;
        let identity = dmm.identity().model.clone();
        dmm.close().await?;
        Ok::<_, CalError>(identity)
    };
    report.push(ConnectionStatus::new("3458A", &config.dmm, check.await));

    let check = async {
        let transport = connector.transport(&config.uut, Role::Uut(&config.simidn)).await?;
        let mut uut = load_uut_driver(transport, connector.simulating()).await?;
        let detail = format!("{} ({} channels)", uut.identity(), uut.num_channels());
        uut.close().await?;
        Ok::<_, CalError>(detail)
    };
    report.push(ConnectionStatus::new("UUT", &config.uut, check.await));

    report
}
