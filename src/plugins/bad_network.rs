//! Statistical network degradation
//!
//! Asks for latency before each relay cycle and throughput throttling on
//! read and write, each driven by its own configured random process. All
//! three processes are optional; an absent one injects nothing. Delays
//! are returned as verdicts for the session to sleep, not awaited here.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::dist::{latency_delay, transfer_delay, DistributionSpec, Sampler};
use crate::plugin::{self, NetworkStage, NetworkVerdict, TamperPlugin, TamperStyle};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Config {
    #[serde(default, alias = "Latency")]
    latency: Option<DistributionSpec>,
    #[serde(default, alias = "ReadBandwidth")]
    read_bandwidth: Option<DistributionSpec>,
    #[serde(default, alias = "WriteBandwidth")]
    write_bandwidth: Option<DistributionSpec>,
}

pub struct BadNetworkPlugin {
    latency: Option<Sampler>,
    read: Option<Sampler>,
    write: Option<Sampler>,
}

impl BadNetworkPlugin {
    pub fn from_config_path(path: Option<&Path>) -> anyhow::Result<Self> {
        let config: Config = match path {
            Some(path) => plugin::parse_config(path)?,
            None => Config::default(),
        };
        if let Some(latency) = &config.latency {
            info!(?latency, "latency fault active (milliseconds)");
        }
        if let Some(read) = &config.read_bandwidth {
            info!(?read, "read bandwidth fault active (kilobits/sec)");
        }
        if let Some(write) = &config.write_bandwidth {
            info!(?write, "write bandwidth fault active (kilobits/sec)");
        }
        Ok(Self {
            latency: Sampler::resolve(config.latency.as_ref())?,
            read: Sampler::resolve(config.read_bandwidth.as_ref())?,
            write: Sampler::resolve(config.write_bandwidth.as_ref())?,
        })
    }
}

#[async_trait]
impl TamperPlugin for BadNetworkPlugin {
    fn name(&self) -> &'static str {
        "bad-network"
    }

    fn style(&self) -> TamperStyle {
        TamperStyle::NETWORK
    }

    async fn handle_network_stage(
        &mut self,
        stage: NetworkStage,
        size: Option<usize>,
        _from_client: bool,
    ) -> anyhow::Result<NetworkVerdict> {
        let delay = match stage {
            NetworkStage::Initial => latency_delay(self.latency.as_mut()),
            NetworkStage::Read => transfer_delay(self.read.as_mut(), size.unwrap_or(0)),
            NetworkStage::Write => transfer_delay(self.write.as_mut(), size.unwrap_or(0)),
            NetworkStage::Connect => return Ok(NetworkVerdict::default()),
        };
        if !delay.is_zero() {
            debug!(%stage, ?delay, "injecting delay");
        }
        Ok(NetworkVerdict::delay(delay))
    }
}
