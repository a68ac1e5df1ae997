//! BlueZ D-Bus backend for beacon discovery.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{Discovery, ScanError, describe, record};
use crate::mac_address::MacAddress;
use crate::proximity::Observation;
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

#[derive(Default)]
pub struct BluerDiscovery {
    // The adapter proxy is only valid while its session is alive.
    session: Option<Session>,
    adapter: Option<Adapter>,
}

impl BluerDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Discovery for BluerDiscovery {
    fn init(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            let session = Session::new().await?;
            let adapter = session.default_adapter().await?;
            adapter.set_powered(true).await?;
            info!(adapter = adapter.name(), "Bluetooth adapter ready");

            self.session = Some(session);
            self.adapter = Some(adapter);
            Ok(())
        })
    }

    fn discover(
        &mut self,
        duration: Duration,
    ) -> BoxFuture<'_, Result<Vec<Observation>, ScanError>> {
        Box::pin(async move {
            let adapter = self.adapter.as_ref().ok_or(ScanError::NotInitialized)?;
            let addresses = collect_addresses(adapter, duration).await?;

            let mut observations = Vec::with_capacity(addresses.len());
            for address in addresses {
                if let Some(observation) = observe(adapter, address).await? {
                    record(&mut observations, observation);
                }
            }
            Ok(observations)
        })
    }
}

/// Run discovery for `duration` and return every address announced.
///
/// Discovery stops when the event stream is dropped.
async fn collect_addresses(
    adapter: &Adapter,
    duration: Duration,
) -> Result<Vec<Address>, ScanError> {
    let events = adapter.discover_devices().await?;
    tokio::pin!(events);

    let mut addresses = Vec::new();
    // Running out the clock is the normal way for a pass to end.
    let _ = timeout(duration, async {
        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(address) = event
                && !addresses.contains(&address)
            {
                addresses.push(address);
            }
        }
    })
    .await;

    Ok(addresses)
}

/// Read the cached signal strength and name of one device.
///
/// Devices BlueZ knows but has no RSSI for were not heard in this pass.
async fn observe(adapter: &Adapter, address: Address) -> Result<Option<Observation>, ScanError> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await.ok().flatten() else {
        return Ok(None);
    };
    let name = device.name().await.ok().flatten();
    let address: MacAddress = address.into();
    debug!(device = %describe(&address, rssi, name.as_deref()), "device found");

    Ok(Some(Observation {
        address,
        rssi,
        name,
    }))
}
