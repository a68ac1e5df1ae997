//! Selection of nearby, known beacons from one discovery pass.

use crate::mac_address::MacAddress;
use crate::registry::BeaconRegistry;
use std::fmt;

/// One device seen during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub address: MacAddress,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Name advertised by the device itself, if any
    pub name: Option<String>,
}

/// A registered beacon seen above the signal threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityMatch {
    pub address: MacAddress,
    pub rssi: i16,
    /// Display name from the registry
    pub name: String,
}

impl fmt::Display for ProximityMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "address: {}, rssi: {} dBm, name: {}",
            self.address, self.rssi, self.name
        )
    }
}

/// Keep the observations that are registered and strictly stronger than
/// `threshold`, named after the registry and sorted by display name.
///
/// Equal names are ordered by address; the sort is stable, so identical
/// entries keep their input order. The advertised name is never used.
pub fn filter(
    observations: &[Observation],
    registry: &BeaconRegistry,
    threshold: i16,
) -> Vec<ProximityMatch> {
    let mut matches: Vec<ProximityMatch> = observations
        .iter()
        .filter(|o| o.rssi > threshold)
        .filter_map(|o| {
            registry.name_of(&o.address).map(|name| ProximityMatch {
                address: o.address,
                rssi: o.rssi,
                name: name.to_string(),
            })
        })
        .collect();

    matches.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)));
    matches
}
