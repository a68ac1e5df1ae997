//! Known beacons: hardware address to display name.
//!
//! The registry is built once at startup from a JSON file (plus any
//! `--beacon` entries given on the command line) and is read-only afterwards.
//! It never fails to load: a missing or malformed file yields an empty
//! registry so that scanning keeps running and simply matches nothing.

use crate::mac_address::{MacAddress, ParseMacError};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// A beacon entry given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub address: MacAddress,
    pub name: String,
}

/// Parse an alias from a string in the format "MAC=NAME".
///
/// # Example
/// ```
/// use envbeacon::registry::parse_alias;
///
/// let alias = parse_alias("aa:bb:cc:dd:ee:ff=Lobby").unwrap();
/// assert_eq!(alias.address.to_string(), "AA:BB:CC:DD:EE:FF");
/// assert_eq!(alias.name, "Lobby");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, String> {
    let (address, name) = src
        .split_once('=')
        .ok_or_else(|| "invalid beacon: expected format MAC=NAME".to_string())?;
    let address = address.parse().map_err(|e: ParseMacError| e.to_string())?;
    if name.is_empty() {
        return Err("invalid beacon: empty name".into());
    }
    Ok(Alias {
        address,
        name: name.into(),
    })
}

#[derive(Error, Debug)]
enum RegistryError {
    #[error("cannot read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("cannot parse {0}: {1}")]
    Json(String, serde_json::Error),
}

/// Immutable mapping of beacon address to display name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeaconRegistry {
    beacons: BTreeMap<MacAddress, String>,
}

impl BeaconRegistry {
    /// Load the registry from a JSON object of `"address": "name"` pairs,
    /// then apply `extra` entries on top.
    ///
    /// Never fails: problems are logged and the affected entries (or the
    /// whole file) are skipped.
    pub fn load(path: &Path, extra: &[Alias]) -> Self {
        let mut beacons = match read_file(path) {
            Ok(raw) => from_raw(raw),
            Err(e) => {
                warn!(error = %e, "beacon registry unavailable, no beacon will match");
                BTreeMap::new()
            }
        };

        for alias in extra {
            beacons.insert(alias.address, alias.name.clone());
        }

        info!(path = %path.display(), beacons = beacons.len(), "beacon registry loaded");
        Self { beacons }
    }

    pub fn name_of(&self, address: &MacAddress) -> Option<&str> {
        self.beacons.get(address).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MacAddress, &str)> {
        self.beacons.iter().map(|(a, n)| (a, n.as_str()))
    }
}

impl FromIterator<(MacAddress, String)> for BeaconRegistry {
    fn from_iter<I: IntoIterator<Item = (MacAddress, String)>>(iter: I) -> Self {
        Self {
            beacons: iter.into_iter().collect(),
        }
    }
}

fn read_file(path: &Path) -> Result<BTreeMap<String, String>, RegistryError> {
    let display = path.display().to_string();
    let content =
        std::fs::read_to_string(path).map_err(|e| RegistryError::Io(display.clone(), e))?;
    serde_json::from_str(&content).map_err(|e| RegistryError::Json(display, e))
}

fn from_raw(raw: BTreeMap<String, String>) -> BTreeMap<MacAddress, String> {
    let mut beacons = BTreeMap::new();
    for (address, name) in raw {
        match address.parse::<MacAddress>() {
            Ok(mac) => {
                if let Some(previous) = beacons.insert(mac, name) {
                    warn!(address = %mac, previous = %previous, "duplicate beacon address, keeping last entry");
                }
            }
            Err(e) => warn!(address = %address, error = %e, "skipping beacon entry"),
        }
    }
    beacons
}
