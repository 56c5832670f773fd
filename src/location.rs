//! Spoof coordinates and the shared store that carries them from the
//! configuration surface into the tunnel process.
//!
//! The pair is written and removed as one unit and only read back as a pair:
//! a store holding just one of the two keys reads as unconfigured.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::TunnelError;
use crate::store::{KeyValueStore, StoreError};

pub const LATITUDE_KEY: &str = "spoofed_latitude";
pub const LONGITUDE_KEY: &str = "spoofed_longitude";

/// Common locations offered by the configuration surface.
pub const PRESET_LOCATIONS: [(&str, Coordinates); 6] = [
    ("New York", Coordinates { latitude: 40.7128, longitude: -74.0060 }),
    ("London", Coordinates { latitude: 51.5074, longitude: -0.1278 }),
    ("Tokyo", Coordinates { latitude: 35.6762, longitude: 139.6503 }),
    ("Sydney", Coordinates { latitude: -33.8688, longitude: 151.2093 }),
    ("Paris", Coordinates { latitude: 48.8566, longitude: 2.3522 }),
    ("Los Angeles", Coordinates { latitude: 34.0522, longitude: -118.2437 }),
];

/// A validated latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Validate and build a pair. NaN fails both range checks.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, TunnelError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(TunnelError::Range(format!(
                "latitude {} is outside [-90, 90]",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(TunnelError::Range(format!(
                "longitude {} is outside [-180, 180]",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Parse user-entered text, then range-check.
    pub fn parse(latitude: &str, longitude: &str) -> Result<Self, TunnelError> {
        let lat: f64 = latitude.trim().parse().map_err(|_| {
            TunnelError::InvalidParam(format!("latitude {:?} is not a number", latitude))
        })?;
        let lon: f64 = longitude.trim().parse().map_err(|_| {
            TunnelError::InvalidParam(format!("longitude {:?} is not a number", longitude))
        })?;
        Self::new(lat, lon)
    }
}

/// Look up a preset location by name, ignoring case.
pub fn preset(name: &str) -> Option<Coordinates> {
    PRESET_LOCATIONS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
        .map(|(_, c)| *c)
}

fn unavailable(e: StoreError) -> TunnelError {
    TunnelError::ConfigUnavailable(e.to_string())
}

/// Cross-process store for the desired spoof coordinates.
///
/// Written by the configuration surface, read once per tunnel start.
#[derive(Clone)]
pub struct SharedConfigStore {
    store: Arc<dyn KeyValueStore>,
}

impl SharedConfigStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Current coordinates, or `None` when unconfigured.
    pub fn get(&self) -> Result<Option<Coordinates>, TunnelError> {
        let values = self
            .store
            .get_many(&[LATITUDE_KEY, LONGITUDE_KEY])
            .map_err(unavailable)?;

        let lat = values.first().and_then(|v| v.as_ref()).and_then(|v| v.as_f64());
        let lon = values.get(1).and_then(|v| v.as_ref()).and_then(|v| v.as_f64());

        match (lat, lon) {
            (Some(latitude), Some(longitude)) => match Coordinates::new(latitude, longitude) {
                Ok(coords) => Ok(Some(coords)),
                Err(e) => {
                    log::warn!("Ignoring stored coordinates: {}", e);
                    Ok(None)
                }
            },
            (None, None) => Ok(None),
            _ => {
                log::warn!(
                    "Partially configured coordinates in shared store, treating as unconfigured"
                );
                Ok(None)
            }
        }
    }

    /// Validate and persist both coordinates. Prior state is untouched on error.
    pub fn set(&self, latitude: f64, longitude: f64) -> Result<Coordinates, TunnelError> {
        let coords = Coordinates::new(latitude, longitude)?;
        self.store
            .set_many(&[
                (LATITUDE_KEY, json!(coords.latitude)),
                (LONGITUDE_KEY, json!(coords.longitude)),
            ])
            .map_err(unavailable)?;
        log::info!(
            "Spoof coordinates set: {:.6}, {:.6}",
            coords.latitude,
            coords.longitude
        );
        Ok(coords)
    }

    pub fn clear(&self) -> Result<(), TunnelError> {
        self.store
            .remove_many(&[LATITUDE_KEY, LONGITUDE_KEY])
            .map_err(unavailable)?;
        log::info!("Spoof coordinates cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileKeyValueStore, MemoryKeyValueStore};
    use tempfile::TempDir;

    fn memory_store() -> (SharedConfigStore, Arc<MemoryKeyValueStore>) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        (SharedConfigStore::new(kv.clone()), kv)
    }

    #[test]
    fn set_then_get_is_exact() {
        let (store, _) = memory_store();
        let samples = [
            (48.8566, 2.3522),
            (-90.0, -180.0),
            (90.0, 180.0),
            (0.0, 0.0),
            (-33.868_800_000_000_01, 151.209_299_999_999_98),
        ];

        for (lat, lon) in samples {
            store.set(lat, lon).unwrap();
            let got = store.get().unwrap().unwrap();
            assert_eq!(got.latitude.to_bits(), lat.to_bits());
            assert_eq!(got.longitude.to_bits(), lon.to_bits());
        }
    }

    #[test]
    fn out_of_range_leaves_prior_state() {
        let (store, _) = memory_store();
        assert!(matches!(store.set(1000.0, 50.0), Err(TunnelError::Range(_))));
        assert_eq!(store.get().unwrap(), None);

        store.set(10.0, 20.0).unwrap();
        let out_of_range = [
            (90.5, 0.0),
            (-91.0, 0.0),
            (0.0, 180.01),
            (0.0, -200.0),
            (f64::NAN, 0.0),
        ];
        for (lat, lon) in out_of_range {
            assert!(matches!(store.set(lat, lon), Err(TunnelError::Range(_))));
            assert_eq!(
                store.get().unwrap(),
                Some(Coordinates { latitude: 10.0, longitude: 20.0 })
            );
        }
    }

    #[test]
    fn clear_is_idempotent() {
        let (store, kv) = memory_store();
        store.set(1.0, 2.0).unwrap();
        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn half_populated_reads_as_unconfigured() {
        let (store, kv) = memory_store();
        kv.set_many(&[(LATITUDE_KEY, json!(12.0))]).unwrap();
        assert_eq!(store.get().unwrap(), None);

        kv.remove_many(&[LATITUDE_KEY]).unwrap();
        kv.set_many(&[(LONGITUDE_KEY, json!(12.0))]).unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn non_numeric_or_out_of_range_stored_values_are_ignored() {
        let (store, kv) = memory_store();
        kv.set_many(&[(LATITUDE_KEY, json!("north")), (LONGITUDE_KEY, json!(1.0))])
            .unwrap();
        assert_eq!(store.get().unwrap(), None);

        kv.set_many(&[(LATITUDE_KEY, json!(400.0))]).unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn unreadable_store_is_config_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared_config.json");
        std::fs::write(&path, "not json").unwrap();

        let store = SharedConfigStore::new(Arc::new(FileKeyValueStore::new(&path)));
        assert!(matches!(store.get(), Err(TunnelError::ConfigUnavailable(_))));
    }

    #[test]
    fn file_backed_store_is_shared_between_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared_config.json");
        let surface = SharedConfigStore::new(Arc::new(FileKeyValueStore::new(&path)));
        let tunnel = SharedConfigStore::new(Arc::new(FileKeyValueStore::new(&path)));

        surface.set(51.51042, -3.218306).unwrap();
        assert_eq!(
            tunnel.get().unwrap(),
            Some(Coordinates { latitude: 51.51042, longitude: -3.218306 })
        );

        surface.clear().unwrap();
        assert_eq!(tunnel.get().unwrap(), None);
    }

    #[test]
    fn parse_trims_and_validates() {
        let c = Coordinates::parse(" 48.8566 ", "2.3522").unwrap();
        assert_eq!(c, Coordinates { latitude: 48.8566, longitude: 2.3522 });

        assert!(matches!(
            Coordinates::parse("abc", "2.0"),
            Err(TunnelError::InvalidParam(_))
        ));
        assert!(matches!(
            Coordinates::parse("95", "2.0"),
            Err(TunnelError::Range(_))
        ));
    }

    #[test]
    fn presets_are_valid_and_found_case_insensitively() {
        for (_, c) in PRESET_LOCATIONS {
            assert!(Coordinates::new(c.latitude, c.longitude).is_ok());
        }
        assert_eq!(preset("paris"), Some(Coordinates { latitude: 48.8566, longitude: 2.3522 }));
        assert_eq!(preset("Atlantis"), None);
    }
}
