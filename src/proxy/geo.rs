//! Country annotation for resolved candidate addresses using an MMDB database

use crate::Result;
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Where a candidate's endpoint is located
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoTag {
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "NL")
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub city_name: Option<String>,
}

impl GeoTag {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.country_name.is_none() && self.city_name.is_none()
    }

    /// Short label used in the text report comment column
    pub fn label(&self) -> Option<String> {
        match (&self.country_code, &self.city_name) {
            (Some(cc), Some(city)) => Some(format!("{}-{}", cc, city)),
            (Some(cc), None) => Some(cc.clone()),
            (None, Some(city)) => Some(city.clone()),
            (None, None) => None,
        }
    }
}

/// Looks up addresses in a MaxMind City database
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Open an MMDB file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    pub fn lookup(&self, ip: IpAddr) -> Result<GeoTag> {
        let lookup_result = self.reader.lookup(ip)?;
        let city: Option<geoip2::City> = lookup_result.decode()?;

        let Some(city) = city else {
            return Ok(GeoTag::default());
        };

        Ok(GeoTag {
            country_code: city.country.iso_code.map(String::from),
            country_name: city.country.names.english.map(String::from),
            city_name: city.city.names.english.map(String::from),
        })
    }
}

impl std::fmt::Debug for GeoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoLocator").finish_non_exhaustive()
    }
}
