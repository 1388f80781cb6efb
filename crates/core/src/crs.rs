//! Coordinate Reference System handling

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate Reference System representation.
///
/// The engine only needs to distinguish projected from geographic systems
/// (flow-length distances are Euclidean in the former, Haversine in the
/// latter); the identifiers are carried through to outputs untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crs {
    /// WKT representation (primary)
    wkt: Option<String>,
    /// EPSG code if known
    epsg: Option<u32>,
    /// PROJ string if available
    proj: Option<String>,
    /// Whether the system is geographic (lat/lon degrees)
    geographic: Option<bool>,
}

/// Geographic EPSG codes the engine recognizes without external metadata.
const GEOGRAPHIC_EPSG: [u32; 4] = [4326, 4269, 4267, 4258];

impl Crs {
    /// Create a CRS from an EPSG code
    pub fn from_epsg(code: u32) -> Self {
        Self {
            wkt: None,
            epsg: Some(code),
            proj: None,
            geographic: Some(GEOGRAPHIC_EPSG.contains(&code)),
        }
    }

    /// Create a CRS from a WKT string
    pub fn from_wkt(wkt: impl Into<String>) -> Self {
        Self {
            wkt: Some(wkt.into()),
            epsg: None,
            proj: None,
            geographic: None,
        }
    }

    /// Override the geographic/projected classification.
    pub fn with_geographic(mut self, geographic: bool) -> Self {
        self.geographic = Some(geographic);
        self
    }

    /// WGS84 geographic CRS (EPSG:4326)
    pub fn wgs84() -> Self {
        Self::from_epsg(4326)
    }

    /// Web Mercator (EPSG:3857)
    pub fn web_mercator() -> Self {
        Self::from_epsg(3857)
    }

    /// Get EPSG code if known
    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    /// Get WKT representation
    pub fn wkt(&self) -> Option<&str> {
        self.wkt.as_deref()
    }

    /// Whether the system is projected, if classified.
    ///
    /// `None` means the classification is unknown; stages that need the
    /// distinction surface a precondition error.
    pub fn is_projected(&self) -> Option<bool> {
        self.geographic.map(|g| !g)
    }

    /// Check if two CRS are equivalent
    pub fn is_equivalent(&self, other: &Crs) -> bool {
        if let (Some(a), Some(b)) = (self.epsg, other.epsg) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.wkt, &other.wkt) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.proj, &other.proj) {
            return a == b;
        }
        false
    }

    /// Get a string identifier for this CRS
    pub fn identifier(&self) -> String {
        if let Some(code) = self.epsg {
            return format!("EPSG:{}", code);
        }
        if let Some(proj) = &self.proj {
            return proj.clone();
        }
        if let Some(wkt) = &self.wkt {
            return format!("WKT:{}", &wkt[..wkt.len().min(50)]);
        }
        "Unknown".to_string()
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

impl Default for Crs {
    fn default() -> Self {
        Self::wgs84()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crs_epsg() {
        let crs = Crs::from_epsg(4326);
        assert_eq!(crs.epsg(), Some(4326));
        assert_eq!(crs.identifier(), "EPSG:4326");
    }

    #[test]
    fn test_crs_equivalence() {
        let a = Crs::from_epsg(4326);
        let b = Crs::wgs84();
        assert!(a.is_equivalent(&b));
    }

    #[test]
    fn test_projected_classification() {
        assert_eq!(Crs::wgs84().is_projected(), Some(false));
        assert_eq!(Crs::web_mercator().is_projected(), Some(true));
        assert_eq!(Crs::from_wkt("PROJCS[...]").is_projected(), None);
        assert_eq!(
            Crs::from_wkt("PROJCS[...]").with_geographic(false).is_projected(),
            Some(true)
        );
    }
}
