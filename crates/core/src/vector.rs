//! Vector feature types and sinks.
//!
//! Stream networks, junctions, drainage points and basin outlines move
//! through this layer: layered collections of features with an optional
//! FID and a flat attribute map.

use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::Result;

/// Attribute value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttributeValue {
    /// The integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The float payload, if this is a `Float` (or `Int`).
    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// A geographic feature with geometry, attributes and an optional FID.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Feature geometry
    pub geometry: Geometry<f64>,
    /// Feature attributes
    pub properties: BTreeMap<String, AttributeValue>,
    /// Feature ID, assigned by the producing stage
    pub fid: Option<u64>,
}

impl Feature {
    /// Create a new feature with geometry
    pub fn new(geometry: Geometry<f64>) -> Self {
        Self {
            geometry,
            properties: BTreeMap::new(),
            fid: None,
        }
    }

    /// Set an attribute
    pub fn set_property(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.properties.insert(key.into(), value);
    }

    /// Get an attribute
    pub fn get_property(&self, key: &str) -> Option<&AttributeValue> {
        self.properties.get(key)
    }

    /// Builder-style attribute setter
    pub fn with_property(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.set_property(key, value);
        self
    }
}

/// Collection of features
#[derive(Debug, Clone, Default)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
        }
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }
}

impl IntoIterator for FeatureCollection {
    type Item = Feature;
    type IntoIter = std::vec::IntoIter<Feature>;

    fn into_iter(self) -> Self::IntoIter {
        self.features.into_iter()
    }
}

/// Read access to layered vector data (e.g. drainage points).
pub trait VectorSource: Send + Sync {
    /// Read a layer by name; `None` selects the first/only layer.
    fn read_layer(&self, layer: Option<&str>) -> Result<FeatureCollection>;
}

/// Write access to layered vector data.
pub trait VectorSink: Send + Sync {
    /// Append a feature to the named layer, creating it if absent.
    fn add_feature(&self, layer: &str, feature: Feature) -> Result<()>;
}

/// An in-memory vector store implementing both source and sink.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    layers: Mutex<BTreeMap<String, FeatureCollection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a layer's features (empty when the layer is absent).
    pub fn layer(&self, name: &str) -> FeatureCollection {
        self.layers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of all layers, sorted.
    pub fn layer_names(&self) -> Vec<String> {
        self.layers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl VectorSource for MemoryVectorStore {
    fn read_layer(&self, layer: Option<&str>) -> Result<FeatureCollection> {
        let layers = self.layers.lock().unwrap_or_else(|e| e.into_inner());
        let collection = match layer {
            Some(name) => layers.get(name).cloned(),
            None => layers.values().next().cloned(),
        };
        Ok(collection.unwrap_or_default())
    }
}

impl VectorSink for MemoryVectorStore {
    fn add_feature(&self, layer: &str, feature: Feature) -> Result<()> {
        self.layers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(layer.to_string())
            .or_default()
            .push(feature);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::Point;

    #[test]
    fn test_store_layers() {
        let store = MemoryVectorStore::new();
        let feature = Feature::new(Geometry::Point(Point::new(1.0, 2.0)))
            .with_property("type", AttributeValue::String("source".into()));
        store.add_feature("junctions", feature).unwrap();

        assert_eq!(store.layer_names(), vec!["junctions".to_string()]);
        let layer = store.layer("junctions");
        assert_eq!(layer.len(), 1);
        assert_eq!(
            layer.features[0].get_property("type"),
            Some(&AttributeValue::String("source".into()))
        );
        assert!(store.layer("streams").is_empty());
    }

    #[test]
    fn test_read_first_layer() {
        let store = MemoryVectorStore::new();
        store
            .add_feature("points", Feature::new(Geometry::Point(Point::new(0.0, 0.0))))
            .unwrap();
        assert_eq!(store.read_layer(None).unwrap().len(), 1);
    }
}
