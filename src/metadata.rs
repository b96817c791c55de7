//! Nested session metadata and the typed override records read from it.
//!
//! Metadata is a JSON object keyed by section (`NWBFile`, `Ecephys`,
//! `Behavior`, `Ophys`). Each section holds lists of per-entity override
//! objects. Every field of an override record is optional so that missing
//! keys fall back to the defaults computed by the builders.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::error::{NwbError, Result};
use crate::recording::{unique_channel_groups, Recording};
use crate::types::{nan_as_null, CellValue};

pub const NWBFILE: &str = "NWBFile";
pub const ECEPHYS: &str = "Ecephys";
pub const BEHAVIOR: &str = "Behavior";
pub const OPHYS: &str = "Ophys";

/// Session description used when none is supplied.
pub const DEFAULT_SESSION_DESCRIPTION: &str =
    "Auto-generated by NwbRecordingExtractor without description.";

/// Session start time used when none is supplied.
pub const DEFAULT_SESSION_START_TIME: &str = "1970-01-01T00:00:00";

/// Nested metadata dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Metadata(map)),
            other => Err(NwbError::InvalidMetadata(format!(
                "expected a JSON object at the top level, got {}",
                other
            ))),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn section(&self, section: &str) -> Option<&Map<String, Value>> {
        self.0.get(section).and_then(Value::as_object)
    }

    pub fn contains(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.section(section).and_then(|s| s.get(key))
    }

    /// Replaces a whole section.
    pub fn set_section(&mut self, section: &str, value: Value) {
        self.0.insert(section.to_string(), value);
    }

    /// Sets `metadata[section][key]`, creating the section when needed.
    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        let entry = self
            .0
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
    }

    /// Reads `metadata[section][key]` as a list of override records.
    ///
    /// Returns `Ok(None)` when the key is absent and an error when it is
    /// present but not a list of objects of the expected shape.
    pub fn entries<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<Option<Vec<T>>> {
        let Some(value) = self.get(section, key) else {
            return Ok(None);
        };
        let list = value.as_array().ok_or_else(|| {
            NwbError::InvalidMetadata(format!(
                "Expected metadata['{}']['{}'] to be a list of dictionaries!",
                section, key
            ))
        })?;
        list.iter()
            .map(|item| {
                if !item.is_object() {
                    return Err(NwbError::InvalidMetadata(format!(
                        "Expected metadata['{}']['{}'] to be a list of dictionaries!",
                        section, key
                    )));
                }
                serde_json::from_value(item.clone()).map_err(|e| {
                    NwbError::InvalidMetadata(format!("metadata['{}']['{}']: {}", section, key, e))
                })
            })
            .collect::<Result<Vec<T>>>()
            .map(Some)
    }

    /// Reads `metadata[section][key]` as a single override record.
    pub fn entry<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<Option<T>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                NwbError::InvalidMetadata(format!("metadata['{}']['{}']: {}", section, key, e))
            }),
        }
    }

    /// Reads the whole `NWBFile` section, defaulting every missing field.
    pub fn nwbfile(&self) -> Result<NwbFileMetadata> {
        match self.0.get(NWBFILE) {
            None => Ok(NwbFileMetadata::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| NwbError::InvalidMetadata(format!("metadata['NWBFile']: {}", e))),
        }
    }

    /// Deep-merges `update` into `self`. See [`deep_update`].
    pub fn merge(&mut self, update: &Metadata) {
        for (key, value) in &update.0 {
            match self.0.get_mut(key) {
                Some(existing) => deep_update(existing, value),
                None => {
                    self.0.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Returns a copy of `self` with `update` deep-merged on top.
    pub fn merged(&self, update: &Metadata) -> Metadata {
        let mut out = self.clone();
        out.merge(update);
        out
    }
}

/// Recursively merges `update` into `base`.
///
/// - objects merge key by key;
/// - lists of objects merge element-wise on their `name` key, unmatched
///   elements are appended;
/// - any other list is appended to, dropping repeats;
/// - everything else is replaced.
pub fn deep_update(base: &mut Value, update: &Value) {
    match (base, update) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_update(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(base_list), Value::Array(update_list)) => {
            for item in update_list {
                let position = item
                    .as_object()
                    .and_then(|obj| obj.get("name"))
                    .and_then(|name| {
                        base_list
                            .iter()
                            .position(|existing| existing.is_object() && existing.get("name") == Some(name))
                    });
                match position {
                    Some(index) => deep_update(&mut base_list[index], item),
                    None if item.is_object() || !base_list.contains(item) => {
                        base_list.push(item.clone())
                    }
                    None => {}
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Override record for the `NWBFile` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NwbFileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// ISO 8601 timestamp, with or without a UTC offset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimenter: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Override record for one entry of `Ecephys.Device` or `Ophys.Device`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
}

/// Override record for one entry of `Ecephys.ElectrodeGroup`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeGroupMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Name of the device the group is attached to
    #[serde(default)]
    pub device: Option<String>,
}

/// One extra column of the electrode table, given as `Ecephys.Electrodes`.
///
/// `data` is in one-to-one correspondence with the recording channel ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElectrodeColumnMetadata {
    pub name: String,
    pub description: String,
    pub data: Vec<CellValue>,
}

/// Overrides for an electrical series, looked up under `Ecephys[es_key]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectricalSeriesMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

/// One entry of `Behavior.Movies`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// One entry of `Ophys.ImagingPlane[*].optical_channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpticalChannelMetadata {
    pub name: String,
    #[serde(default = "no_description")]
    pub description: String,
    #[serde(default = "nan", with = "nan_as_null")]
    pub emission_lambda: f64,
}

/// One entry of `Ophys.ImagingPlane`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagingPlaneMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub excitation_lambda: Option<f64>,
    #[serde(default)]
    pub indicator: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub optical_channel: Option<Vec<OpticalChannelMetadata>>,
}

/// Name and description of a plane segmentation or response series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedEntryMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn no_description() -> String {
    "no description".to_string()
}

fn nan() -> f64 {
    f64::NAN
}

/// Default `NWBFile` section with a fresh identifier.
pub fn default_nwbfile_metadata() -> Value {
    serde_json::json!({
        "session_description": DEFAULT_SESSION_DESCRIPTION,
        "identifier": uuid::Uuid::new_v4().to_string(),
        "session_start_time": DEFAULT_SESSION_START_TIME
    })
}

/// Returns default metadata for every field a recording can populate.
///
/// Electrode groups are derived from the unique channel groups of the
/// recording, each attached to a single default device.
pub fn get_nwb_metadata(recording: &dyn Recording) -> Metadata {
    let groups: Vec<Value> = unique_channel_groups(recording)
        .into_iter()
        .map(|group| {
            serde_json::json!({
                "name": group.to_string(),
                "description": "no description",
                "location": "unknown",
                "device": "Device"
            })
        })
        .collect();

    let mut metadata = Metadata::new();
    metadata.set_section(NWBFILE, default_nwbfile_metadata());
    metadata.set(
        ECEPHYS,
        "Device",
        serde_json::json!([{ "name": "Device", "description": "no description" }]),
    );
    metadata.set(ECEPHYS, "ElectrodeGroup", Value::Array(groups));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::InMemoryRecording;
    use ndarray::Array2;
    use serde_json::json;

    #[test]
    fn deep_update_merges_named_entries() {
        let mut base = json!({
            "Ecephys": {
                "Device": [{"name": "Device", "description": "no description"}],
                "ElectrodeGroup": [{"name": "0", "location": "unknown"}]
            }
        });
        let update = json!({
            "Ecephys": {
                "Device": [{"name": "Device", "description": "Neuropixels"}],
                "ElectrodeGroup": [{"name": "1", "location": "CA1"}]
            }
        });
        deep_update(&mut base, &update);
        assert_eq!(base["Ecephys"]["Device"].as_array().unwrap().len(), 1);
        assert_eq!(base["Ecephys"]["Device"][0]["description"], "Neuropixels");
        assert_eq!(base["Ecephys"]["ElectrodeGroup"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn deep_update_appends_scalar_lists_without_repeats() {
        let mut base = json!({"experimenter": ["Ada"]});
        deep_update(&mut base, &json!({"experimenter": ["Ada", "Grace"]}));
        assert_eq!(base["experimenter"], json!(["Ada", "Grace"]));
    }

    #[test]
    fn deep_update_replaces_scalars() {
        let mut base = json!({"NWBFile": {"session_description": "a"}});
        deep_update(&mut base, &json!({"NWBFile": {"session_description": "b"}}));
        assert_eq!(base["NWBFile"]["session_description"], "b");
    }

    #[test]
    fn entries_rejects_non_dictionaries() {
        let metadata = Metadata::from_value(json!({"Ecephys": {"ElectrodeGroup": ["a"]}})).unwrap();
        let result = metadata.entries::<ElectrodeGroupMetadata>(ECEPHYS, "ElectrodeGroup");
        assert!(matches!(result, Err(NwbError::InvalidMetadata(_))));
    }

    #[test]
    fn electrode_columns_require_exact_keys() {
        let metadata = Metadata::from_value(json!({
            "Ecephys": {"Electrodes": [{"name": "quality", "description": "q", "data": [1], "extra": 2}]}
        }))
        .unwrap();
        assert!(metadata
            .entries::<ElectrodeColumnMetadata>(ECEPHYS, "Electrodes")
            .is_err());
    }

    #[test]
    fn defaults_follow_channel_groups() {
        let recording = InMemoryRecording::new(Array2::<i16>::zeros((10, 3)), 1000.0)
            .with_property(0, "group", 1i64)
            .with_property(1, "group", 0i64)
            .with_property(2, "group", 1i64);
        let metadata = get_nwb_metadata(&recording);
        let groups = metadata
            .entries::<ElectrodeGroupMetadata>(ECEPHYS, "ElectrodeGroup")
            .unwrap()
            .unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["0", "1"]);
        assert_eq!(groups[0].device.as_deref(), Some("Device"));
        let file = metadata.nwbfile().unwrap();
        assert_eq!(file.session_start_time.as_deref(), Some(DEFAULT_SESSION_START_TIME));
        assert!(file.identifier.is_some());
    }
}
