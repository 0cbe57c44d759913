//! Modify-settings request model.
//!
//! The host attaches and detaches storage by sending one request per
//! resource. On the wire a request is JSON of the form:
//!
//! ```json
//! {
//!   "ResourceType": "MappedVirtualDisk",
//!   "RequestType": "Add",
//!   "Settings": { "MountPath": "/mnt/d0", "Controller": 0, "Lun": 1, "ReadOnly": true }
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{GcsError, GcsResult};

/// Operation requested on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Add,
    Remove,
    Update,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Add => "Add",
            RequestType::Remove => "Remove",
            RequestType::Update => "Update",
        };
        f.write_str(name)
    }
}

/// Resource kinds understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    MappedVirtualDisk,
    #[serde(rename = "MappedVPMemDevice")]
    MappedVpmemDevice,
    MappedDirectory,
    CombinedLayers,
    BulkCombineLayers,
    LoopbackDisk,
}

impl RequestType {
    fn parse(name: &str) -> GcsResult<Self> {
        match name {
            "Add" => Ok(RequestType::Add),
            "Remove" => Ok(RequestType::Remove),
            "Update" => Ok(RequestType::Update),
            other => Err(GcsError::Unsupported(format!(
                "the request type \"{}\" is not supported",
                other
            ))),
        }
    }
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::MappedVirtualDisk => "MappedVirtualDisk",
            ResourceType::MappedVpmemDevice => "MappedVPMemDevice",
            ResourceType::MappedDirectory => "MappedDirectory",
            ResourceType::CombinedLayers => "CombinedLayers",
            ResourceType::BulkCombineLayers => "BulkCombineLayers",
            ResourceType::LoopbackDisk => "LoopbackDisk",
        }
    }

    fn parse(name: &str) -> GcsResult<Self> {
        let kind = match name {
            "MappedVirtualDisk" => ResourceType::MappedVirtualDisk,
            "MappedVPMemDevice" => ResourceType::MappedVpmemDevice,
            "MappedDirectory" => ResourceType::MappedDirectory,
            "CombinedLayers" => ResourceType::CombinedLayers,
            "BulkCombineLayers" => ResourceType::BulkCombineLayers,
            "LoopbackDisk" => ResourceType::LoopbackDisk,
            other => {
                return Err(GcsError::Unsupported(format!(
                    "the resource type \"{}\" is not supported",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SCSI disk attached at (controller, lun).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedVirtualDisk {
    #[serde(default)]
    pub mount_path: String,
    pub controller: u8,
    pub lun: u8,
    #[serde(default)]
    pub read_only: bool,
}

/// Persistent memory device `/dev/pmem{device_number}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedVpmemDevice {
    pub device_number: u32,
    pub mount_path: String,
}

/// 9p directory share served by the host on a vsock port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedDirectory {
    pub mount_path: String,
    #[serde(default)]
    pub share_name: String,
    pub port: u32,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Layer {
    pub path: String,
}

/// Overlay of already-mounted layer directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CombinedLayers {
    #[serde(default)]
    pub container_root_path: String,
    #[serde(default)]
    pub layers: Vec<Layer>,
    /// Empty for a read-only overlay.
    #[serde(default)]
    pub scratch_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScsiMount {
    pub controller: u8,
    pub lun: u8,
    #[serde(default)]
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PmemMount {
    pub device_number: u32,
}

/// One device mount contributing to a bulk overlay. Exactly one of `scsi`
/// and `pmem` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerMount {
    #[serde(default)]
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scsi: Option<ScsiMount>,
    #[serde(default, rename = "PMem", skip_serializing_if = "Option::is_none")]
    pub pmem: Option<PmemMount>,
}

/// Mount every layer device, an optional scratch device, then the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BulkCombineLayers {
    #[serde(default)]
    pub rootfs_path: String,
    #[serde(default)]
    pub layers: Vec<LayerMount>,
    /// An empty mount path means no scratch, and a read-only overlay.
    #[serde(default)]
    pub scratch: LayerMount,
}

/// Image file attached to `/dev/loop{device_number}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoopbackDisk {
    pub device_number: u32,
    pub backing_file: String,
    pub mount_path: String,
}

/// Typed payload of a modify-settings request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSettings {
    MappedVirtualDisk(MappedVirtualDisk),
    MappedVpmemDevice(MappedVpmemDevice),
    MappedDirectory(MappedDirectory),
    CombinedLayers(CombinedLayers),
    BulkCombineLayers(BulkCombineLayers),
    LoopbackDisk(LoopbackDisk),
}

impl ResourceSettings {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceSettings::MappedVirtualDisk(_) => ResourceType::MappedVirtualDisk,
            ResourceSettings::MappedVpmemDevice(_) => ResourceType::MappedVpmemDevice,
            ResourceSettings::MappedDirectory(_) => ResourceType::MappedDirectory,
            ResourceSettings::CombinedLayers(_) => ResourceType::CombinedLayers,
            ResourceSettings::BulkCombineLayers(_) => ResourceType::BulkCombineLayers,
            ResourceSettings::LoopbackDisk(_) => ResourceType::LoopbackDisk,
        }
    }

    fn decode(kind: ResourceType, value: serde_json::Value) -> GcsResult<Self> {
        let settings = match kind {
            ResourceType::MappedVirtualDisk => {
                ResourceSettings::MappedVirtualDisk(serde_json::from_value(value)?)
            }
            ResourceType::MappedVpmemDevice => {
                ResourceSettings::MappedVpmemDevice(serde_json::from_value(value)?)
            }
            ResourceType::MappedDirectory => {
                ResourceSettings::MappedDirectory(serde_json::from_value(value)?)
            }
            ResourceType::CombinedLayers => {
                ResourceSettings::CombinedLayers(serde_json::from_value(value)?)
            }
            ResourceType::BulkCombineLayers => {
                ResourceSettings::BulkCombineLayers(serde_json::from_value(value)?)
            }
            ResourceType::LoopbackDisk => {
                ResourceSettings::LoopbackDisk(serde_json::from_value(value)?)
            }
        };
        Ok(settings)
    }

    fn encode(&self) -> GcsResult<serde_json::Value> {
        let value = match self {
            ResourceSettings::MappedVirtualDisk(s) => serde_json::to_value(s)?,
            ResourceSettings::MappedVpmemDevice(s) => serde_json::to_value(s)?,
            ResourceSettings::MappedDirectory(s) => serde_json::to_value(s)?,
            ResourceSettings::CombinedLayers(s) => serde_json::to_value(s)?,
            ResourceSettings::BulkCombineLayers(s) => serde_json::to_value(s)?,
            ResourceSettings::LoopbackDisk(s) => serde_json::to_value(s)?,
        };
        Ok(value)
    }
}

/// A request to add, remove or update one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifySettingRequest {
    pub request_type: RequestType,
    pub settings: ResourceSettings,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireRequest {
    resource_type: String,
    request_type: String,
    #[serde(default)]
    settings: serde_json::Value,
}

impl ModifySettingRequest {
    pub fn new(request_type: RequestType, settings: ResourceSettings) -> Self {
        Self {
            request_type,
            settings,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.settings.resource_type()
    }

    /// Decode a request from its JSON wire form.
    ///
    /// An unknown resource or request type is reported as
    /// [`GcsError::Unsupported`]; malformed JSON or settings that do not fit
    /// the resource kind are [`GcsError::InvalidRequest`].
    pub fn from_json(json: &str) -> GcsResult<Self> {
        let wire: WireRequest = serde_json::from_str(json)
            .map_err(|e| GcsError::InvalidRequest(format!("malformed request: {}", e)))?;
        let kind = ResourceType::parse(&wire.resource_type)?;
        let request_type = RequestType::parse(&wire.request_type)?;
        let settings = ResourceSettings::decode(kind, wire.settings).map_err(|e| {
            GcsError::InvalidRequest(format!("malformed {} settings: {}", kind, e))
        })?;
        Ok(Self {
            request_type,
            settings,
        })
    }

    pub fn to_json(&self) -> GcsResult<String> {
        let wire = WireRequest {
            resource_type: self.resource_type().as_str().to_string(),
            request_type: self.request_type.to_string(),
            settings: self.settings.encode()?,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_decode_virtual_disk() {
        let json = r#"{
            "ResourceType": "MappedVirtualDisk",
            "RequestType": "Add",
            "Settings": {"MountPath": "/mnt/d0", "Controller": 0, "Lun": 3, "ReadOnly": true}
        }"#;
        let request = ModifySettingRequest::from_json(json).unwrap();
        assert_eq!(request.request_type, RequestType::Add);
        assert_eq!(
            request.settings,
            ResourceSettings::MappedVirtualDisk(MappedVirtualDisk {
                mount_path: "/mnt/d0".into(),
                controller: 0,
                lun: 3,
                read_only: true,
            })
        );
    }

    #[test]
    fn test_decode_bulk_layers_with_pmem_and_scratch() {
        let json = r#"{
            "ResourceType": "BulkCombineLayers",
            "RequestType": "Add",
            "Settings": {
                "RootfsPath": "/run/c1/rootfs",
                "Layers": [
                    {"MountPath": "/layers/0", "PMem": {"DeviceNumber": 0}},
                    {"MountPath": "/layers/1", "Scsi": {"Controller": 0, "Lun": 1}}
                ],
                "Scratch": {"MountPath": "/scratch", "Scsi": {"Controller": 0, "Lun": 2, "Writable": true}}
            }
        }"#;
        let request = ModifySettingRequest::from_json(json).unwrap();
        let ResourceSettings::BulkCombineLayers(bulk) = request.settings else {
            panic!("expected bulk layers");
        };
        assert_eq!(bulk.layers.len(), 2);
        assert_eq!(bulk.layers[0].pmem, Some(PmemMount { device_number: 0 }));
        assert!(bulk.layers[0].scsi.is_none());
        assert_eq!(bulk.layers[1].scsi.as_ref().map(|s| s.writable), Some(false));
        assert!(bulk.scratch.scsi.as_ref().is_some_and(|s| s.writable));
    }

    #[test]
    fn test_bulk_without_scratch_defaults_to_empty() {
        let json = r#"{
            "ResourceType": "BulkCombineLayers",
            "RequestType": "Add",
            "Settings": {"RootfsPath": "/rootfs", "Layers": []}
        }"#;
        let request = ModifySettingRequest::from_json(json).unwrap();
        let ResourceSettings::BulkCombineLayers(bulk) = request.settings else {
            panic!("expected bulk layers");
        };
        assert!(bulk.scratch.mount_path.is_empty());
    }

    #[test]
    fn test_unknown_resource_is_unsupported() {
        let json = r#"{"ResourceType": "Network", "RequestType": "Add", "Settings": {}}"#;
        let err = ModifySettingRequest::from_json(json).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(
            err.to_string(),
            "the resource type \"Network\" is not supported"
        );
    }

    #[test]
    fn test_malformed_settings_are_invalid_requests() {
        let json = r#"{"ResourceType": "MappedVPMemDevice", "RequestType": "Remove", "Settings": {"MountPath": 1}}"#;
        let err = ModifySettingRequest::from_json(json).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.to_string().contains("MappedVPMemDevice"));
    }

    #[test]
    fn test_unknown_request_type_is_unsupported() {
        let json = r#"{"ResourceType": "MappedVPMemDevice", "RequestType": "Delete", "Settings": {"DeviceNumber": 0, "MountPath": "/mnt/p"}}"#;
        let err = ModifySettingRequest::from_json(json).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(err.to_string(), "the request type \"Delete\" is not supported");
    }

    #[test]
    fn test_unparseable_request_is_invalid() {
        let err = ModifySettingRequest::from_json("{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_encode_uses_wire_names() {
        let request = ModifySettingRequest::new(
            RequestType::Remove,
            ResourceSettings::MappedVpmemDevice(MappedVpmemDevice {
                device_number: 2,
                mount_path: "/mnt/p2".into(),
            }),
        );
        let json = request.to_json().unwrap();
        assert!(json.contains("\"ResourceType\":\"MappedVPMemDevice\""));
        assert!(json.contains("\"DeviceNumber\":2"));
        assert_eq!(ModifySettingRequest::from_json(&json).unwrap(), request);
    }
}
