use serde::{Deserialize, Serialize};

/// Device identity document returned by the remote registry.
///
/// The registry is authoritative for its shape, so it is kept as raw JSON.
pub type DeviceInfo = serde_json::Value;

/// Desired status of a device identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// The device is allowed to connect.
    #[default]
    Enabled,
    /// The device is not allowed to connect.
    Disabled,
}

impl DeviceStatus {
    /// Normalizes a free-form status into a [`DeviceStatus`].
    ///
    /// The comparison is case-insensitive and ignores surrounding spaces.
    /// A missing, empty, or unrecognized status falls back to
    /// [`DeviceStatus::Enabled`].
    #[must_use]
    pub fn normalize(status: Option<&str>) -> Self {
        let Some(status) = status else {
            return Self::Enabled;
        };

        match status.trim().to_ascii_lowercase().as_str() {
            "disable" | "disabled" | "false" | "0" => Self::Disabled,
            // "enable", "enabled", "true", "1", "" and anything else.
            _ => Self::Enabled,
        }
    }

    /// Returns the status as sent to the remote registry.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

/// A device identifier along with its optional desired status.
///
/// It is the unit of input of a batch operation. The status is kept as
/// received and normalized only when the identity is written to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Device identifier.
    pub id: String,
    /// Desired status, as received.
    pub status: Option<String>,
}

impl DeviceRecord {
    /// Creates a [`DeviceRecord`] without a status.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: None,
        }
    }

    /// Sets the desired status.
    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Returns the normalized desired status.
    #[must_use]
    pub fn normalized_status(&self) -> DeviceStatus {
        DeviceStatus::normalize(self.status.as_deref())
    }
}

// Identity payload written by an upsert call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeviceIdentity<'a> {
    device_id: &'a str,
    status: DeviceStatus,
    authentication: Authentication,
}

impl<'a> DeviceIdentity<'a> {
    pub(crate) const fn new(device_id: &'a str, status: DeviceStatus) -> Self {
        Self {
            device_id,
            status,
            authentication: Authentication {
                kind: "sas",
                symmetric_key: SymmetricKey {
                    primary_key: "",
                    secondary_key: "",
                },
            },
        }
    }
}

// Empty keys let the registry generate them.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Authentication {
    #[serde(rename = "type")]
    kind: &'static str,
    symmetric_key: SymmetricKey,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SymmetricKey {
    primary_key: &'static str,
    secondary_key: &'static str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DeviceIdentity, DeviceRecord, DeviceStatus};

    #[test]
    fn normalize_enabled() {
        for status in ["enable", "enabled", "true", "1", "", " Enabled ", "TRUE"] {
            assert_eq!(DeviceStatus::normalize(Some(status)), DeviceStatus::Enabled);
        }
        assert_eq!(DeviceStatus::normalize(None), DeviceStatus::Enabled);
    }

    #[test]
    fn normalize_disabled() {
        for status in ["disable", "disabled", "false", "0", " DISABLED"] {
            assert_eq!(DeviceStatus::normalize(Some(status)), DeviceStatus::Disabled);
        }
    }

    #[test]
    fn normalize_fallback() {
        for status in ["bogus", "off", "no"] {
            assert_eq!(DeviceStatus::normalize(Some(status)), DeviceStatus::Enabled);
        }
    }

    #[test]
    fn record_status() {
        assert_eq!(
            DeviceRecord::new("pod-1").normalized_status(),
            DeviceStatus::Enabled
        );
        assert_eq!(
            DeviceRecord::new("pod-1").status("false").normalized_status(),
            DeviceStatus::Disabled
        );
    }

    #[test]
    fn identity_payload() {
        assert_eq!(
            serde_json::to_value(DeviceIdentity::new("pod-1", DeviceStatus::Disabled)).unwrap(),
            json!({
                "deviceId": "pod-1",
                "status": "disabled",
                "authentication": {
                    "type": "sas",
                    "symmetricKey": {
                        "primaryKey": "",
                        "secondaryKey": ""
                    }
                }
            })
        );
    }
}
