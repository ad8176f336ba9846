// Ecobee Exporter - Ecobee thermostat metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::sync::Arc;

/// Potential kinds of errors that can be encountered talking to the ecobee API
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum ApiErrorKind {
    Transport,
    Auth,
    Decode,
    Api,
}

/// Error making a request to the ecobee API or interpreting its response
#[derive(Debug)]
pub enum ApiError {
    Api(i32, String),
    KindMsg(ApiErrorKind, &'static str),
    KindMsgCause(ApiErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            // Codes used by the ecobee API for expired and revoked tokens
            ApiError::Api(14, _) | ApiError::Api(16, _) => ApiErrorKind::Auth,
            ApiError::Api(_, _) => ApiErrorKind::Api,
            ApiError::KindMsg(kind, _) => *kind,
            ApiError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Api(code, msg) => write!(f, "ecobee API error {}: {}", code, msg),
            ApiError::KindMsg(_, msg) => msg.fmt(f),
            ApiError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// How a `Selection` picks thermostats: every thermostat registered to the
/// account or an explicit comma-separated list of identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionType {
    Registered,
    Thermostats,
}

impl Default for SelectionType {
    fn default() -> Self {
        SelectionType::Registered
    }
}

/// Which thermostats to operate on and which blocks of data the API should
/// include for each of them.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub selection_type: SelectionType,
    pub selection_match: String,
    pub include_runtime: bool,
    pub include_sensors: bool,
    pub include_settings: bool,
    pub include_equipment_status: bool,
}

/// Live state of a thermostat. Temperatures are in tenths of a degree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Runtime {
    pub connected: bool,
    pub actual_temperature: i64,
    pub actual_humidity: i64,
    pub desired_heat: i64,
    pub desired_cool: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub hvac_mode: String,
}

/// Single typed reading reported by a remote sensor. Values are strings on
/// the wire no matter the type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SensorCapability {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteSensor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub in_use: bool,
    pub capability: Vec<SensorCapability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thermostat {
    pub identifier: String,
    pub name: String,
    pub runtime: Runtime,
    pub settings: Settings,
    pub remote_sensors: Vec<RemoteSensor>,
}

/// Equipment currently running on a thermostat, parsed from the
/// comma-separated status list of a thermostat summary response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EquipmentStatus {
    pub heat_pump: bool,
    pub heat_pump2: bool,
    pub heat_pump3: bool,
    pub comp_cool1: bool,
    pub comp_cool2: bool,
    pub aux_heat1: bool,
    pub aux_heat2: bool,
    pub aux_heat3: bool,
    pub fan: bool,
    pub humidifier: bool,
    pub dehumidifier: bool,
    pub ventilator: bool,
    pub economizer: bool,
    pub comp_hot_water: bool,
    pub aux_hot_water: bool,
}

impl EquipmentStatus {
    /// Parse the comma-separated list of running equipment from a summary
    /// status entry. An empty string means nothing is running.
    pub fn from_csv(csv: &str) -> Self {
        let mut status = EquipmentStatus::default();

        for token in csv.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "heatPump" => status.heat_pump = true,
                "heatPump2" => status.heat_pump2 = true,
                "heatPump3" => status.heat_pump3 = true,
                "compCool1" => status.comp_cool1 = true,
                "compCool2" => status.comp_cool2 = true,
                "auxHeat1" => status.aux_heat1 = true,
                "auxHeat2" => status.aux_heat2 = true,
                "auxHeat3" => status.aux_heat3 = true,
                "fan" => status.fan = true,
                "humidifier" => status.humidifier = true,
                "dehumidifier" => status.dehumidifier = true,
                "ventilator" => status.ventilator = true,
                "economizer" => status.economizer = true,
                "compHotWater" => status.comp_hot_water = true,
                "auxHotWater" => status.aux_hot_water = true,
                unknown => {
                    tracing::debug!(message = "unrecognized equipment in status list", equipment = unknown);
                }
            }
        }

        status
    }
}

/// Condensed per-thermostat state from a thermostat summary request.
#[derive(Debug, Clone, Default)]
pub struct ThermostatSummary {
    pub identifier: String,
    pub name: String,
    pub connected: bool,
    pub equipment_status: EquipmentStatus,
}

/// Abstraction around the ecobee API to allow for easier testing.
///
/// Implementations must be safe for concurrent use, the exposition layer
/// does not serialize overlapping scrapes.
pub trait ThermostatApi: Send + Sync {
    /// Fetch the thermostats picked by the selection along with whichever
    /// data blocks its include flags request.
    fn thermostats(&self, selection: &Selection) -> Result<Vec<Thermostat>, ApiError>;

    /// Fetch the summary (revision and equipment status) of the thermostats
    /// picked by the selection.
    fn thermostat_summary(&self, selection: &Selection) -> Result<Vec<ThermostatSummary>, ApiError>;
}

impl<T> ThermostatApi for Arc<T>
where
    T: ThermostatApi + ?Sized,
{
    fn thermostats(&self, selection: &Selection) -> Result<Vec<Thermostat>, ApiError> {
        (**self).thermostats(selection)
    }

    fn thermostat_summary(&self, selection: &Selection) -> Result<Vec<ThermostatSummary>, ApiError> {
        (**self).thermostat_summary(selection)
    }
}

#[cfg(test)]
mod test {
    use super::{ApiError, ApiErrorKind, EquipmentStatus, Selection, SelectionType};

    #[test]
    fn test_equipment_status_empty() {
        let status = EquipmentStatus::from_csv("");
        assert_eq!(EquipmentStatus::default(), status);
    }

    #[test]
    fn test_equipment_status_single() {
        let status = EquipmentStatus::from_csv("fan");

        assert!(status.fan);
        assert!(!status.heat_pump);
        assert!(!status.comp_cool1);
        assert!(!status.aux_heat1);
    }

    #[test]
    fn test_equipment_status_multiple() {
        let status = EquipmentStatus::from_csv("fan,compCool1,heatPump");

        assert!(status.fan);
        assert!(status.comp_cool1);
        assert!(status.heat_pump);
        assert!(!status.aux_heat1);
        assert!(!status.comp_cool2);
    }

    #[test]
    fn test_equipment_status_unknown_equipment() {
        let status = EquipmentStatus::from_csv("fan,futureEquipment");

        assert!(status.fan);
        assert_eq!(EquipmentStatus { fan: true, ..EquipmentStatus::default() }, status);
    }

    #[test]
    fn test_selection_serialize() {
        let selection = Selection {
            selection_type: SelectionType::Thermostats,
            selection_match: "111,222".to_owned(),
            include_equipment_status: true,
            ..Selection::default()
        };

        let json = serde_json::to_string(&selection).unwrap();

        assert!(json.contains(r#""selectionType":"thermostats""#));
        assert!(json.contains(r#""selectionMatch":"111,222""#));
        assert!(json.contains(r#""includeEquipmentStatus":true"#));
        assert!(json.contains(r#""includeRuntime":false"#));
    }

    #[test]
    fn test_api_error_kind_from_status_code() {
        let expired = ApiError::Api(14, "token expired".to_owned());
        let other = ApiError::Api(3, "bad request".to_owned());

        assert_eq!(ApiErrorKind::Auth, expired.kind());
        assert_eq!(ApiErrorKind::Api, other.kind());
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::KindMsg(ApiErrorKind::Transport, "connection reset");
        assert_eq!("connection reset", err.to_string());

        let err = ApiError::Api(3, "bad request".to_owned());
        assert_eq!("ecobee API error 3: bad request", err.to_string());
    }
}
