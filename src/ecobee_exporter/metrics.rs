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

use crate::client::{Selection, SelectionType, ThermostatApi};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::Instant;
use tokio::task;
use tracing::{span, Instrument, Level};

const NO_LABELS: &[&str] = &[];
const RUNTIME_LABELS: &[&str] = &["thermostat_id", "thermostat_name"];
const SENSOR_LABELS: &[&str] = &["thermostat_id", "thermostat_name", "sensor_id", "sensor_name", "sensor_type"];
const HVAC_MODE_LABELS: &[&str] = &["thermostat_id", "thermostat_name", "current_hvac_mode"];
const MODE_LABELS: &[&str] = &["thermostat_id", "thermostat_name", "mode"];

/// Key for each of the fixed metric families emitted by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKey {
    FetchTime,
    ActualTemperature,
    TargetTemperatureMax,
    TargetTemperatureMin,
    Temperature,
    Humidity,
    Occupancy,
    InUse,
    CurrentHvacMode,
    FanStatus,
    Mode,
}

impl MetricKey {
    pub const ALL: [MetricKey; 11] = [
        MetricKey::FetchTime,
        MetricKey::ActualTemperature,
        MetricKey::TargetTemperatureMax,
        MetricKey::TargetTemperatureMin,
        MetricKey::Temperature,
        MetricKey::Humidity,
        MetricKey::Occupancy,
        MetricKey::InUse,
        MetricKey::CurrentHvacMode,
        MetricKey::FanStatus,
        MetricKey::Mode,
    ];

    /// Name suffix, help text, and label schema for this key. Label values
    /// set on a family must be in the exact order declared here.
    fn schema(self) -> (&'static str, &'static str, &'static [&'static str]) {
        match self {
            MetricKey::FetchTime => ("fetch_time", "elapsed time fetching data via the ecobee API", NO_LABELS),
            MetricKey::ActualTemperature => {
                ("actual_temperature", "thermostat-averaged current temperature", RUNTIME_LABELS)
            }
            MetricKey::TargetTemperatureMax => (
                "target_temperature_max",
                "maximum temperature for thermostat to maintain",
                RUNTIME_LABELS,
            ),
            MetricKey::TargetTemperatureMin => (
                "target_temperature_min",
                "minimum temperature for thermostat to maintain",
                RUNTIME_LABELS,
            ),
            MetricKey::Temperature => ("temperature", "temperature reported by a sensor in degrees", SENSOR_LABELS),
            MetricKey::Humidity => ("humidity", "humidity reported by a sensor in percent", SENSOR_LABELS),
            MetricKey::Occupancy => ("occupancy", "occupancy reported by a sensor (0 or 1)", SENSOR_LABELS),
            MetricKey::InUse => (
                "in_use",
                "is sensor being used in thermostat calculations (0 or 1)",
                SENSOR_LABELS,
            ),
            MetricKey::CurrentHvacMode => ("currenthvacmode", "current hvac mode of thermostat", HVAC_MODE_LABELS),
            MetricKey::FanStatus => ("fan_status", "current status of the fan", RUNTIME_LABELS),
            MetricKey::Mode => ("mode", "current operating mode", MODE_LABELS),
        }
    }
}

/// Fixed set of gauge families for a metric prefix, built once and looked up
/// by `MetricKey` afterwards.
///
/// Note that Prometheus metrics must be unique! Don't register two of these
/// built with the same prefix into the same registry.
pub struct GaugeRegistry {
    gauges: HashMap<MetricKey, GaugeVec>,
}

impl GaugeRegistry {
    pub fn new(metric_prefix: &str) -> Self {
        let mut gauges = HashMap::with_capacity(MetricKey::ALL.len());

        for key in MetricKey::ALL {
            let (suffix, help, labels) = key.schema();
            let opts = Opts::new(format!("{}_{}", metric_prefix, suffix), help);
            let gauge = GaugeVec::new(opts, labels).expect("unable to declare gauge family");
            gauges.insert(key, gauge);
        }

        GaugeRegistry { gauges }
    }

    pub fn get(&self, key: MetricKey) -> &GaugeVec {
        &self.gauges[&key]
    }

    /// Descriptors of every gauge family owned by this registry.
    pub fn describe(&self) -> Vec<&Desc> {
        self.gauges.values().flat_map(|g| g.desc()).collect()
    }

    /// Drop all label children from every family. Series set during previous
    /// collection cycles do not survive a clear.
    pub fn clear(&self) {
        for gauge in self.gauges.values() {
            gauge.reset();
        }
    }

    /// Current contents of every gauge family owned by this registry.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.gauges.values().flat_map(|g| g.collect()).collect()
    }
}

fn bool_gauge(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

/// Prometheus Collector implementation that fetches thermostat and remote
/// sensor state from the ecobee API on every scrape.
///
/// Each collection cycle makes two API calls: one for the thermostats
/// themselves (runtime, settings, and sensor readings) and one for the
/// equipment status summary. If the first call fails nothing is emitted for
/// the cycle; if the second fails only the fetch time is emitted. Bad values
/// for a single sensor are logged and skipped without ending the cycle.
pub struct EcobeeMetrics {
    client: Box<dyn ThermostatApi>,
    gauges: GaugeRegistry,
}

impl EcobeeMetrics {
    pub fn new(client: Box<dyn ThermostatApi>, metric_prefix: &str) -> Self {
        EcobeeMetrics {
            client,
            gauges: GaugeRegistry::new(metric_prefix),
        }
    }
}

impl Collector for EcobeeMetrics {
    fn desc(&self) -> Vec<&Desc> {
        self.gauges.describe()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauges.clear();

        let start = Instant::now();
        let selection = Selection {
            selection_type: SelectionType::Registered,
            include_runtime: true,
            include_sensors: true,
            include_settings: true,
            ..Selection::default()
        };

        let thermostats = match self.client.thermostats(&selection) {
            Ok(thermostats) => thermostats,
            Err(e) => {
                tracing::error!(message = "unable to fetch thermostats", error = %e);
                return Vec::new();
            }
        };

        self.gauges
            .get(MetricKey::FetchTime)
            .with_label_values(&[])
            .set(start.elapsed().as_secs_f64());

        let ids = thermostats.iter().map(|t| t.identifier.as_str()).collect::<Vec<_>>();
        let selection = Selection {
            selection_type: SelectionType::Thermostats,
            selection_match: ids.join(","),
            include_equipment_status: true,
            ..Selection::default()
        };

        let summaries = match self.client.thermostat_summary(&selection) {
            Ok(summaries) => summaries,
            Err(e) => {
                tracing::error!(message = "unable to fetch thermostat summary", error = %e);
                return self.gauges.get(MetricKey::FetchTime).collect();
            }
        };

        for s in &summaries {
            let equipment = &s.equipment_status;
            let labels = [s.identifier.as_str(), s.name.as_str()];
            self.gauges
                .get(MetricKey::FanStatus)
                .with_label_values(&labels)
                .set(bool_gauge(equipment.fan));

            let mode = self.gauges.get(MetricKey::Mode);
            mode.with_label_values(&[labels[0], labels[1], "cool"])
                .set(bool_gauge(equipment.comp_cool1));
            mode.with_label_values(&[labels[0], labels[1], "heat"])
                .set(bool_gauge(equipment.heat_pump));
            mode.with_label_values(&[labels[0], labels[1], "aux"])
                .set(bool_gauge(equipment.aux_heat1));
        }

        for t in &thermostats {
            let runtime_labels = [t.identifier.as_str(), t.name.as_str()];

            // Runtime readings of a disconnected thermostat are stale, skip
            // them. Its remote sensors are still reported below.
            if t.runtime.connected {
                self.gauges
                    .get(MetricKey::ActualTemperature)
                    .with_label_values(&runtime_labels)
                    .set(t.runtime.actual_temperature as f64 / 10.0);
                self.gauges
                    .get(MetricKey::TargetTemperatureMax)
                    .with_label_values(&runtime_labels)
                    .set(t.runtime.desired_cool as f64 / 10.0);
                self.gauges
                    .get(MetricKey::TargetTemperatureMin)
                    .with_label_values(&runtime_labels)
                    .set(t.runtime.desired_heat as f64 / 10.0);
                // The mode is carried entirely by the label
                self.gauges
                    .get(MetricKey::CurrentHvacMode)
                    .with_label_values(&[runtime_labels[0], runtime_labels[1], t.settings.hvac_mode.as_str()])
                    .set(0.0);
            }

            for sensor in &t.remote_sensors {
                let sensor_labels = [
                    t.identifier.as_str(),
                    t.name.as_str(),
                    sensor.id.as_str(),
                    sensor.name.as_str(),
                    sensor.kind.as_str(),
                ];

                self.gauges
                    .get(MetricKey::InUse)
                    .with_label_values(&sensor_labels)
                    .set(bool_gauge(sensor.in_use));

                for capability in &sensor.capability {
                    match capability.kind.as_str() {
                        "temperature" => match capability.value.parse::<f64>() {
                            Ok(v) => {
                                self.gauges
                                    .get(MetricKey::Temperature)
                                    .with_label_values(&sensor_labels)
                                    .set(v / 10.0);
                            }
                            Err(e) => {
                                tracing::error!(
                                    message = "unable to parse sensor temperature",
                                    value = %capability.value,
                                    error = %e,
                                );
                            }
                        },
                        "humidity" => match capability.value.parse::<f64>() {
                            Ok(v) => {
                                self.gauges
                                    .get(MetricKey::Humidity)
                                    .with_label_values(&sensor_labels)
                                    .set(v);
                            }
                            Err(e) => {
                                tracing::error!(
                                    message = "unable to parse sensor humidity",
                                    value = %capability.value,
                                    error = %e,
                                );
                            }
                        },
                        "occupancy" => match capability.value.as_str() {
                            "true" => {
                                self.gauges
                                    .get(MetricKey::Occupancy)
                                    .with_label_values(&sensor_labels)
                                    .set(1.0);
                            }
                            "false" => {
                                self.gauges
                                    .get(MetricKey::Occupancy)
                                    .with_label_values(&sensor_labels)
                                    .set(0.0);
                            }
                            value => {
                                tracing::error!(message = "unknown sensor occupancy value", value = value);
                            }
                        },
                        kind => {
                            tracing::info!(message = "ignoring sensor capability", kind = kind);
                        }
                    }
                }
            }
        }

        self.gauges.gather()
    }
}

/// Error exposing Prometheus metrics in the text exposition format.
#[derive(Debug)]
pub enum ExpositionError {
    Runtime(&'static str, Box<dyn Error + Send + Sync + 'static>),
    Encoding(&'static str, Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Runtime(msg, ref e) => write!(f, "{}: {}", msg, e),
            ExpositionError::Encoding(msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Runtime(_, ref e) => Some(e.as_ref()),
            ExpositionError::Encoding(_, ref e) => Some(e.as_ref()),
        }
    }
}

/// Wrapper that exposes metrics from a Prometheus registry in the text exposition format.
///
/// This wrapper gathers all metrics from the registry in a separate thread, managed by the
/// tokio runtime in order to avoid blocking the future it is called from.
#[derive(Debug)]
pub struct MetricsExposition {
    registry: Registry,
}

impl MetricsExposition {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Collect all metrics from the registry and encode them in the Prometheus text exposition
    /// format, returning an error if metrics couldn't be collected or encoded for some reason.
    pub async fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let registry = self.registry.clone();

        // Registry::gather() calls the collect() method of each registered collector. Our
        // collector makes two blocking calls to the ecobee API. Since this code is called
        // in response to being scraped for metrics, it runs in the Hyper HTTP request path.
        // Run it in a thread pool below to avoid blocking the current future while the API
        // calls are made (network round trips, potentially a token refresh).
        task::spawn_blocking(move || {
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();

            tracing::debug!(
                message = "encoding metric families to text exposition format",
                num_metrics = metric_families.len(),
            );

            encoder
                .encode(&metric_families, &mut buffer)
                .map_err(|e| ExpositionError::Encoding("unable to encode Prometheus metrics", Box::new(e)))
                .map(|_| buffer)
        })
        .instrument(span!(Level::DEBUG, "ecobee_gather"))
        .await
        .map_err(|e| ExpositionError::Runtime("unable to gather Prometheus metrics", Box::new(e)))?
    }
}
