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

//! Export ecobee thermostat and remote sensor readings as Prometheus metrics.
//!
//! ## Features
//!
//! `ecobee_exporter` fetches the state of every thermostat registered to an ecobee
//! account using the [ecobee API](https://www.ecobee.com/home/developer/api/documentation/v1/index.shtml)
//! and exports it as Prometheus metrics. The state is fetched on demand, each scrape
//! makes two API calls (one for the thermostats themselves, one for the equipment
//! status summary).
//!
//! The following metrics are exported:
//!
//! * `ecobee_fetch_time` - Elapsed time, in seconds, fetching data via the ecobee API.
//! * `ecobee_actual_temperature{thermostat_id, thermostat_name}` - Thermostat-averaged
//!   current temperature.
//! * `ecobee_target_temperature_max{thermostat_id, thermostat_name}` - Maximum temperature
//!   for the thermostat to maintain.
//! * `ecobee_target_temperature_min{thermostat_id, thermostat_name}` - Minimum temperature
//!   for the thermostat to maintain.
//! * `ecobee_temperature{thermostat_id, thermostat_name, sensor_id, sensor_name, sensor_type}` -
//!   Temperature reported by a remote sensor, in degrees.
//! * `ecobee_humidity{thermostat_id, thermostat_name, sensor_id, sensor_name, sensor_type}` -
//!   Humidity reported by a remote sensor, in percent.
//! * `ecobee_occupancy{thermostat_id, thermostat_name, sensor_id, sensor_name, sensor_type}` -
//!   Occupancy reported by a remote sensor (0 or 1).
//! * `ecobee_in_use{thermostat_id, thermostat_name, sensor_id, sensor_name, sensor_type}` -
//!   Is the sensor being used in thermostat calculations (0 or 1).
//! * `ecobee_currenthvacmode{thermostat_id, thermostat_name, current_hvac_mode}` - Current
//!   hvac mode of the thermostat, carried by the `current_hvac_mode` label.
//! * `ecobee_fan_status{thermostat_id, thermostat_name}` - Current status of the fan (0 or 1).
//! * `ecobee_mode{thermostat_id, thermostat_name, mode}` - Whether the `cool`, `heat`, or
//!   `aux` equipment is currently running (0 or 1 for each).
//!
//! The metric name prefix (`ecobee` above) is configurable.
//!
//! ## Build
//!
//! `ecobee_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/ecobee_exporter.git && cd ecobee_exporter
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Application key
//!
//! Talking to the ecobee API requires an application key, created under the
//! `Developer` panel of the ecobee consumer portal after joining the developer
//! program. The key is passed to the exporter with the `--app-key` flag.
//!
//! ### Authorization
//!
//! On first use, the exporter must be authorized against your ecobee account
//! using the ecobee PIN flow. Run the exporter once with `--authorize`: it prints
//! a PIN for you to add under `My Apps` on the consumer portal, waits for the PIN
//! to be registered, writes the resulting OAuth tokens to the token file, and
//! exits.
//!
//! ```text
//! ./ecobee_exporter --app-key YOUR_APP_KEY --authorize
//! ```
//!
//! After that, run it without `--authorize` to serve metrics. Tokens are
//! refreshed automatically and persisted to the token file (`--token-file`,
//! `/tmp/ecobee-tokens.json` by default) as they change.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9098` at `/metrics`. Once
//! `ecobee_exporter` is running, configure scrapes of it by your Prometheus
//! server. Add the host running `ecobee_exporter` as a target under the
//! Prometheus `scrape_configs` section as described by the example below.
//!
//! **NOTE**: every scrape makes two calls to the ecobee API, and the API only
//! refreshes thermostat data every few minutes. Scraping more often than `1m`
//! has no benefit and burns through the API rate limit.
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! global:
//!   scrape_interval:     1m
//!   evaluation_interval: 1m
//!   external_labels:
//!     monitor: 'my_prom'
//!
//! scrape_configs:
//!   - job_name: ecobee
//!     static_configs:
//!       - targets: ['example:9098']
//! ```
//!

pub mod client;
pub mod http;
pub mod metrics;
