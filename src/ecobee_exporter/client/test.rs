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

#![cfg(test)]

use crate::client::core::{ApiError, ApiErrorKind, Selection, Thermostat, ThermostatApi, ThermostatSummary};
use std::sync::Mutex;

/// ThermostatApi implementation returning canned results, recording the
/// selection used for each call. `None` for either result means that call
/// fails with a transport error.
pub(crate) struct MockApi {
    thermostats: Option<Vec<Thermostat>>,
    summaries: Option<Vec<ThermostatSummary>>,
    thermostat_selections: Mutex<Vec<Selection>>,
    summary_selections: Mutex<Vec<Selection>>,
}

impl MockApi {
    pub(crate) fn new(thermostats: Option<Vec<Thermostat>>, summaries: Option<Vec<ThermostatSummary>>) -> Self {
        MockApi {
            thermostats,
            summaries,
            thermostat_selections: Mutex::new(Vec::new()),
            summary_selections: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn thermostat_selections(&self) -> Vec<Selection> {
        self.thermostat_selections.lock().unwrap().clone()
    }

    pub(crate) fn summary_selections(&self) -> Vec<Selection> {
        self.summary_selections.lock().unwrap().clone()
    }
}

impl ThermostatApi for MockApi {
    fn thermostats(&self, selection: &Selection) -> Result<Vec<Thermostat>, ApiError> {
        self.thermostat_selections.lock().unwrap().push(selection.clone());

        match &self.thermostats {
            Some(thermostats) => Ok(thermostats.clone()),
            None => Err(ApiError::KindMsg(ApiErrorKind::Transport, "mock thermostat fetch failure")),
        }
    }

    fn thermostat_summary(&self, selection: &Selection) -> Result<Vec<ThermostatSummary>, ApiError> {
        self.summary_selections.lock().unwrap().push(selection.clone());

        match &self.summaries {
            Some(summaries) => Ok(summaries.clone()),
            None => Err(ApiError::KindMsg(ApiErrorKind::Transport, "mock summary fetch failure")),
        }
    }
}
