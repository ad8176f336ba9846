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

use crate::client::core::{
    ApiError, ApiErrorKind, EquipmentStatus, Selection, Thermostat, ThermostatApi, ThermostatSummary,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const API_URL: &str = "https://api.ecobee.com";
const THERMOSTAT_PATH: &str = "/1/thermostat";
const SUMMARY_PATH: &str = "/1/thermostatSummary";
const TOKEN_PATH: &str = "/token";
const AUTHORIZE_PATH: &str = "/authorize";

const PIN_SCOPE: &str = "smartRead";
const REFRESH_MARGIN_SECS: u64 = 60;
const DEFAULT_PIN_INTERVAL_SECS: u64 = 30;
const DEFAULT_PIN_EXPIRY_SECS: u64 = 900;

/// OAuth tokens for the ecobee API, persisted between runs via a `TokenStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: u64,
}

impl Tokens {
    /// True if the access token is expired (or close enough to expiry that a
    /// request made with it might be rejected) at the given UNIX timestamp.
    fn is_expired_at(&self, now: u64) -> bool {
        now + REFRESH_MARGIN_SECS >= self.expires_at
    }
}

/// Reads and writes `Tokens` as JSON at a fixed path.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: &Path) -> Self {
        TokenStore { path: path.to_owned() }
    }

    fn load(&self) -> Result<Tokens, ApiError> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Auth, "unable to read token file", Box::new(e)))?;

        serde_json::from_str(&contents)
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Auth, "unable to decode token file", Box::new(e)))
    }

    fn save(&self, tokens: &Tokens) -> Result<(), ApiError> {
        let contents = serde_json::to_string_pretty(tokens)
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Auth, "unable to encode token file", Box::new(e)))?;

        fs::write(&self.path, contents)
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Auth, "unable to write token file", Box::new(e)))
    }
}

/// Successful response from the token endpoint for either the refresh-token
/// or PIN grant.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

impl TokenResponse {
    fn into_tokens(self, now: u64) -> Tokens {
        Tokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: now + self.expires_in,
        }
    }
}

/// Error response from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.error_description)
    }
}

impl Error for TokenError {}

// The authorize endpoint mixes naming conventions: the PIN field is
// camelCase while the expiry fields are snake_case.
#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "ecobeePin")]
    ecobee_pin: String,
    code: String,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiStatus {
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThermostatResponse {
    #[serde(default)]
    thermostat_list: Vec<Thermostat>,
    status: ApiStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryResponse {
    #[serde(default)]
    revision_list: Vec<String>,
    #[serde(default)]
    status_list: Vec<String>,
    status: ApiStatus,
}

impl SummaryResponse {
    /// Join the revision and status lists into one record per thermostat.
    ///
    /// Each revision entry is a colon-separated list starting with the
    /// thermostat identifier, name, and connectivity flag. Each status entry
    /// is an identifier followed by a colon and a comma-separated list of
    /// running equipment. A thermostat with no status entry (possible if it
    /// was deregistered between two API calls) is treated as having no
    /// equipment running. Malformed entries are logged and skipped.
    fn into_summaries(self) -> Vec<ThermostatSummary> {
        let mut equipment = HashMap::with_capacity(self.status_list.len());
        for entry in &self.status_list {
            match entry.split_once(':') {
                Some((id, csv)) => {
                    equipment.insert(id.to_owned(), EquipmentStatus::from_csv(csv));
                }
                None => {
                    tracing::error!(message = "malformed summary status entry", entry = %entry);
                }
            }
        }

        let mut summaries = Vec::with_capacity(self.revision_list.len());
        for entry in &self.revision_list {
            let fields: Vec<&str> = entry.split(':').collect();
            if fields.len() < 3 {
                tracing::error!(message = "malformed summary revision entry", entry = %entry);
                continue;
            }

            summaries.push(ThermostatSummary {
                identifier: fields[0].to_owned(),
                name: fields[1].to_owned(),
                connected: fields[2] == "true",
                equipment_status: equipment.remove(fields[0]).unwrap_or_default(),
            });
        }

        summaries
    }
}

#[derive(Debug, Serialize)]
struct SelectionRequest<'a> {
    selection: &'a Selection,
}

/// Client for the ecobee API using an application key and OAuth tokens
/// persisted in a token file.
///
/// The access token is refreshed as needed before requests and refreshed
/// tokens are written back to the token file. Requests block the calling
/// thread, callers in async contexts must run them on a blocking thread.
/// The client is safe for concurrent use.
pub struct EcobeeClient {
    http: reqwest::blocking::Client,
    base_url: String,
    app_key: String,
    store: TokenStore,
    tokens: Mutex<Option<Tokens>>,
}

impl EcobeeClient {
    pub fn new(app_key: &str, token_file: &Path) -> Result<Self, ApiError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("ecobee_exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Transport, "unable to build HTTP client", Box::new(e)))?;

        Ok(EcobeeClient {
            http,
            base_url: API_URL.to_owned(),
            app_key: app_key.to_owned(),
            store: TokenStore::new(token_file),
            tokens: Mutex::new(None),
        })
    }

    /// Run the ecobee PIN authorization flow: request a PIN, wait for the
    /// user to register it on the ecobee portal, then persist the resulting
    /// tokens to the token file.
    ///
    /// This is interactive, it prints the PIN to stdout and blocks, polling
    /// the token endpoint, until the PIN is registered or expires.
    pub fn authorize(&self) -> Result<(), ApiError> {
        let pin: PinResponse = self
            .http
            .get(format!("{}{}", self.base_url, AUTHORIZE_PATH))
            .query(&[
                ("response_type", "ecobeePin"),
                ("client_id", self.app_key.as_str()),
                ("scope", PIN_SCOPE),
            ])
            .send()
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Transport, "PIN request failed", Box::new(e)))?
            .json()
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Decode, "unable to decode PIN response", Box::new(e)))?;

        println!("ecobee PIN: {}", pin.ecobee_pin);
        println!("Add this PIN under My Apps on the ecobee consumer portal. Waiting for it to be registered...");

        let interval = if pin.interval > 0 { pin.interval } else { DEFAULT_PIN_INTERVAL_SECS };
        let expires_in = if pin.expires_in > 0 { pin.expires_in } else { DEFAULT_PIN_EXPIRY_SECS };
        let deadline = now_secs() + expires_in;

        loop {
            thread::sleep(Duration::from_secs(interval));

            let body = self
                .token_request(&[
                    ("grant_type", "ecobeePin"),
                    ("code", pin.code.as_str()),
                    ("client_id", self.app_key.as_str()),
                ])?;

            match serde_json::from_str::<TokenResponse>(&body) {
                Ok(res) => {
                    let tokens = res.into_tokens(now_secs());
                    self.store.save(&tokens)?;
                    *self.tokens.lock().unwrap() = Some(tokens);
                    println!("Authorization complete");
                    return Ok(());
                }
                Err(_) => match serde_json::from_str::<TokenError>(&body) {
                    Ok(e) if e.error == "authorization_pending" || e.error == "slow_down" => {
                        if now_secs() >= deadline {
                            return Err(ApiError::KindMsg(
                                ApiErrorKind::Auth,
                                "PIN expired before it was registered",
                            ));
                        }
                    }
                    Ok(e) => {
                        return Err(ApiError::KindMsgCause(
                            ApiErrorKind::Auth,
                            "PIN authorization rejected",
                            Box::new(e),
                        ));
                    }
                    Err(e) => {
                        return Err(ApiError::KindMsgCause(
                            ApiErrorKind::Decode,
                            "unable to decode token response",
                            Box::new(e),
                        ));
                    }
                },
            }
        }
    }

    fn token_request(&self, params: &[(&str, &str)]) -> Result<String, ApiError> {
        self.http
            .post(format!("{}{}", self.base_url, TOKEN_PATH))
            .form(params)
            .send()
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Transport, "token request failed", Box::new(e)))?
            .text()
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Transport, "unable to read token response", Box::new(e)))
    }

    fn refresh(&self, tokens: &Tokens) -> Result<Tokens, ApiError> {
        let body = self.token_request(&[
            ("grant_type", "refresh_token"),
            ("code", tokens.refresh_token.as_str()),
            ("client_id", self.app_key.as_str()),
        ])?;

        match serde_json::from_str::<TokenResponse>(&body) {
            Ok(res) => Ok(res.into_tokens(now_secs())),
            Err(_) => match serde_json::from_str::<TokenError>(&body) {
                Ok(e) => Err(ApiError::KindMsgCause(
                    ApiErrorKind::Auth,
                    "token refresh rejected",
                    Box::new(e),
                )),
                Err(e) => Err(ApiError::KindMsgCause(
                    ApiErrorKind::Decode,
                    "unable to decode token response",
                    Box::new(e),
                )),
            },
        }
    }

    /// Return a valid access token, loading tokens from the token file on
    /// first use and refreshing them when expired.
    fn access_token(&self) -> Result<String, ApiError> {
        let mut guard = self.tokens.lock().unwrap();
        let tokens = match guard.as_ref() {
            Some(tokens) => tokens.clone(),
            None => {
                let tokens = self.store.load()?;
                *guard = Some(tokens.clone());
                tokens
            }
        };

        if !tokens.is_expired_at(now_secs()) {
            return Ok(tokens.access_token);
        }

        tracing::debug!(message = "refreshing expired ecobee access token");
        let refreshed = self.refresh(&tokens)?;
        self.store.save(&refreshed)?;
        let access_token = refreshed.access_token.clone();
        *guard = Some(refreshed);

        Ok(access_token)
    }

    fn get_json<T>(&self, path: &str, selection: &Selection) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let token = self.access_token()?;
        let body = serde_json::to_string(&SelectionRequest { selection })
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Decode, "unable to encode selection", Box::new(e)))?;

        self.http
            .get(format!("{}{}", self.base_url, path))
            .query(&[("json", body.as_str())])
            .bearer_auth(&token)
            .send()
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Transport, "ecobee API request failed", Box::new(e)))?
            .json()
            .map_err(|e| ApiError::KindMsgCause(ApiErrorKind::Decode, "unable to decode ecobee API response", Box::new(e)))
    }
}

fn check_status(status: &ApiStatus) -> Result<(), ApiError> {
    if status.code != 0 {
        Err(ApiError::Api(status.code, status.message.clone()))
    } else {
        Ok(())
    }
}

impl ThermostatApi for EcobeeClient {
    fn thermostats(&self, selection: &Selection) -> Result<Vec<Thermostat>, ApiError> {
        let res: ThermostatResponse = self.get_json(THERMOSTAT_PATH, selection)?;
        check_status(&res.status)?;
        Ok(res.thermostat_list)
    }

    fn thermostat_summary(&self, selection: &Selection) -> Result<Vec<ThermostatSummary>, ApiError> {
        let res: SummaryResponse = self.get_json(SUMMARY_PATH, selection)?;
        check_status(&res.status)?;
        Ok(res.into_summaries())
    }
}

impl fmt::Debug for EcobeeClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcobeeClient")
            .field("base_url", &self.base_url)
            .field("store", &self.store)
            .finish()
    }
}

/// Seconds since the UNIX epoch, zero if the system clock is before it.
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::{ApiStatus, SummaryResponse, TokenResponse, Tokens, REFRESH_MARGIN_SECS};
    use crate::client::core::ApiErrorKind;

    fn summary_response(revision_list: Vec<&str>, status_list: Vec<&str>) -> SummaryResponse {
        SummaryResponse {
            revision_list: revision_list.into_iter().map(str::to_owned).collect(),
            status_list: status_list.into_iter().map(str::to_owned).collect(),
            status: ApiStatus {
                code: 0,
                message: String::new(),
            },
        }
    }

    #[test]
    fn test_summaries_join_revision_and_status() {
        let res = summary_response(
            vec!["111:Main Floor:true:rev1:rev2:rev3:rev4"],
            vec!["111:fan,compCool1"],
        );

        let summaries = res.into_summaries();

        assert_eq!(1, summaries.len());
        assert_eq!("111", summaries[0].identifier);
        assert_eq!("Main Floor", summaries[0].name);
        assert!(summaries[0].connected);
        assert!(summaries[0].equipment_status.fan);
        assert!(summaries[0].equipment_status.comp_cool1);
        assert!(!summaries[0].equipment_status.heat_pump);
    }

    #[test]
    fn test_summaries_missing_status_entry() {
        let res = summary_response(vec!["111:Main Floor:true:rev1"], vec![]);
        let summaries = res.into_summaries();

        assert_eq!(1, summaries.len());
        assert!(!summaries[0].equipment_status.fan);
        assert!(!summaries[0].equipment_status.comp_cool1);
    }

    #[test]
    fn test_summaries_malformed_revision_entry() {
        let res = summary_response(vec!["garbage", "222:Upstairs:false:rev1"], vec!["222:"]);
        let summaries = res.into_summaries();

        assert_eq!(1, summaries.len());
        assert_eq!("222", summaries[0].identifier);
        assert!(!summaries[0].connected);
    }

    #[test]
    fn test_tokens_expiry() {
        let tokens = Tokens {
            access_token: "access".to_owned(),
            refresh_token: "refresh".to_owned(),
            expires_at: 1000,
        };

        assert!(!tokens.is_expired_at(1000 - REFRESH_MARGIN_SECS - 1));
        assert!(tokens.is_expired_at(1000 - REFRESH_MARGIN_SECS));
        assert!(tokens.is_expired_at(2000));
    }

    #[test]
    fn test_token_response_into_tokens() {
        let res: TokenResponse = serde_json::from_str(
            r#"{"access_token": "access", "token_type": "Bearer", "expires_in": 3600, "refresh_token": "refresh", "scope": "smartRead"}"#,
        )
        .unwrap();

        let tokens = res.into_tokens(100);

        assert_eq!("access", tokens.access_token);
        assert_eq!("refresh", tokens.refresh_token);
        assert_eq!(3700, tokens.expires_at);
    }

    #[test]
    fn test_thermostat_response_decode() {
        let json = r#"{
            "page": {"page": 1, "totalPages": 1, "pageSize": 1, "total": 1},
            "thermostatList": [{
                "identifier": "111",
                "name": "Main Floor",
                "runtime": {
                    "connected": true,
                    "actualTemperature": 705,
                    "actualHumidity": 43,
                    "desiredHeat": 672,
                    "desiredCool": 789
                },
                "settings": {"hvacMode": "heat"},
                "remoteSensors": [{
                    "id": "rs:100",
                    "name": "Bedroom",
                    "type": "ecobee3_remote_sensor",
                    "inUse": true,
                    "capability": [
                        {"id": "1", "type": "temperature", "value": "725"},
                        {"id": "2", "type": "occupancy", "value": "true"}
                    ]
                }]
            }],
            "status": {"code": 0, "message": ""}
        }"#;

        let res: super::ThermostatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(0, res.status.code);

        let t = &res.thermostat_list[0];
        assert_eq!("111", t.identifier);
        assert!(t.runtime.connected);
        assert_eq!(705, t.runtime.actual_temperature);
        assert_eq!("heat", t.settings.hvac_mode);

        let s = &t.remote_sensors[0];
        assert_eq!("rs:100", s.id);
        assert!(s.in_use);
        assert_eq!("temperature", s.capability[0].kind);
        assert_eq!("725", s.capability[0].value);
    }

    #[test]
    fn test_check_status_error() {
        let status = ApiStatus {
            code: 14,
            message: "token expired".to_owned(),
        };

        let err = super::check_status(&status).unwrap_err();
        assert_eq!(ApiErrorKind::Auth, err.kind());
    }
}
