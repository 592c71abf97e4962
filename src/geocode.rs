use anyhow::{Context, Result, bail};
use csv::Writer;
use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use tokio::sync::Mutex;

use crate::common::{commit_tmp_file, ensure_parent_dir, tmp_path_for};
use crate::model::AddressRecord;
use crate::states::StateDictionary;

#[derive(Debug, Clone)]
pub struct GeocodeConfig {
    pub token_url: String,
    pub geocode_url: String,
    pub bearer_token: String,
    pub max_concurrent: usize,
    pub request_timeout: Duration,
}

/// One persisted address joined with its state code, keyed by fingerprint.
#[derive(Debug, Clone)]
pub struct GeocodeTarget {
    pub address_hash: u64,
    pub address: String,
    pub city: String,
    pub state_code: String,
    pub zip_code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodedAddress {
    pub address_hash: u64,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    coordinate: Coordinate,
}

#[derive(Debug, Deserialize)]
struct Coordinate {
    latitude: f64,
    longitude: f64,
}

/// Join persisted addresses with the state dictionary. Rows whose state id
/// is unknown are dropped with a warning and counted.
pub fn geocode_targets(
    addresses: &[AddressRecord],
    states: &StateDictionary,
) -> (Vec<GeocodeTarget>, usize) {
    let mut targets = Vec::with_capacity(addresses.len());
    let mut skipped = 0usize;
    for address in addresses {
        let Some(state_code) = states.code_for(address.state_id) else {
            println!(
                "Warning: state id {} for address {} not found in states table",
                address.state_id, address.address_id
            );
            skipped += 1;
            continue;
        };
        targets.push(GeocodeTarget {
            address_hash: address.address_hash,
            address: address.address.clone(),
            city: address.city.clone(),
            state_code: state_code.to_string(),
            zip_code: address.zip_code.clone(),
        });
    }
    (targets, skipped)
}

async fn fetch_access_token(client: &Client, config: &GeocodeConfig) -> Result<String> {
    let response = client
        .post(&config.token_url)
        .bearer_auth(&config.bearer_token)
        .send()
        .await
        .context("Token request failed")?;
    if !response.status().is_success() {
        bail!("Error obtaining access token: HTTP {}", response.status());
    }
    let token: TokenResponse = response
        .json()
        .await
        .context("Failed parsing token response")?;
    Ok(token.access_token)
}

fn parse_coordinates(hash: u64, response: GeocodeResponse) -> Option<GeocodedAddress> {
    let first = response.results.into_iter().next()?;
    Some(GeocodedAddress {
        address_hash: hash,
        latitude: first.coordinate.latitude,
        longitude: first.coordinate.longitude,
    })
}

async fn send_geocode(
    client: &Client,
    config: &GeocodeConfig,
    token: &str,
    query: &str,
) -> reqwest::Result<reqwest::Response> {
    client
        .get(&config.geocode_url)
        .query(&[("q", query)])
        .bearer_auth(token)
        .timeout(config.request_timeout)
        .send()
        .await
}

/// Geocode one address. A 401 refreshes the access token and retries the
/// request exactly once; every other failure drops the address.
async fn geocode_one(
    client: &Client,
    config: &GeocodeConfig,
    token: &Mutex<String>,
    target: &GeocodeTarget,
) -> Option<GeocodedAddress> {
    let query = format!(
        "{}, {}, {}, {}",
        target.address, target.city, target.state_code, target.zip_code
    );

    let current_token = token.lock().await.clone();
    let mut response = match send_geocode(client, config, &current_token, &query).await {
        Ok(response) => response,
        Err(err) => {
            println!("Request failed for address {query}: {err}");
            return None;
        }
    };

    if response.status() == StatusCode::UNAUTHORIZED {
        println!("Token expired for address {query}, refreshing token.");
        let refreshed = match fetch_access_token(client, config).await {
            Ok(refreshed) => refreshed,
            Err(err) => {
                println!("Error refreshing token for address {query}: {err}");
                return None;
            }
        };
        *token.lock().await = refreshed.clone();
        response = match send_geocode(client, config, &refreshed, &query).await {
            Ok(response) => response,
            Err(err) => {
                println!("Request failed for address {query}: {err}");
                return None;
            }
        };
    }

    if !response.status().is_success() {
        println!(
            "Error fetching data for address {query}: HTTP {}",
            response.status()
        );
        return None;
    }
    let parsed: GeocodeResponse = match response.json().await {
        Ok(parsed) => parsed,
        Err(err) => {
            println!("Error decoding response for address {query}: {err}");
            return None;
        }
    };
    let result = parse_coordinates(target.address_hash, parsed);
    if result.is_none() {
        println!("Error geocoding address {query}: no results");
    }
    result
}

fn apply_geocode_progress_style(progress: &ProgressBar) {
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.cyan/blue}] \
{pos}/{len} ({percent}%) {per_sec} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
}

/// Geocode the target batch in fixed-size chunks with every request in a
/// chunk in flight concurrently.
pub async fn geocode_addresses(
    client: &Client,
    config: &GeocodeConfig,
    targets: &[GeocodeTarget],
) -> Result<Vec<GeocodedAddress>> {
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let token = Mutex::new(fetch_access_token(client, config).await?);
    let chunk_size = config.max_concurrent.max(1);

    let progress = ProgressBar::new(targets.len() as u64);
    progress.set_prefix("GEOCODE");
    apply_geocode_progress_style(&progress);
    progress.enable_steady_tick(Duration::from_millis(250));

    let mut results = Vec::new();
    for chunk in targets.chunks(chunk_size) {
        let mut in_flight = FuturesUnordered::new();
        for target in chunk {
            in_flight.push(geocode_one(client, config, &token, target));
        }
        while let Some(result) = in_flight.next().await {
            progress.inc(1);
            if let Some(geocoded) = result {
                results.push(geocoded);
            }
        }
    }
    progress.finish_with_message(format!(
        "geocoded {}/{} addresses",
        results.len(),
        targets.len()
    ));
    Ok(results)
}

pub fn write_geocoded_csv(path: &Path, results: &[GeocodedAddress]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path);
    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    writer
        .write_record(["address_hash", "latitude", "longitude"])
        .context("Failed writing geocoded header")?;
    for result in results {
        writer
            .write_record([
                result.address_hash.to_string(),
                result.latitude.to_string(),
                result.longitude.to_string(),
            ])
            .with_context(|| format!("Failed writing geocoded row {}", result.address_hash))?;
    }
    writer.flush().context("Failed flushing geocoded writer")?;
    commit_tmp_file(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_join_state_codes_and_skip_unknown_ids() {
        let mut states = StateDictionary::default();
        let il = states.get_or_create("IL");
        let known = AddressRecord {
            address_id: 1,
            npi: None,
            ccn: Some("123456".to_string()),
            address: "123 Main St".to_string(),
            city: "Springfield".to_string(),
            state_id: il,
            zip_code: "62704".to_string(),
            cms_addr_id: None,
            address_hash: 500,
            primary_practice_address: false,
        };
        let mut unknown = known.clone();
        unknown.address_id = 2;
        unknown.state_id = 99;

        let (targets, skipped) = geocode_targets(&[known, unknown], &states);
        assert_eq!(targets.len(), 1);
        assert_eq!(skipped, 1);
        assert_eq!(targets[0].state_code, "IL");
        assert_eq!(targets[0].address_hash, 500);
    }

    #[test]
    fn response_parsing_takes_first_coordinate() {
        let body = r#"{
            "results": [
                {"coordinate": {"latitude": 39.8, "longitude": -89.64}},
                {"coordinate": {"latitude": 0.0, "longitude": 0.0}}
            ]
        }"#;
        let parsed: GeocodeResponse = serde_json::from_str(body).expect("parse");
        let geocoded = parse_coordinates(500, parsed).expect("coordinates");
        assert_eq!(geocoded.latitude, 39.8);
        assert_eq!(geocoded.longitude, -89.64);
    }

    #[test]
    fn empty_results_yield_none() {
        let parsed: GeocodeResponse = serde_json::from_str(r#"{"results": []}"#).expect("parse");
        assert!(parse_coordinates(500, parsed).is_none());
        let parsed: GeocodeResponse = serde_json::from_str("{}").expect("parse");
        assert!(parse_coordinates(500, parsed).is_none());
    }
}
