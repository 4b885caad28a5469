// src/sources/client.rs
//
// Remote recording served by a data server over HTTP/JSON.
//   GET  {base}/recording  -> RecordingInfo
//   POST {base}/data       -> { "channels": { name: [value | null, ...] } }
// Null samples (gaps) decode to NaN.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{resolve_channels, DataSource};
use crate::error::SourceError;
use crate::types::{ChannelSamples, RecordingInfo, TimeRange};

#[derive(Debug, Serialize)]
struct DataRequest<'a> {
    channels: &'a [String],
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct DataResponse {
    channels: BTreeMap<String, Vec<Option<f64>>>,
}

pub struct ClientSource {
    base_url: String,
    client: reqwest::Client,
    info: RecordingInfo,
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder()
        .user_agent("sigview-buffer")
        .timeout(timeout)
        .build()?)
}

/// Convert a server payload into sample arrays, checking every requested channel is present.
fn decode_response(
    response: DataResponse,
    channels: &[String],
) -> Result<ChannelSamples, SourceError> {
    let mut payload = response.channels;
    let mut out = ChannelSamples::new();
    for name in channels {
        let values = payload.remove(name).ok_or_else(|| {
            SourceError::Decode(format!("server response is missing channel '{}'", name))
        })?;
        out.insert(
            name.clone(),
            values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect(),
        );
    }
    Ok(out)
}

impl ClientSource {
    /// Connect to a data server and fetch its recording metadata.
    pub async fn connect(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = build_client(timeout)?;

        let response = client
            .get(endpoint(base_url, "recording"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "Data server returned status: {}",
                response.status()
            )));
        }
        let info: RecordingInfo = response.json().await?;

        tlog!(
            "[ClientSource] Connected to {} ({} channels)",
            base_url,
            info.channels.len()
        );

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            info,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl DataSource for ClientSource {
    fn recording_info(&self) -> &RecordingInfo {
        &self.info
    }

    fn kind(&self) -> &'static str {
        "client"
    }

    async fn get_data(
        &self,
        channels: &[String],
        range: TimeRange,
    ) -> Result<ChannelSamples, SourceError> {
        resolve_channels(&self.info, channels)?;

        let response = self
            .client
            .post(endpoint(&self.base_url, "data"))
            .json(&DataRequest {
                channels,
                start: range.start,
                end: range.end,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "Data server returned status: {}",
                response.status()
            )));
        }

        let payload: DataResponse = response.json().await?;
        decode_response(payload, channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_paths() {
        assert_eq!(endpoint("http://host:8080", "data"), "http://host:8080/data");
        assert_eq!(endpoint("http://host:8080/api/", "recording"), "http://host:8080/api/recording");
    }

    #[test]
    fn test_decode_nulls_as_nan() {
        let response: DataResponse =
            serde_json::from_str(r#"{"channels": {"A": [1.0, null, 3.5], "B": []}}"#).unwrap();
        let out = decode_response(response, &["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(out["A"][0], 1.0);
        assert!(out["A"][1].is_nan());
        assert_eq!(out["A"][2], 3.5);
        assert!(out["B"].is_empty());
    }

    #[test]
    fn test_decode_missing_channel() {
        let response: DataResponse = serde_json::from_str(r#"{"channels": {"A": [1.0]}}"#).unwrap();
        assert!(matches!(
            decode_response(response, &["B".to_string()]),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let channels = vec!["A".to_string()];
        let body = serde_json::to_value(DataRequest {
            channels: &channels,
            start: 10,
            end: 20,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"channels": ["A"], "start": 10, "end": 20}));
    }

    #[test]
    fn test_recording_info_decodes_with_defaults() {
        let info: RecordingInfo = serde_json::from_str(
            r#"{"recording_start": 0, "recording_end": 1000,
                "channels": [{"name": "A", "fs": 256.0}]}"#,
        )
        .unwrap();
        assert_eq!(info.channels[0].ufact, 1.0);
        assert!(info.channels[0].discontinuities.is_empty());
    }
}
