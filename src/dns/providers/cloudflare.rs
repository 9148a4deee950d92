//! Cloudflare, API token authentication.
//!
//! API documentation: <https://developers.cloudflare.com/api/resources/dns/subresources/records/>

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::dns::provider::{
    ApiSnafu, DnsProvider, DnsProviderError, DnsRecord, RequestSnafu, UnknownZoneSnafu,
    UnpublishedSnafu, http_client,
};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const NAME: &str = "cloudflare";

/// Cloudflare DNS.
#[derive(derive_more::Debug)]
pub struct CloudflareProvider {
    client: reqwest::Client,
    #[debug("***")]
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Serialize)]
struct NewRecord<'a> {
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    id: String,
}

impl CloudflareProvider {
    /// Creates the provider for an API `token` allowed to edit DNS.
    pub fn new(token: &str) -> Result<Self, DnsProviderError> {
        Ok(Self {
            client: http_client()?,
            token: token.to_string(),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, DnsProviderError> {
        let envelope: Envelope<T> = request
            .bearer_auth(&self.token)
            .send()
            .await
            .context(RequestSnafu { provider: NAME })?
            .json()
            .await
            .context(RequestSnafu { provider: NAME })?;
        match envelope.result {
            Some(result) if envelope.success => Ok(result),
            _ => {
                let message = envelope
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(ApiSnafu {
                    provider: NAME,
                    message,
                }
                .build())
            }
        }
    }

    async fn zone_id(&self, zone: &str) -> Result<String, DnsProviderError> {
        let zone = crate::dns::normalize(zone);
        let zones: Vec<Zone> = self
            .call(
                self.client
                    .get(format!("{API_BASE}/zones"))
                    .query(&[("name", zone.as_str())]),
            )
            .await?;
        zones
            .into_iter()
            .next()
            .map(|z| z.id)
            .ok_or_else(|| UnknownZoneSnafu { provider: NAME, zone }.build())
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn append_records(
        &self,
        zone: &str,
        records: &[DnsRecord],
    ) -> Result<Vec<DnsRecord>, DnsProviderError> {
        let zone_id = self.zone_id(zone).await?;
        let mut created = Vec::with_capacity(records.len());
        for record in records {
            let body = NewRecord {
                record_type: record.record_type.to_string(),
                name: record.fqdn(zone),
                content: &record.value,
                // 1 is "automatic"
                ttl: if record.ttl < 60 { 1 } else { record.ttl },
            };
            let res: CreatedRecord = self
                .call(
                    self.client
                        .post(format!("{API_BASE}/zones/{zone_id}/dns_records"))
                        .json(&body),
                )
                .await?;
            debug!(name = %body.name, id = %res.id, "cloudflare: record created");
            created.push(DnsRecord {
                id: Some(res.id),
                ..record.clone()
            });
        }
        Ok(created)
    }

    async fn delete_records(
        &self,
        zone: &str,
        records: &[DnsRecord],
    ) -> Result<(), DnsProviderError> {
        let zone_id = self.zone_id(zone).await?;
        for record in records {
            let id = record.id.as_deref().ok_or_else(|| {
                UnpublishedSnafu {
                    name: record.fqdn(zone),
                }
                .build()
            })?;
            let _: serde_json::Value = self
                .call(
                    self.client
                        .delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{id}")),
                )
                .await?;
            debug!(%id, "cloudflare: record deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope() {
        let envelope: Envelope<Vec<Zone>> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":9109,"message":"Invalid access token"}],"messages":[],"result":null}"#,
        )
        .unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.errors[0].code, 9109);
        assert!(envelope.result.is_none());
    }

    #[test]
    fn test_debug_hides_token() {
        let provider = CloudflareProvider::new("very-secret").unwrap();
        assert!(!format!("{provider:?}").contains("very-secret"));
    }
}
