//! NameSilo, API key authentication.

use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use tracing::debug;

use crate::dns::provider::{
    ApiSnafu, DnsProvider, DnsProviderError, DnsRecord, RequestSnafu, UnpublishedSnafu,
    http_client,
};

const API_BASE: &str = "https://www.namesilo.com/api";
const NAME: &str = "namesilo";
const MIN_TTL: u32 = 3600;
const SUCCESS: u32 = 300;

/// NameSilo DNS.
#[derive(derive_more::Debug)]
pub struct NameSiloProvider {
    client: reqwest::Client,
    #[debug("***")]
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    reply: Reply,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(deserialize_with = "code_from_any")]
    code: u32,
    detail: String,
    record_id: Option<String>,
}

/// NameSilo sends the status code both as number and as string.
fn code_from_any<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Number(u32),
        Text(String),
    }
    match Code::deserialize(deserializer)? {
        Code::Number(n) => Ok(n),
        Code::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl NameSiloProvider {
    /// Creates the provider for an API key.
    pub fn new(api_key: &str) -> Result<Self, DnsProviderError> {
        Ok(Self {
            client: http_client()?,
            api_key: api_key.to_string(),
        })
    }

    async fn call(
        &self,
        operation: &str,
        params: &[(&str, &str)],
    ) -> Result<Reply, DnsProviderError> {
        let envelope: Envelope = self
            .client
            .get(format!("{API_BASE}/{operation}"))
            .query(&[("version", "1"), ("type", "json"), ("key", self.api_key.as_str())])
            .query(params)
            .send()
            .await
            .context(RequestSnafu { provider: NAME })?
            .json()
            .await
            .context(RequestSnafu { provider: NAME })?;
        snafu::ensure!(
            envelope.reply.code == SUCCESS,
            ApiSnafu {
                provider: NAME,
                message: format!(
                    "{operation}: {}: {}",
                    envelope.reply.code, envelope.reply.detail
                ),
            }
        );
        Ok(envelope.reply)
    }
}

#[async_trait]
impl DnsProvider for NameSiloProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn append_records(
        &self,
        zone: &str,
        records: &[DnsRecord],
    ) -> Result<Vec<DnsRecord>, DnsProviderError> {
        let domain = crate::dns::normalize(zone);
        let mut created = Vec::with_capacity(records.len());
        for record in records {
            // NameSilo takes the apex as an empty host
            let host = match record.name.as_str() {
                "@" => "",
                name => name,
            };
            let ttl = record.ttl.max(MIN_TTL).to_string();
            let record_type = record.record_type.to_string();
            let reply = self
                .call(
                    "dnsAddRecord",
                    &[
                        ("domain", domain.as_str()),
                        ("rrtype", record_type.as_str()),
                        ("rrhost", host),
                        ("rrvalue", record.value.as_str()),
                        ("rrttl", ttl.as_str()),
                    ],
                )
                .await?;
            debug!(name = %record.name, id = ?reply.record_id, "namesilo: record created");
            created.push(DnsRecord {
                id: reply.record_id,
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
        let domain = crate::dns::normalize(zone);
        for record in records {
            let id = record.id.as_deref().ok_or_else(|| {
                UnpublishedSnafu {
                    name: record.fqdn(zone),
                }
                .build()
            })?;
            self.call("dnsDeleteRecord", &[("domain", domain.as_str()), ("rrid", id)])
                .await?;
        }
        Ok(())
    }
}
