//! Alibaba Cloud DNS (Alidns), signed RPC API.
//!
//! Every request carries an HMAC-SHA1 signature over its sorted, percent-encoded query
//! parameters.  API documentation: <https://www.alibabacloud.com/help/en/dns/api-alidns-2015-01-09-adddomainrecord>

use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use snafu::ResultExt;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::debug;

use super::percent_encode;
use crate::dns::provider::{
    ApiSnafu, DnsProvider, DnsProviderError, DnsRecord, RequestSnafu, UnpublishedSnafu,
    http_client,
};

const ENDPOINT: &str = "https://alidns.aliyuncs.com/";
const API_VERSION: &str = "2015-01-09";
const NAME: &str = "aliyun";
const MIN_TTL: u32 = 600;

type HmacSha1 = Hmac<sha1::Sha1>;

/// Alibaba Cloud DNS.
#[derive(derive_more::Debug)]
pub struct AliyunProvider {
    client: reqwest::Client,
    access_key_id: String,
    #[debug("***")]
    access_key_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reply {
    record_id: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

impl AliyunProvider {
    /// Creates the provider for an AccessKey pair.
    pub fn new(access_key_id: &str, access_key_secret: &str) -> Result<Self, DnsProviderError> {
        Ok(Self {
            client: http_client()?,
            access_key_id: access_key_id.to_string(),
            access_key_secret: access_key_secret.to_string(),
        })
    }

    async fn call(
        &self,
        action: &str,
        params: &[(&str, String)],
    ) -> Result<Reply, DnsProviderError> {
        let now = OffsetDateTime::now_utc();
        let nonce = format!("{:016x}", rand::random::<u64>());
        let query = self.signed_query(action, params, now, &nonce);
        let reply: Reply = self
            .client
            .get(format!("{ENDPOINT}?{query}"))
            .send()
            .await
            .context(RequestSnafu { provider: NAME })?
            .json()
            .await
            .context(RequestSnafu { provider: NAME })?;
        if let Some(code) = reply.code.as_deref() {
            return Err(ApiSnafu {
                provider: NAME,
                message: format!("{action}: {code}: {}", reply.message.unwrap_or_default()),
            }
            .build());
        }
        Ok(reply)
    }

    /// The full query string of a request, signature included.
    fn signed_query(
        &self,
        action: &str,
        params: &[(&str, String)],
        now: OffsetDateTime,
        nonce: &str,
    ) -> String {
        let timestamp = now
            .replace_nanosecond(0)
            .unwrap_or(now)
            .format(&Rfc3339)
            .unwrap_or_default();
        let mut all: BTreeMap<&str, String> = params
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        all.insert("Action", action.to_string());
        all.insert("Format", "JSON".to_string());
        all.insert("Version", API_VERSION.to_string());
        all.insert("AccessKeyId", self.access_key_id.clone());
        all.insert("SignatureMethod", "HMAC-SHA1".to_string());
        all.insert("SignatureVersion", "1.0".to_string());
        all.insert("SignatureNonce", nonce.to_string());
        all.insert("Timestamp", timestamp);

        let canonical = all
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let string_to_sign = format!("GET&{}&{}", percent_encode("/"), percent_encode(&canonical));

        let mut mac = HmacSha1::new_from_slice(format!("{}&", self.access_key_secret).as_bytes())
            .expect("HMAC takes keys of any size");
        mac.update(string_to_sign.as_bytes());
        let signature = data_encoding::BASE64.encode(&mac.finalize().into_bytes());
        format!("{canonical}&Signature={}", percent_encode(&signature))
    }
}

#[async_trait]
impl DnsProvider for AliyunProvider {
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
            let reply = self
                .call(
                    "AddDomainRecord",
                    &[
                        ("DomainName", domain.clone()),
                        ("RR", record.name.clone()),
                        ("Type", record.record_type.to_string()),
                        ("Value", record.value.clone()),
                        ("TTL", record.ttl.max(MIN_TTL).to_string()),
                    ],
                )
                .await?;
            debug!(name = %record.name, id = ?reply.record_id, "aliyun: record created");
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
        for record in records {
            let id = record.id.clone().ok_or_else(|| {
                UnpublishedSnafu {
                    name: record.fqdn(zone),
                }
                .build()
            })?;
            self.call("DeleteDomainRecord", &[("RecordId", id)]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let provider = AliyunProvider::new("testid", "testsecret").unwrap();
        let now = datetime!(2016-02-23 12:46:24 UTC);
        let params = [("DomainName", "example.com".to_string())];
        let a = provider.signed_query("DescribeDomainRecords", &params, now, "3ee8c1b8");
        let b = provider.signed_query("DescribeDomainRecords", &params, now, "3ee8c1b8");
        assert_eq!(a, b);
        assert!(a.starts_with(
            "AccessKeyId=testid&Action=DescribeDomainRecords&DomainName=example.com&Format=JSON&"
        ));
        assert!(a.contains("&Timestamp=2016-02-23T12%3A46%3A24Z&"));
        let signature = a.rsplit_once("&Signature=").unwrap().1;
        // base64 of a SHA1 digest, percent-encoded
        assert!(signature.ends_with("%3D"));

        let other = provider.signed_query("DescribeDomainRecords", &params, now, "ffffffff");
        assert_ne!(signature, other.rsplit_once("&Signature=").unwrap().1);
    }

    #[test]
    fn test_error_reply() {
        let reply: Reply = serde_json::from_str(
            r#"{"RequestId":"x","Code":"InvalidAccessKeyId.NotFound","Message":"not found"}"#,
        )
        .unwrap();
        assert_eq!(reply.code.as_deref(), Some("InvalidAccessKeyId.NotFound"));
        assert!(reply.record_id.is_none());
    }
}
