//! Tencent Cloud DNSPod, API 3.0 with TC3-HMAC-SHA256 request signing.
//!
//! API documentation: <https://www.tencentcloud.com/document/api/1157/49025>

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use time::{OffsetDateTime, macros::format_description};
use tracing::debug;

use crate::dns::provider::{
    ApiSnafu, DateSnafu, DnsProvider, DnsProviderError, DnsRecord, EncodeSnafu, RequestSnafu,
    UnpublishedSnafu, http_client,
};

const HOST: &str = "dnspod.tencentcloudapi.com";
const SERVICE: &str = "dnspod";
const API_VERSION: &str = "2021-03-23";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const ALGORITHM: &str = "TC3-HMAC-SHA256";
const NAME: &str = "qcloud";
/// The line every record is published on.
const DEFAULT_LINE: &str = "默认";

type HmacSha256 = Hmac<Sha256>;

/// Tencent Cloud DNSPod.
#[derive(derive_more::Debug)]
pub struct TencentProvider {
    client: reqwest::Client,
    secret_id: String,
    #[debug("***")]
    secret_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateRecord<'a> {
    domain: &'a str,
    sub_domain: &'a str,
    record_type: String,
    record_line: &'a str,
    value: &'a str,
    #[serde(rename = "TTL")]
    ttl: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteRecord<'a> {
    domain: &'a str,
    record_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    response: Reply,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reply {
    record_id: Option<u64>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    message: String,
}

impl TencentProvider {
    /// Creates the provider for a SecretId and SecretKey pair.
    pub fn new(secret_id: &str, secret_key: &str) -> Result<Self, DnsProviderError> {
        Ok(Self {
            client: http_client()?,
            secret_id: secret_id.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    async fn call(
        &self,
        action: &str,
        payload: &(impl Serialize + Sync),
    ) -> Result<Reply, DnsProviderError> {
        let payload = serde_json::to_string(payload).context(EncodeSnafu { provider: NAME })?;
        let now = OffsetDateTime::now_utc();
        let authorization = self.authorization(&payload, now)?;
        let envelope: Envelope = self
            .client
            .post(format!("https://{HOST}"))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", HOST)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", now.unix_timestamp().to_string())
            .header("X-TC-Version", API_VERSION)
            .body(payload)
            .send()
            .await
            .context(RequestSnafu { provider: NAME })?
            .json()
            .await
            .context(RequestSnafu { provider: NAME })?;
        if let Some(err) = envelope.response.error {
            return Err(ApiSnafu {
                provider: NAME,
                message: format!("{action}: {}: {}", err.code, err.message),
            }
            .build());
        }
        Ok(envelope.response)
    }

    /// The `Authorization` header for a POST of `payload` at `now`.
    fn authorization(
        &self,
        payload: &str,
        now: OffsetDateTime,
    ) -> Result<String, DnsProviderError> {
        let timestamp = now.unix_timestamp();
        let date = now
            .to_offset(time::UtcOffset::UTC)
            .date()
            .format(format_description!("[year]-[month]-[day]"))
            .context(DateSnafu { provider: NAME })?;

        let signed_headers = "content-type;host";
        let canonical_request = format!(
            "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{HOST}\n\n{signed_headers}\n{}",
            data_encoding::HEXLOWER.encode(&Sha256::digest(payload.as_bytes()))
        );
        let scope = format!("{date}/{SERVICE}/tc3_request");
        let string_to_sign = format!(
            "{ALGORITHM}\n{timestamp}\n{scope}\n{}",
            data_encoding::HEXLOWER.encode(&Sha256::digest(canonical_request.as_bytes()))
        );

        let secret_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), &date);
        let secret_service = hmac_sha256(&secret_date, SERVICE);
        let secret_signing = hmac_sha256(&secret_service, "tc3_request");
        let signature =
            data_encoding::HEXLOWER.encode(&hmac_sha256(&secret_signing, &string_to_sign));

        Ok(format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.secret_id
        ))
    }
}

fn hmac_sha256(key: &[u8], msg: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC takes keys of any size");
    mac.update(msg.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[async_trait]
impl DnsProvider for TencentProvider {
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
                    "CreateRecord",
                    &CreateRecord {
                        domain: &domain,
                        sub_domain: &record.name,
                        record_type: record.record_type.to_string(),
                        record_line: DEFAULT_LINE,
                        value: &record.value,
                        ttl: record.ttl,
                    },
                )
                .await?;
            debug!(name = %record.name, id = ?reply.record_id, "qcloud: record created");
            created.push(DnsRecord {
                id: reply.record_id.map(|id| id.to_string()),
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
            let record_id = record
                .id
                .as_deref()
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| {
                    UnpublishedSnafu {
                        name: record.fqdn(zone),
                    }
                    .build()
                })?;
            self.call(
                "DeleteRecord",
                &DeleteRecord {
                    domain: &domain,
                    record_id,
                },
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_is_deterministic() {
        let provider = TencentProvider::new("AKIDEXAMPLE", "secret").unwrap();
        let payload = r#"{"Domain":"example.com"}"#;
        let now = OffsetDateTime::from_unix_timestamp(1_551_113_065).unwrap();
        let a = provider.authorization(payload, now).unwrap();
        let b = provider.authorization(payload, now).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(
            "TC3-HMAC-SHA256 Credential=AKIDEXAMPLE/2019-02-25/dnspod/tc3_request, SignedHeaders=content-type;host, Signature="
        ));
        let signature = a.rsplit_once("Signature=").unwrap().1;
        assert_eq!(signature.len(), 64);

        let other = provider
            .authorization(r#"{"Domain":"example.org"}"#, now)
            .unwrap();
        assert_ne!(a, other);

        // the scope date is the UTC date, whatever the offset of `now`
        let shifted = now.to_offset(time::macros::offset!(-8));
        assert_eq!(provider.authorization(payload, shifted).unwrap(), a);
    }

    #[tokio::test]
    async fn test_unencodable_payload_is_an_error() {
        let provider = TencentProvider::new("AKIDEXAMPLE", "secret").unwrap();
        // JSON object keys must be strings
        let payload = std::collections::BTreeMap::from([(vec![1u8], 1u8)]);
        let err = provider.call("CreateRecord", &payload).await.unwrap_err();
        assert!(matches!(err, DnsProviderError::Encode { provider: "qcloud", .. }));
    }

    #[test]
    fn test_payload_field_names() {
        let payload = serde_json::to_value(CreateRecord {
            domain: "example.com",
            sub_domain: "_acme-challenge.relay",
            record_type: "TXT".to_string(),
            record_line: DEFAULT_LINE,
            value: "token",
            ttl: 600,
        })
        .unwrap();
        assert_eq!(payload["SubDomain"], "_acme-challenge.relay");
        assert_eq!(payload["TTL"], 600);
        assert_eq!(payload["RecordType"], "TXT");
    }

    #[test]
    fn test_error_reply() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"Response":{"Error":{"Code":"AuthFailure","Message":"bad"},"RequestId":"x"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.response.error.unwrap().code, "AuthFailure");
    }
}
