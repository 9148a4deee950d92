//! The DNS provider capability and its vendor registry.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

use super::providers::{
    aliyun::AliyunProvider, cloudflare::CloudflareProvider, namesilo::NameSiloProvider,
    tencent::TencentProvider,
};

/// Record types the adapters publish.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    /// IPv4 address.
    A,
    /// IPv6 address.
    Aaaa,
    /// Text, used for `_acme-challenge`.
    Txt,
}

/// A record inside a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// The record type.
    pub record_type: RecordType,
    /// Name relative to the zone, `@` for the apex.
    pub name: String,
    /// The record data.
    pub value: String,
    /// Time to live in seconds.  Providers raise it to their minimum.
    pub ttl: u32,
    /// Identifier assigned by the provider once published.
    pub id: Option<String>,
}

impl DnsRecord {
    /// Creates an unpublished record.
    pub fn new(record_type: RecordType, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            record_type,
            name: name.into(),
            value: value.into(),
            ttl: DEFAULT_TTL,
            id: None,
        }
    }

    /// Sets the time to live.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// The fully qualified name of this record in `zone`, without trailing dot.
    pub fn fqdn(&self, zone: &str) -> String {
        let zone = super::normalize(zone);
        match self.name.as_str() {
            "@" | "" => zone,
            name => format!("{name}.{zone}"),
        }
    }
}

/// TTL used for records without an explicit one.
pub const DEFAULT_TTL: u32 = 600;

/// DNS provider failures.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum DnsProviderError {
    #[snafu(display("unknown DNS provider: {name}"))]
    UnknownProvider { name: String },
    #[snafu(display("DNS provider {provider} requires a {field}"))]
    MissingCredential {
        provider: String,
        field: &'static str,
    },
    #[snafu(display("failed to build the HTTP client"))]
    Client { source: reqwest::Error },
    #[snafu(display("{provider} request failed"))]
    Request {
        provider: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("{provider} API error: {message}"))]
    Api {
        provider: &'static str,
        message: String,
    },
    #[snafu(display("failed to encode the {provider} request"))]
    Encode {
        provider: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to format the {provider} request date"))]
    Date {
        provider: &'static str,
        source: time::error::Format,
    },
    #[snafu(display("{provider} has no zone named {zone}"))]
    UnknownZone {
        provider: &'static str,
        zone: String,
    },
    #[snafu(display("record {name} was never published"))]
    Unpublished { name: String },
}

/// A vendor API able to publish records in a zone.
#[async_trait]
pub trait DnsProvider: Send + Sync + fmt::Debug {
    /// The name the provider is selected by.
    fn name(&self) -> &'static str;

    /// Publishes `records` in `zone`, returning them with their provider ids set.
    async fn append_records(
        &self,
        zone: &str,
        records: &[DnsRecord],
    ) -> Result<Vec<DnsRecord>, DnsProviderError>;

    /// Removes previously appended `records` from `zone`.
    async fn delete_records(
        &self,
        zone: &str,
        records: &[DnsRecord],
    ) -> Result<(), DnsProviderError>;
}

/// Names accepted by [`create_provider`].
pub const PROVIDER_NAMES: [&str; 4] = ["cloudflare", "aliyun", "qcloud", "namesilo"];

/// Selects a provider by `name`.
///
/// Never touches the network.  `id` is the access key id where the vendor needs one, `key`
/// the secret or API token.
pub fn create_provider(
    name: &str,
    id: Option<&str>,
    key: &str,
) -> Result<Arc<dyn DnsProvider>, DnsProviderError> {
    let id = id.unwrap_or_default();
    let provider: Arc<dyn DnsProvider> = match name {
        "cloudflare" => Arc::new(CloudflareProvider::new(require(key, name, "key")?)?),
        "aliyun" => Arc::new(AliyunProvider::new(
            require(id, name, "id")?,
            require(key, name, "key")?,
        )?),
        "qcloud" => Arc::new(TencentProvider::new(
            require(id, name, "id")?,
            require(key, name, "key")?,
        )?),
        "namesilo" => Arc::new(NameSiloProvider::new(require(key, name, "key")?)?),
        _ => return Err(UnknownProviderSnafu { name }.build()),
    };
    Ok(provider)
}

fn require<'a>(
    value: &'a str,
    provider: &str,
    field: &'static str,
) -> Result<&'a str, DnsProviderError> {
    snafu::ensure!(
        !value.is_empty(),
        MissingCredentialSnafu {
            provider: provider.to_string(),
            field
        }
    );
    Ok(value)
}

/// An HTTP client for vendor APIs.
pub(crate) fn http_client() -> Result<reqwest::Client, DnsProviderError> {
    reqwest::Client::builder()
        .timeout(crate::defaults::timeouts::HTTP_API_TIMEOUT)
        .build()
        .context(ClientSnafu)
}
