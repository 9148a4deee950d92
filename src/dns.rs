//! DNS support for DNS-01 certificate issuance.
//!
//! Zone discovery asks the recursive resolvers which zone is authoritative for a hostname,
//! the [`provider`] module then edits records in that zone through a vendor API.

use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_resolver::{
    Resolver, TokioResolver,
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::{rr::RecordType as HickoryRecordType, xfer::Protocol},
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tracing::{debug, trace};

use crate::defaults::timeouts::DNS_TIMEOUT;

pub mod provider;
pub mod providers;

pub use self::provider::{DnsProvider, DnsProviderError, DnsRecord, RecordType, create_provider};

/// Zone discovery failures.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ZoneError {
    #[snafu(display("could not find the zone for {fqdn}"))]
    ZoneNotFound { fqdn: String },
    #[snafu(display("{hostname} is not inside zone {zone}"))]
    OutsideZone { hostname: String, zone: String },
}

/// Looks up SOA records.
#[async_trait]
pub trait ZoneLookup: Send + Sync {
    /// The owner name of the SOA record answering a query for `name`.
    ///
    /// Returns `None` when there is no SOA record owned by the queried name, or the query
    /// failed.
    async fn soa_owner(&self, name: &str) -> Option<String>;
}

/// [`ZoneLookup`] through the recursive resolvers.
#[derive(Debug, Clone)]
pub struct HickoryZoneLookup {
    resolver: TokioResolver,
}

impl HickoryZoneLookup {
    /// Creates a lookup using `resolvers`, or the system configuration when empty.
    pub fn new(resolvers: &[SocketAddr]) -> Self {
        let (config, mut options) = if resolvers.is_empty() {
            hickory_resolver::system_conf::read_system_conf().unwrap_or_default()
        } else {
            let mut config = ResolverConfig::new();
            for addr in resolvers {
                config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
            }
            (config, ResolverOpts::default())
        };
        options.timeout = DNS_TIMEOUT;
        options.attempts = 2;
        // zone cuts can move while we are issuing
        options.cache_size = 0;

        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(options)
            .build();
        Self { resolver }
    }

    /// The TXT strings published at `name`, empty when the query fails.
    pub async fn txt_values(&self, name: &str) -> Vec<String> {
        let fqdn = format!("{}.", normalize(name));
        match self.resolver.txt_lookup(fqdn.as_str()).await {
            Ok(lookup) => lookup
                .iter()
                .map(|txt| {
                    txt.iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>()
                })
                .collect(),
            Err(err) => {
                trace!(%name, "TXT lookup failed: {err}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ZoneLookup for HickoryZoneLookup {
    async fn soa_owner(&self, name: &str) -> Option<String> {
        let fqdn = format!("{}.", normalize(name));
        match self.resolver.lookup(fqdn.as_str(), HickoryRecordType::SOA).await {
            Ok(lookup) => lookup
                .record_iter()
                .find(|record| record.record_type() == HickoryRecordType::SOA)
                .map(|record| normalize(&record.name().to_ascii())),
            Err(err) => {
                trace!(%name, "SOA lookup failed: {err}");
                None
            }
        }
    }
}

/// Finds the zone `fqdn` lives in.
///
/// Walks from `fqdn` towards the root one label at a time, querying the SOA record of each
/// candidate.  The first candidate owning its SOA record is the zone.  Failed queries only
/// move the walk on.
pub async fn find_zone_by_fqdn(fqdn: &str, lookup: &impl ZoneLookup) -> Result<String, ZoneError> {
    let fqdn = normalize(fqdn);
    let mut candidate = fqdn.as_str();
    loop {
        // never ask for the SOA of a top level domain
        if !candidate.contains('.') {
            break;
        }
        if let Some(owner) = lookup.soa_owner(candidate).await {
            if owner == candidate {
                debug!(%fqdn, zone = %owner, "found zone");
                return Ok(owner);
            }
            trace!(%candidate, %owner, "SOA belongs to a parent zone");
        }
        match candidate.split_once('.') {
            Some((_, parent)) => candidate = parent,
            None => break,
        }
    }
    Err(ZoneNotFoundSnafu { fqdn }.build())
}

/// The name of `hostname` relative to `zone`, `@` for the zone apex.
pub fn relative_name(hostname: &str, zone: &str) -> Result<String, ZoneError> {
    let hostname = normalize(hostname);
    let zone = normalize(zone);
    if hostname == zone {
        return Ok("@".to_string());
    }
    hostname
        .strip_suffix(&zone)
        .and_then(|prefix| prefix.strip_suffix('.'))
        .filter(|prefix| !prefix.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| OutsideZoneSnafu { hostname, zone }.build())
}

/// The `_acme-challenge` record name for a name relative to its zone.
pub fn challenge_record_name(relative_name: &str) -> String {
    match relative_name {
        "@" | "" => "_acme-challenge".to_string(),
        name => format!("_acme-challenge.{name}"),
    }
}

/// Lower case without the trailing dot.
pub(crate) fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
