/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use async_trait::async_trait;
use trust_dns_resolver::TokioAsyncResolver;

/// Looks up the mail exchangers of a domain.
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// Returns the exchanger host names, most preferred first.
    async fn lookup_mx(&self, domain: &str) -> crate::Result<Vec<String>>;
}

/// Resolver backed by the system DNS configuration.
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> crate::Result<Self> {
        Ok(DnsResolver {
            resolver: TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|err| crate::Error::Dns(err.to_string()))?,
        })
    }
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn lookup_mx(&self, domain: &str) -> crate::Result<Vec<String>> {
        let records = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|err| crate::Error::Dns(err.to_string()))?
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
            .collect::<Vec<_>>();

        Ok(order_exchangers(records))
    }
}

/// Sorts by preference keeping the resolver order for equal preferences,
/// drops null MX records and strips the trailing root label.
pub fn order_exchangers(mut records: Vec<(u16, String)>) -> Vec<String> {
    records.sort_by_key(|(preference, _)| *preference);
    records
        .into_iter()
        .filter_map(|(_, host)| {
            let host = host.trim_end_matches('.');
            (!host.is_empty()).then(|| host.to_string())
        })
        .collect()
}
