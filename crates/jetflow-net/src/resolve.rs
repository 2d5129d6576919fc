//! Candidate address resolution and ranking.

use crate::{Error, Result};
use std::net::IpAddr;
use tokio::net::lookup_host;
use tracing::debug;

/// Resolve all addresses for `host` and rank them for connection racing.
///
/// Fails with [`Error::Resolve`] when the lookup fails and
/// [`Error::NoRecords`] when it yields nothing.
pub async fn resolve_ranked(host: &str, port: u16) -> Result<Vec<IpAddr>> {
    let addrs: Vec<IpAddr> = lookup_host((host, port))
        .await
        .map_err(|e| Error::Resolve(host.to_string(), e))?
        .map(|sa| sa.ip())
        .collect();

    if addrs.is_empty() {
        return Err(Error::NoRecords(host.to_string()));
    }

    let ranked = rank_addresses(addrs);
    debug!(host, candidates = ranked.len(), "resolved candidate addresses");
    Ok(ranked)
}

/// Order resolver output for racing.
///
/// The resolver hands back addresses in its own preference order. Grouping
/// by address family *in the order each family is first encountered* keeps
/// that preference: the first group is the most-preferred family, and so on.
/// A round-robin zipper merge across the groups then yields
/// most-to-least-preferred, repeating, so a fallback family gets its first
/// attempt early instead of after the preferred family is exhausted.
pub fn rank_addresses(addrs: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut groups: Vec<Vec<IpAddr>> = Vec::new();
    for addr in addrs {
        match groups
            .iter_mut()
            .find(|g| g[0].is_ipv4() == addr.is_ipv4())
        {
            Some(group) => group.push(addr),
            None => groups.push(vec![addr]),
        }
    }

    let total = groups.iter().map(Vec::len).sum();
    let mut ranked = Vec::with_capacity(total);
    let mut round = 0;
    loop {
        let mut took_any = false;
        for group in &groups {
            if let Some(addr) = group.get(round) {
                ranked.push(*addr);
                took_any = true;
            }
        }
        if !took_any {
            break;
        }
        round += 1;
    }
    ranked
}
