//! Global CIDR allocation
//!
//! Pure functions over an [`AddressRegistry`] snapshot. Nothing here mutates
//! the registry; committing the result is the caller's job.

use ipnet::Ipv4Net;
use tracing::debug;

use super::cidr;
use super::registry::AddressRegistry;
use crate::{Error, Result};

/// Choose the global CIDR for `cluster_id`.
///
/// With an explicit CIDR the request is validated: it must be a canonical
/// subnet of the supernet, hold at least `requested_block_size` addresses, and
/// not overlap any other cluster's block. Blocks already held by `cluster_id`
/// are ignored, so re-requesting its own block is a no-op.
///
/// Without one, an existing primary block of the right size is reused;
/// otherwise the supernet is scanned upwards in block-sized, block-aligned
/// steps and the lowest free block is returned. A `requested_block_size` of
/// zero means the registry default.
pub fn allocate(
    registry: &AddressRegistry,
    cluster_id: &str,
    requested_block_size: u64,
    explicit: Option<&str>,
) -> Result<Ipv4Net> {
    match explicit {
        Some(requested) => validate_explicit(registry, cluster_id, requested_block_size, requested),
        None => {
            let size = if requested_block_size == 0 {
                registry.default_block_size
            } else {
                requested_block_size
            };
            let size = cidr::valid_cluster_size(&registry.supernet, size)?;

            if let Some(existing) = registry.primary_block(cluster_id) {
                if cidr::block_size(&existing) == size && cidr::contains(&registry.supernet, &existing)
                {
                    return Ok(existing);
                }
                debug!(
                    cluster_id = %cluster_id,
                    existing = %existing,
                    block_size = size,
                    "Existing block no longer matches, reallocating"
                );
            }
            scan(registry, cluster_id, size)
        }
    }
}

fn validate_explicit(
    registry: &AddressRegistry,
    cluster_id: &str,
    requested_block_size: u64,
    requested: &str,
) -> Result<Ipv4Net> {
    let net = cidr::parse_cidr(requested)?;

    if !cidr::contains(&registry.supernet, &net) {
        return Err(Error::invalid_range(
            requested,
            format!("not a subnet of the global range {}", registry.supernet),
        ));
    }

    let minimum = cidr::normalize_block_size(requested_block_size);
    if cidr::block_size(&net) < minimum {
        return Err(Error::invalid_range(
            requested,
            format!(
                "holds {} addresses, at least {} required",
                cidr::block_size(&net),
                minimum
            ),
        ));
    }

    for (owner, block) in registry.allocated() {
        if owner != cluster_id && cidr::overlaps(&net, &block) {
            return Err(Error::overlap(requested, block.to_string(), owner));
        }
    }
    Ok(net)
}

fn scan(registry: &AddressRegistry, cluster_id: &str, size: u64) -> Result<Ipv4Net> {
    let taken: Vec<(u64, u64)> = registry
        .allocated()
        .into_iter()
        .filter(|(owner, _)| *owner != cluster_id)
        .map(|(_, block)| {
            let (start, end) = cidr::range(&block);
            (u64::from(start), u64::from(end))
        })
        .collect();

    let (base, last) = cidr::range(&registry.supernet);
    let (base, last) = (u64::from(base), u64::from(last));

    let mut start = base;
    while start + size - 1 <= last {
        let end = start + size - 1;
        let blocking_end = taken
            .iter()
            .filter(|(s, e)| (*s).max(start) <= (*e).min(end))
            .map(|(_, e)| *e)
            .max();

        match blocking_end {
            None => return cidr::block_at(start as u32, size),
            // Jump to the first aligned block past whatever is in the way
            Some(e) => start = align_up(e + 1 - base, size) + base,
        }
    }

    Err(Error::exhausted(registry.supernet.to_string(), size))
}

fn align_up(offset: u64, size: u64) -> u64 {
    offset.div_ceil(size) * size
}
