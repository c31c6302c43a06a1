//! IPv4 block arithmetic
//!
//! Ranges are inclusive `[start, end]` pairs of `u32` addresses, widened to
//! `u64` for sizes so a `/0` does not overflow.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::{Error, Result};

/// Parse a CIDR in canonical form (no host bits set)
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|e| Error::invalid_range(cidr, format!("not an IPv4 CIDR: {}", e)))?;
    if net.trunc() != net {
        return Err(Error::invalid_range(
            cidr,
            format!("host bits set, network address is {}", net.trunc()),
        ));
    }
    Ok(net)
}

/// First and last address of a block
pub fn range(net: &Ipv4Net) -> (u32, u32) {
    (u32::from(net.network()), u32::from(net.broadcast()))
}

/// Whether two blocks share at least one address
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    let (a_start, a_end) = range(a);
    let (b_start, b_end) = range(b);
    a_start.max(b_start) <= a_end.min(b_end)
}

/// Whether `inner` lies entirely within `outer`
pub fn contains(outer: &Ipv4Net, inner: &Ipv4Net) -> bool {
    let (o_start, o_end) = range(outer);
    let (i_start, i_end) = range(inner);
    o_start <= i_start && i_end <= o_end
}

/// Number of addresses in a block
pub fn block_size(net: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(net.prefix_len()))
}

/// Round a requested size up to the next power of two
pub fn normalize_block_size(size: u64) -> u64 {
    size.max(1).next_power_of_two()
}

/// Prefix length of a block holding `size` addresses (rounded up)
pub fn prefix_for_block_size(size: u64) -> u8 {
    let size = normalize_block_size(size).min(1u64 << 32);
    (32 - size.trailing_zeros()) as u8
}

/// Build the block of `size` addresses starting at `start`
pub fn block_at(start: u32, size: u64) -> Result<Ipv4Net> {
    let prefix = prefix_for_block_size(size);
    let addr = Ipv4Addr::from(start);
    Ipv4Net::new(addr, prefix)
        .map_err(|e| Error::invalid_range(format!("{}/{}", addr, prefix), e.to_string()))
}

/// Validate a per-cluster block size against the supernet
///
/// The size is rounded up to a power of two and must be non-zero and at most
/// half of the supernet, so that at least two clusters fit.
pub fn valid_cluster_size(supernet: &Ipv4Net, size: u64) -> Result<u64> {
    if size == 0 {
        return Err(Error::invalid_range(
            supernet.to_string(),
            "cluster size must be greater than zero",
        ));
    }
    let size = normalize_block_size(size);
    let max = block_size(supernet) / 2;
    if size > max {
        return Err(Error::invalid_range(
            supernet.to_string(),
            format!(
                "cluster size {} exceeds half of the supernet ({} addresses)",
                size, max
            ),
        ));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_requires_canonical_network() {
        assert_eq!(parse_cidr("242.1.0.0/16").unwrap(), net("242.1.0.0/16"));
        assert!(matches!(
            parse_cidr("242.1.0.1/16"),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            parse_cidr("not-a-cidr"),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            parse_cidr("242.1.0.0"),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_overlap_is_symmetric_and_inclusive() {
        let a = net("10.0.0.0/16");
        let inside = net("10.0.255.0/24");
        let adjacent = net("10.1.0.0/16");

        assert!(overlaps(&a, &inside));
        assert!(overlaps(&inside, &a));
        assert!(!overlaps(&a, &adjacent));
        assert!(!overlaps(&adjacent, &a));
        assert!(overlaps(&a, &a));
    }

    #[test]
    fn test_contains() {
        let supernet = net("242.0.0.0/8");
        assert!(contains(&supernet, &net("242.255.0.0/16")));
        assert!(contains(&supernet, &supernet));
        assert!(!contains(&supernet, &net("243.0.0.0/16")));
        assert!(!contains(&net("242.0.0.0/16"), &supernet));
    }

    #[test]
    fn test_block_size_rounding() {
        assert_eq!(normalize_block_size(65536), 65536);
        assert_eq!(normalize_block_size(65336), 65536);
        assert_eq!(normalize_block_size(0), 1);
        assert_eq!(prefix_for_block_size(65536), 16);
        assert_eq!(prefix_for_block_size(300), 23);
        assert_eq!(prefix_for_block_size(1), 32);
        assert_eq!(block_size(&net("242.0.0.0/8")), 1 << 24);
        assert_eq!(block_size(&net("0.0.0.0/0")), 1 << 32);
    }

    #[test]
    fn test_block_at() {
        let start = u32::from(Ipv4Addr::new(242, 1, 0, 0));
        assert_eq!(block_at(start, 65536).unwrap(), net("242.1.0.0/16"));
    }

    #[test]
    fn test_cluster_size_limits() {
        let supernet = net("242.0.0.0/8");
        assert_eq!(valid_cluster_size(&supernet, 65336).unwrap(), 65536);
        assert_eq!(valid_cluster_size(&supernet, 1 << 23).unwrap(), 1 << 23);
        assert!(valid_cluster_size(&supernet, (1 << 23) + 1).is_err());
        assert!(valid_cluster_size(&supernet, 0).is_err());
    }
}
