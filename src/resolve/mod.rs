//! Resolved endpoint addresses and tiered attempt ordering.
//!
//! Name-to-address resolution happens upstream of this crate; an
//! [`AddressGroup`] is the already-resolved set of candidates for one logical
//! name, organized into fallback tiers of weighted members.

use crate::utils::error::{Result, UplinkError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A single transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.socket_addr()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Address::from)
    }
}

/// The set of addresses known under one logical name.
///
/// Tiers are strict fallbacks: every member of tier N is attempted before any
/// member of tier N+1. Within a tier, members are attempted in a
/// priority-weighted random order.
#[derive(Debug, Clone)]
pub struct AddressGroup {
    tiers: Vec<Vec<(f64, Address)>>,
}

impl AddressGroup {
    /// Build a group from `(weight, address)` tiers. Fails when every tier is
    /// empty or any weight is non-positive.
    pub fn new(tiers: Vec<Vec<(f64, Address)>>) -> Result<Self> {
        if tiers.iter().all(|tier| tier.is_empty()) {
            return Err(UplinkError::InvalidAddressGroup(
                "no addresses provided".to_string(),
            ));
        }
        for (weight, address) in tiers.iter().flatten() {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(UplinkError::InvalidAddressGroup(format!(
                    "non-positive weight {} for {}",
                    weight, address
                )));
            }
        }
        Ok(Self { tiers })
    }

    /// Group holding exactly one address, for callers that bypass naming.
    pub fn single(address: Address) -> Self {
        Self {
            tiers: vec![vec![(1.0, address)]],
        }
    }

    /// Every address in the group, tier order, no shuffling.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.tiers.iter().flatten().map(|(_, address)| *address)
    }

    /// Total number of addresses across all tiers.
    pub fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produce the connect ordering for one acquire.
    ///
    /// Each tier member gets the sort key `uniform(0,1) * weight`; sorting a
    /// tier ascending by that key yields a weighted permutation in one pass.
    /// Tiers are concatenated in declared order so fallbacks stay strict.
    pub fn attempt_order(&self) -> Vec<Address> {
        let mut rng = rand::rng();
        let mut ordering = Vec::with_capacity(self.len());
        for tier in &self.tiers {
            let mut keyed: Vec<(f64, Address)> = tier
                .iter()
                .map(|(weight, address)| (rng.random::<f64>() * weight, *address))
                .collect();
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            ordering.extend(keyed.into_iter().map(|(_, address)| address));
        }
        ordering
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last_octet: u8, port: u16) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
    }

    #[test]
    fn rejects_all_empty_tiers() {
        assert!(matches!(
            AddressGroup::new(vec![]),
            Err(UplinkError::InvalidAddressGroup(_))
        ));
        assert!(matches!(
            AddressGroup::new(vec![vec![], vec![]]),
            Err(UplinkError::InvalidAddressGroup(_))
        ));
    }

    #[test]
    fn rejects_non_positive_weights() {
        assert!(AddressGroup::new(vec![vec![(0.0, addr(1, 80))]]).is_err());
        assert!(AddressGroup::new(vec![vec![(-1.0, addr(1, 80))]]).is_err());
        assert!(AddressGroup::new(vec![vec![(f64::NAN, addr(1, 80))]]).is_err());
    }

    #[test]
    fn ordering_is_a_permutation_of_the_group() {
        let group = AddressGroup::new(vec![
            vec![(1.0, addr(1, 80)), (2.0, addr(2, 80))],
            vec![(1.0, addr(3, 80))],
        ])
        .unwrap();

        let order = group.attempt_order();
        assert_eq!(order.len(), 3);
        let mut sorted: Vec<_> = order.clone();
        sorted.sort();
        let mut expected: Vec<_> = group.addresses().collect();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn tiers_are_strict_fallbacks() {
        let group = AddressGroup::new(vec![
            vec![(1.0, addr(1, 80)), (5.0, addr(2, 80))],
            vec![(1.0, addr(3, 80)), (5.0, addr(4, 80))],
        ])
        .unwrap();

        for _ in 0..50 {
            let order = group.attempt_order();
            let first_tier: Vec<_> = order[..2].to_vec();
            assert!(first_tier.contains(&addr(1, 80)));
            assert!(first_tier.contains(&addr(2, 80)));
        }
    }

    #[test]
    fn small_weights_sort_first_within_a_tier() {
        // key = uniform * weight, ascending: a tiny weight nearly always
        // lands in front of a huge one.
        let group =
            AddressGroup::new(vec![vec![(0.001, addr(1, 80)), (1000.0, addr(2, 80))]]).unwrap();

        let mut tiny_first = 0;
        for _ in 0..300 {
            if group.attempt_order()[0] == addr(1, 80) {
                tiny_first += 1;
            }
        }
        assert!(tiny_first >= 290, "tiny weight led only {tiny_first}/300");
    }

    #[test]
    fn single_wraps_one_address() {
        let group = AddressGroup::single(addr(9, 443));
        assert_eq!(group.attempt_order(), vec![addr(9, 443)]);
    }

    #[test]
    fn address_parses_and_displays() {
        let parsed: Address = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(parsed, Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));
        assert_eq!(parsed.to_string(), "127.0.0.1:8080");
    }
}
