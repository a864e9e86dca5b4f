//! Placement map: which sites each unit streams on which remote port
//!
//! Grammar: `UNIT:PORT:SITES` entries joined by `/`, case-insensitive.
//!
//! - `UNIT` is a numeric unit id (leading zeros ignored) or `ALL`
//! - `PORT` is `A`, `B`, `C`, `BOTH` (A and B) or `ALL` (A, B and C)
//! - `SITES` is a comma list, `ALL`, or `SPLIT`
//!
//! `ALL` as a unit is the fallback for every unit without entries of its own.

use crate::error::{Result, StreamError};
use crate::types::{RemotePort, SiteList};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Unit part of a map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSelector {
    All,
    Id(u16),
}

/// Sites part of a map entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteSelector {
    /// Every site in the unit's aggregator list
    All,
    /// Second half of the aggregator list to A, first half to B
    Split,
    /// Explicit sites, in map order
    List(Vec<u8>),
}

impl FromStr for SiteSelector {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ALL" => Ok(SiteSelector::All),
            "SPLIT" => Ok(SiteSelector::Split),
            list => {
                let sites = list
                    .split(',')
                    .map(|site| {
                        site.trim()
                            .parse::<u8>()
                            .map_err(|_| StreamError::Config(format!("Invalid site: {}", site)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(SiteSelector::List(sites))
            }
        }
    }
}

type PortMap = BTreeMap<RemotePort, SiteSelector>;

/// Parsed placement map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementMap {
    wildcard: Option<PortMap>,
    units: BTreeMap<u16, PortMap>,
}

/// Convert the digits of a unit name or map entry to a unit id
///
/// Leading zeros are ignored, so `007`, `07` and `7` are the same unit.
pub fn unit_id(digits: &str) -> Result<u16> {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        return if digits.is_empty() {
            Err(StreamError::Config("Empty unit id".to_string()))
        } else {
            Ok(0)
        };
    }
    trimmed
        .parse()
        .map_err(|_| StreamError::Config(format!("Invalid unit: {}", digits)))
}

fn parse_ports(port: &str) -> Result<&'static [RemotePort]> {
    match port {
        "A" => Ok(&[RemotePort::A]),
        "B" => Ok(&[RemotePort::B]),
        "C" => Ok(&[RemotePort::C]),
        "BOTH" => Ok(&RemotePort::OPTICAL),
        "ALL" => Ok(&RemotePort::ALL),
        other => Err(StreamError::Config(format!("Invalid port: {}", other))),
    }
}

impl FromStr for PlacementMap {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        let mut map = PlacementMap::default();

        for entry in s.trim().to_ascii_uppercase().split('/') {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let &[unit, port, sites] = &parts[..] else {
                return Err(StreamError::Config(format!(
                    "Invalid map entry '{}': expected UNIT:PORT:SITES",
                    entry
                )));
            };

            let unit = match unit {
                "ALL" => UnitSelector::All,
                digits => UnitSelector::Id(unit_id(digits)?),
            };
            let ports = parse_ports(port)?;
            let sites: SiteSelector = sites.parse()?;

            let target = match unit {
                UnitSelector::All => map.wildcard.get_or_insert_with(BTreeMap::new),
                UnitSelector::Id(id) => map.units.entry(id).or_default(),
            };
            for port in ports {
                target.insert(*port, sites.clone());
            }
        }

        Ok(map)
    }
}

impl PlacementMap {
    /// Unit ids with entries of their own
    pub fn listed_units(&self) -> impl Iterator<Item = u16> + '_ {
        self.units.keys().copied()
    }

    /// True if a unit has entries of its own or a wildcard applies
    pub fn covers(&self, id: u16) -> bool {
        self.units.contains_key(&id) || self.wildcard.is_some()
    }

    /// Resolve the sites each remote port of a unit carries
    ///
    /// `available` is the unit's aggregator site list. Explicit lists keep
    /// map order and drop sites the unit does not aggregate.
    pub fn resolve(
        &self,
        name: &str,
        id: u16,
        available: &SiteList,
    ) -> Result<BTreeMap<RemotePort, SiteList>> {
        let ports = self
            .units
            .get(&id)
            .or(self.wildcard.as_ref())
            .ok_or_else(|| StreamError::Config(format!("{} has no valid map", name)))?;

        let mut out = BTreeMap::new();
        for (port, selector) in ports {
            match selector {
                SiteSelector::All => {
                    out.insert(*port, available.clone());
                }
                SiteSelector::Split => {
                    let (first, second) = available.bisect();
                    out.insert(RemotePort::A, second);
                    out.insert(RemotePort::B, first);
                    break;
                }
                SiteSelector::List(sites) => {
                    let mut list = SiteList::new();
                    for site in sites {
                        if let Some(channels) = available.channels(*site) {
                            list.push(*site, channels);
                        }
                    }
                    out.insert(*port, list);
                }
            }
        }

        if out.values().any(SiteList::is_empty) {
            return Err(StreamError::Config(format!("{} has no valid sites", name)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Site;
    use proptest::prelude::*;

    fn available(ids: &[u8]) -> SiteList {
        ids.iter().map(|&site| Site { site, channels: 32 }).collect()
    }

    #[test]
    fn test_default_map_all_sites_both_ports() {
        let map: PlacementMap = "ALL:BOTH:ALL".parse().unwrap();
        let out = map.resolve("acq2106_133", 133, &available(&[1, 2, 3])).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[&RemotePort::A].site_ids(), vec![1, 2, 3]);
        assert_eq!(out[&RemotePort::B].site_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_explicit_ports_with_leading_zeros() {
        let map: PlacementMap = "007:A:1,2/007:B:3".parse().unwrap();
        let out = map.resolve("acq2106_007", 7, &available(&[1, 2, 3])).unwrap();

        assert_eq!(out[&RemotePort::A].site_ids(), vec![1, 2]);
        assert_eq!(out[&RemotePort::B].site_ids(), vec![3]);
        assert!(!out.contains_key(&RemotePort::C));
    }

    #[test]
    fn test_split() {
        let map: PlacementMap = "7:BOTH:SPLIT".parse().unwrap();
        let out = map.resolve("acq2106_007", 7, &available(&[1, 2, 3, 4])).unwrap();

        assert_eq!(out[&RemotePort::A].site_ids(), vec![3, 4]);
        assert_eq!(out[&RemotePort::B].site_ids(), vec![1, 2]);
    }

    #[test]
    fn test_all_port_includes_c() {
        let map: PlacementMap = "all:all:all".parse().unwrap();
        let out = map.resolve("acq2106_001", 1, &available(&[1])).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_wildcard_only_for_unlisted_units() {
        let map: PlacementMap = "133:A:1/ALL:BOTH:ALL".parse().unwrap();
        let sites = available(&[1, 2]);

        let listed = map.resolve("acq2106_133", 133, &sites).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[&RemotePort::A].site_ids(), vec![1]);

        let other = map.resolve("acq2106_176", 176, &sites).unwrap();
        assert_eq!(other.len(), 2);
    }

    #[test]
    fn test_list_keeps_map_order_and_drops_unknown_sites() {
        let map: PlacementMap = "7:A:3,9,1".parse().unwrap();
        let out = map.resolve("acq2106_007", 7, &available(&[1, 2, 3])).unwrap();
        assert_eq!(out[&RemotePort::A].site_ids(), vec![3, 1]);
    }

    #[test]
    fn test_no_valid_sites_is_fatal() {
        let map: PlacementMap = "7:A:5,6".parse().unwrap();
        let err = map
            .resolve("acq2106_007", 7, &available(&[1, 2]))
            .unwrap_err();
        assert!(err.to_string().contains("has no valid sites"));
    }

    #[test]
    fn test_unmapped_unit_is_fatal() {
        let map: PlacementMap = "7:A:1".parse().unwrap();
        let err = map
            .resolve("acq2106_008", 8, &available(&[1]))
            .unwrap_err();
        assert!(err.to_string().contains("has no valid map"));
    }

    #[test]
    fn test_malformed_entries() {
        assert!("7:A".parse::<PlacementMap>().is_err());
        assert!("7:A:1:2".parse::<PlacementMap>().is_err());
        assert!("7:D:1".parse::<PlacementMap>().is_err());
        assert!("x7:A:1".parse::<PlacementMap>().is_err());
        assert!("7:A:one".parse::<PlacementMap>().is_err());
        assert!("7:A:".parse::<PlacementMap>().is_err());
    }

    #[test]
    fn test_unit_id() {
        assert_eq!(unit_id("007").unwrap(), 7);
        assert_eq!(unit_id("130").unwrap(), 130);
        assert_eq!(unit_id("000").unwrap(), 0);
        assert!(unit_id("").is_err());
    }

    proptest! {
        #[test]
        fn prop_split_partitions_sites(n in 1usize..16) {
            let ids: Vec<u8> = (1..=n as u8).collect();
            let sites = available(&ids);
            let map: PlacementMap = "ALL:BOTH:SPLIT".parse().unwrap();

            match map.resolve("acq2106_001", 1, &sites) {
                Ok(out) => {
                    let mut joined = out[&RemotePort::B].site_ids();
                    joined.extend(out[&RemotePort::A].site_ids());
                    prop_assert_eq!(joined, ids);
                    prop_assert_eq!(out[&RemotePort::B].len(), n / 2);
                }
                // A single site leaves B empty
                Err(e) => prop_assert!(n == 1 && e.is_config()),
            }
        }

        #[test]
        fn prop_list_resolves_to_available_subset(
            aggregated in proptest::collection::btree_set(1u8..7, 1..6),
            requested in proptest::collection::vec(1u8..7, 1..6),
        ) {
            let ids: Vec<u8> = aggregated.iter().copied().collect();
            let sites = available(&ids);
            let list: Vec<String> = requested.iter().map(u8::to_string).collect();
            let map: PlacementMap = format!("1:A:{}", list.join(",")).parse().unwrap();

            if let Ok(out) = map.resolve("acq2106_001", 1, &sites) {
                for site in out[&RemotePort::A].site_ids() {
                    prop_assert!(aggregated.contains(&site));
                    prop_assert!(requested.contains(&site));
                }
            } else {
                prop_assert!(requested.iter().all(|s| !aggregated.contains(s)));
            }
        }
    }
}
