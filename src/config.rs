//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};

use tracing::error;

use crate::ip::IpAddrExt;
use crate::session::SessionConfig;
#[cfg(test)]
use crate::session::DFLT_MIN_TX_INTV;

// Maximum instance name length, including the terminating NUL, matching
// keepalived's `BFD_INAME_MAX` (spec.md §3: "≤ 31 bytes").
pub const INAME_MAX: usize = 31;

const MINRX_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;
const MINTX_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;
const IDLETX_RANGE: std::ops::RangeInclusive<u32> = 1000..=10000;
const MULTIPLIER_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

// One parsed `bfd_instance` block, before it is checked against its
// siblings for duplicate names/addresses (§6, `bfd_parser.c`).
struct RawInstance {
    name: String,
    config: SessionConfig,
}

// Parses the flat keyed grammar of §6 into a list of `(name, SessionConfig)`
// pairs, applying the exact per-key error dispositions `bfd_parser.c` uses
// (see SPEC_FULL.md §6 ADDED table). Never fails outright: a malformed key
// either disables the offending instance or is silently ignored, keeping
// the rest of the file usable (spec.md §7: "Configuration error ... never
// abort the daemon").
pub fn parse(input: &str) -> Vec<(String, SessionConfig)> {
    let mut instances: Vec<RawInstance> = Vec::new();

    for line in input.lines() {
        let line = strip_comment(line);
        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else {
            continue;
        };
        let value = tokens.next();

        match keyword {
            "bfd_instance" => {
                let Some(name) = value else {
                    error!("configuration error: bfd_instance with no name, skipping");
                    continue;
                };
                instances.push(new_instance(&instances, name));
            }
            _ => {
                let Some(instance) = instances.last_mut() else {
                    error!(%keyword, "configuration error: key outside of a bfd_instance block, ignoring");
                    continue;
                };
                apply_key(instance, keyword, value);
            }
        }
    }

    for instance in &mut instances {
        if instance.config.neighbor.ip().is_unspecified()
            && !instance.config.disabled
        {
            error!(
                name = %instance.name,
                "configuration error: bfd instance has no neighbor_ip, disabling instance"
            );
            instance.config.disabled = true;
        }
    }

    // Duplicate neighbor addresses are caught only once every instance's
    // address is known, mirroring `find_bfd_by_addr`'s whole-list scan.
    let mut configs: Vec<(String, SessionConfig)> = Vec::new();
    for instance in instances {
        let mut config = instance.config;
        if !config.disabled
            && !config.neighbor.ip().is_unspecified()
            && configs.iter().any(|(_, c): &(String, SessionConfig)| {
                !c.disabled && c.neighbor == config.neighbor
            })
        {
            error!(
                name = %instance.name,
                neighbor = %config.neighbor,
                "configuration error: duplicate neighbor address, disabling instance"
            );
            config.disabled = true;
        }
        configs.push((instance.name, config));
    }
    configs
}

// Allocates a fresh instance, truncating an over-long name and renaming a
// duplicate, each disabling the instance (§6 ADDED table).
fn new_instance(existing: &[RawInstance], name: &str) -> RawInstance {
    let mut disabled = false;
    let mut iname = name.to_string();

    if iname.len() > INAME_MAX {
        let truncated: String = iname.chars().take(INAME_MAX).collect();
        error!(
            original = %name,
            truncated = %truncated,
            "configuration error: bfd instance name was truncated, disabling instance"
        );
        iname = truncated;
        disabled = true;
    }

    if existing.iter().any(|i| i.name == iname) {
        let renamed = format!("<DUP-{}>", existing.len());
        error!(
            original = %name,
            renamed = %renamed,
            "configuration error: bfd instance was renamed due to a duplicate name, disabling instance"
        );
        iname = renamed;
        disabled = true;
    }

    RawInstance {
        name: iname,
        config: SessionConfig {
            disabled,
            ..SessionConfig::default()
        },
    }
}

fn apply_key(instance: &mut RawInstance, keyword: &str, value: Option<&str>) {
    match keyword {
        "neighbor_ip" => match parse_host_port(value, 3784) {
            Some(addr) if addr.ip().is_usable() => instance.config.neighbor = addr,
            _ => {
                error!(
                    name = %instance.name,
                    value = ?value,
                    "configuration error: malformed neighbor address, disabling instance"
                );
                instance.config.disabled = true;
            }
        },
        "source_ip" => match value.and_then(|v| v.parse::<IpAddr>().ok()) {
            Some(addr) => instance.config.source = Some(addr),
            None => {
                error!(
                    name = %instance.name,
                    value = ?value,
                    "configuration error: malformed source address, ignoring"
                );
            }
        },
        "min_rx" => set_ranged(instance, value, &MINRX_RANGE, |i, v| {
            i.config.local_min_rx_intv = v * 1000
        }),
        "min_tx" => set_ranged(instance, value, &MINTX_RANGE, |i, v| {
            i.config.local_min_tx_intv = v * 1000
        }),
        "idle_tx" => set_ranged(instance, value, &IDLETX_RANGE, |i, v| {
            i.config.local_idle_tx_intv = v * 1000
        }),
        "multiplier" => {
            let value = value.and_then(|v| v.parse::<u32>().ok());
            match value {
                Some(v)
                    if u8::try_from(v)
                        .is_ok_and(|v| MULTIPLIER_RANGE.contains(&v)) =>
                {
                    instance.config.local_detect_mult = v as u8;
                }
                _ => {
                    error!(
                        name = %instance.name,
                        value = ?value,
                        min = MULTIPLIER_RANGE.start(),
                        max = MULTIPLIER_RANGE.end(),
                        "configuration error: multiplier out of range, ignoring"
                    );
                }
            }
        }
        "disabled" => instance.config.disabled = true,
        _ => {
            error!(name = %instance.name, %keyword, "configuration error: unrecognised key, ignoring");
        }
    }
}

// Shared body for the three `N..=M` millisecond keys: parse, range-check,
// and apply in microseconds, or log and keep the previous (default) value.
fn set_ranged(
    instance: &mut RawInstance,
    value: Option<&str>,
    range: &std::ops::RangeInclusive<u32>,
    apply: impl FnOnce(&mut RawInstance, u32),
) {
    match value.and_then(|v| v.parse::<u32>().ok()) {
        Some(v) if range.contains(&v) => apply(instance, v),
        other => {
            error!(
                name = %instance.name,
                value = ?other,
                min = range.start(),
                max = range.end(),
                "configuration error: value out of range, ignoring"
            );
        }
    }
}

fn parse_host_port(value: Option<&str>, default_port: u16) -> Option<SocketAddr> {
    let value = value?;
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    let ip = value.parse::<IpAddr>().ok()?;
    Some(SocketAddr::new(ip, default_port))
}

fn strip_comment(line: &str) -> &str {
    match line.find('!').or_else(|| line.find('#')) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_instance() {
        let input = "bfd_instance peer1\n  neighbor_ip 10.0.0.1\n";
        let configs = parse(input);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, "peer1");
        assert_eq!(
            configs[0].1.neighbor,
            "10.0.0.1:3784".parse::<SocketAddr>().unwrap()
        );
        assert!(!configs[0].1.disabled);
    }

    #[test]
    fn out_of_range_min_tx_keeps_default() {
        let input = "bfd_instance peer1\n  neighbor_ip 10.0.0.1\n  min_tx 5000\n";
        let configs = parse(input);
        assert_eq!(configs[0].1.local_min_tx_intv, DFLT_MIN_TX_INTV);
    }

    #[test]
    fn disabled_flag_sets_admindown() {
        let input = "bfd_instance peer1\n  neighbor_ip 10.0.0.1\n  disabled\n";
        let configs = parse(input);
        assert!(configs[0].1.disabled);
    }

    #[test]
    fn duplicate_name_is_renamed_and_disabled() {
        let input = "bfd_instance peerA\n  neighbor_ip 10.0.0.1\n\
                      bfd_instance peerA\n  neighbor_ip 10.0.0.2\n";
        let configs = parse(input);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].0, "peerA");
        assert!(!configs[0].1.disabled);
        assert_eq!(configs[1].0, "<DUP-1>");
        assert!(configs[1].1.disabled);
    }

    #[test]
    fn duplicate_neighbor_address_disables_second_instance() {
        let input = "bfd_instance peerA\n  neighbor_ip 10.0.0.1\n\
                      bfd_instance peerB\n  neighbor_ip 10.0.0.1\n";
        let configs = parse(input);
        assert!(!configs[0].1.disabled);
        assert!(configs[1].1.disabled);
    }

    #[test]
    fn oversized_name_is_truncated_and_disabled() {
        let name = "a".repeat(40);
        let input = format!("bfd_instance {name}\n  neighbor_ip 10.0.0.1\n");
        let configs = parse(&input);
        assert_eq!(configs[0].0.len(), INAME_MAX);
        assert!(configs[0].1.disabled);
    }

    #[test]
    fn missing_neighbor_disables_instance() {
        let input = "bfd_instance peer1\n  min_tx 10\n";
        let configs = parse(input);
        assert_eq!(configs.len(), 1);
        assert!(configs[0].1.disabled);
    }

    #[test]
    fn comments_are_ignored() {
        let input = "! a comment\nbfd_instance peer1\n  neighbor_ip 10.0.0.1 ! trailing\n";
        let configs = parse(input);
        assert_eq!(configs.len(), 1);
        assert_eq!(
            configs[0].1.neighbor,
            "10.0.0.1:3784".parse::<SocketAddr>().unwrap()
        );
    }
}
