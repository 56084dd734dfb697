use std::net::IpAddr;
use once_cell::sync::Lazy;
use regex::Regex;

static MAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})$").unwrap());

/// Normalize a MAC address to upper-case colon form, or None if it is not one.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !MAC_RE.is_match(trimmed) {
        return None;
    }
    Some(trimmed.replace('-', ":").to_uppercase())
}

/// Check whether `ip` falls inside an address specification.
///
/// The specification is either a literal address ("192.168.4.20") or a CIDR
/// prefix ("192.168.4.0/24"). Anything unparsable matches nothing.
pub fn address_contains(spec: &str, ip: &IpAddr) -> bool {
    if let Some((network, prefix)) = spec.split_once('/') {
        let prefix: u8 = match prefix.parse() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match (ip, network.parse::<IpAddr>()) {
            (IpAddr::V4(ip_v4), Ok(IpAddr::V4(net_v4))) => {
                if prefix > 32 {
                    return false;
                }
                let ip_bits = u32::from_be_bytes(ip_v4.octets());
                let net_bits = u32::from_be_bytes(net_v4.octets());
                let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
                (ip_bits & mask) == (net_bits & mask)
            }
            (IpAddr::V6(ip_v6), Ok(IpAddr::V6(net_v6))) => {
                if prefix > 128 {
                    return false;
                }
                let ip_bits = u128::from_be_bytes(ip_v6.octets());
                let net_bits = u128::from_be_bytes(net_v6.octets());
                let mask = if prefix == 0 {
                    0
                } else {
                    !0u128 << (128 - prefix)
                };
                (ip_bits & mask) == (net_bits & mask)
            }
            _ => false,
        }
    } else {
        spec.parse::<IpAddr>().map(|s| &s == ip).unwrap_or(false)
    }
}

/// Check whether `ip` falls inside any of the given address specifications.
pub fn any_address_contains(specs: &[String], ip: &IpAddr) -> bool {
    specs.iter().any(|spec| address_contains(spec, ip))
}
