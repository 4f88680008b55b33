//! Flow enrichment: GeoIP country, ASN/organisation and exporter hostname.

pub mod dns;
pub mod geoip;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::enrich::dns::DnsCache;
use crate::enrich::geoip::GeoIp;
use crate::producer::message::FlowMessage;

/// Country sentinel for addresses outside every range. Never empty, so
/// downstream group-bys always have a bucket.
pub const COUNTRY_UNKNOWN: &str = "??";

pub struct Enricher {
    geoip: GeoIp,
    dns: DnsCache,
}

impl Enricher {
    pub fn new(geoip: GeoIp, dns: DnsCache) -> Self {
        Self { geoip, dns }
    }

    /// Annotates one canonical flow in place.
    pub fn enrich(&self, flow: &mut FlowMessage) {
        let src = bytes_to_ip(&flow.src_addr);
        let dst = bytes_to_ip(&flow.dst_addr);

        flow.src_country = lookup_country(&self.geoip, src);
        flow.dst_country = lookup_country(&self.geoip, dst);

        // A GeoIP hit overrides the AS carried on the wire; a miss keeps
        // whatever the exporter reported.
        if let Some((asn, org)) = src.and_then(|ip| self.geoip.asn(ip)) {
            flow.src_as = asn;
            flow.src_as_org = org.to_string();
        }
        if let Some((asn, org)) = dst.and_then(|ip| self.geoip.asn(ip)) {
            flow.dst_as = asn;
            flow.dst_as_org = org.to_string();
        }

        if let Some(sampler) = bytes_to_ip(&flow.sampler_address) {
            flow.sampler_hostname = self.dns.get(sampler);
        }

        if flow.as_path.is_empty() {
            flow.as_path = vec![flow.src_as, 0, flow.dst_as];
        }
    }
}

fn lookup_country(geoip: &GeoIp, ip: Option<IpAddr>) -> String {
    ip.and_then(|ip| geoip.country(ip))
        .unwrap_or(COUNTRY_UNKNOWN)
        .to_string()
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(
            bytes[0], bytes[1], bytes[2], bytes[3],
        ))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
