//! GeoIP range tables.
//!
//! Country and ASN data are loaded from CSV range files and binary-searched
//! at lookup time. The v4 format is `INTIPLOW,INTIPHIGH,CC` with addresses
//! as big-endian unsigned integers; the v6 format spells the addresses out
//! (`IPV6LOW,IPV6HIGH,CC`). ASN files carry two extra columns:
//! `LOW,HIGH,ASN,ORG`. Blank lines and `#` comments are skipped.
//!
//! Tables are immutable after loading and lock-free to read.

use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeoipError {
    #[error("geoip file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("geoip file is incorrectly formatted at line {line}: {content}")]
    BadLine { line: usize, content: String },
}

#[derive(Debug)]
struct RangeEntry<T> {
    low: [u8; 16],
    high: [u8; 16],
    value: T,
}

/// Sorted, non-overlapping address ranges with a payload per range.
#[derive(Debug)]
struct RangeTable<T> {
    entries: Vec<RangeEntry<T>>,
}

impl<T> Default for RangeTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> RangeTable<T> {
    fn push(&mut self, low: [u8; 16], high: [u8; 16], value: T) {
        self.entries.push(RangeEntry { low, high, value });
    }

    fn finish(&mut self) {
        self.entries.sort_by(|a, b| a.high.cmp(&b.high));
    }

    /// First range whose high end is >= the key, then a containment check:
    /// addresses in gaps (e.g. 127.0.0.0/8) would otherwise resolve to the
    /// next higher range.
    fn lookup(&self, key: &[u8; 16]) -> Option<&T> {
        let index = self.entries.partition_point(|entry| entry.high < *key);
        let entry = self.entries.get(index)?;
        if entry.low <= *key && *key <= entry.high {
            Some(&entry.value)
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn ip_key(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// In-memory GeoIP databases: country and ASN, v4 and v6.
#[derive(Debug, Default)]
pub struct GeoIp {
    country_v4: RangeTable<String>,
    country_v6: RangeTable<String>,
    asn_v4: RangeTable<(u32, String)>,
    asn_v6: RangeTable<(u32, String)>,
}

impl GeoIp {
    /// Empty tables: every lookup misses. Used when the operator supplies
    /// no database files.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads whichever database files are configured.
    pub fn load(
        country_v4: Option<&Path>,
        country_v6: Option<&Path>,
        asn_v4: Option<&Path>,
        asn_v6: Option<&Path>,
    ) -> Result<Self, GeoipError> {
        let mut geoip = Self::empty();
        if let Some(path) = country_v4 {
            geoip.load_country_v4(open(path)?)?;
        }
        if let Some(path) = country_v6 {
            geoip.load_country_v6(open(path)?)?;
        }
        if let Some(path) = asn_v4 {
            geoip.load_asn_v4(open(path)?)?;
        }
        if let Some(path) = asn_v6 {
            geoip.load_asn_v6(open(path)?)?;
        }
        Ok(geoip)
    }

    pub fn load_country_v4(&mut self, reader: impl BufRead) -> Result<usize, GeoipError> {
        let loaded = load_lines(reader, 3, |columns, table: &mut RangeTable<String>| {
            let low = parse_v4_int(columns[0])?;
            let high = parse_v4_int(columns[1])?;
            table.push(low, high, columns[2].to_string());
            Some(())
        }, &mut self.country_v4)?;
        self.country_v4.finish();
        Ok(loaded)
    }

    pub fn load_country_v6(&mut self, reader: impl BufRead) -> Result<usize, GeoipError> {
        let loaded = load_lines(reader, 3, |columns, table: &mut RangeTable<String>| {
            let low = parse_v6(columns[0])?;
            let high = parse_v6(columns[1])?;
            table.push(low, high, columns[2].to_string());
            Some(())
        }, &mut self.country_v6)?;
        self.country_v6.finish();
        Ok(loaded)
    }

    pub fn load_asn_v4(&mut self, reader: impl BufRead) -> Result<usize, GeoipError> {
        let loaded = load_lines(reader, 4, |columns, table: &mut RangeTable<(u32, String)>| {
            let low = parse_v4_int(columns[0])?;
            let high = parse_v4_int(columns[1])?;
            let asn: u32 = columns[2].parse().ok()?;
            table.push(low, high, (asn, columns[3].to_string()));
            Some(())
        }, &mut self.asn_v4)?;
        self.asn_v4.finish();
        Ok(loaded)
    }

    pub fn load_asn_v6(&mut self, reader: impl BufRead) -> Result<usize, GeoipError> {
        let loaded = load_lines(reader, 4, |columns, table: &mut RangeTable<(u32, String)>| {
            let low = parse_v6(columns[0])?;
            let high = parse_v6(columns[1])?;
            let asn: u32 = columns[2].parse().ok()?;
            table.push(low, high, (asn, columns[3].to_string()));
            Some(())
        }, &mut self.asn_v6)?;
        self.asn_v6.finish();
        Ok(loaded)
    }

    /// Country code for an address, `None` when the address is in no range.
    pub fn country(&self, ip: IpAddr) -> Option<&str> {
        let key = ip_key(ip);
        let table = match ip {
            IpAddr::V4(_) => &self.country_v4,
            IpAddr::V6(_) => &self.country_v6,
        };
        table.lookup(&key).map(String::as_str)
    }

    /// ASN and organisation name for an address.
    pub fn asn(&self, ip: IpAddr) -> Option<(u32, &str)> {
        let key = ip_key(ip);
        let table = match ip {
            IpAddr::V4(_) => &self.asn_v4,
            IpAddr::V6(_) => &self.asn_v6,
        };
        table.lookup(&key).map(|(asn, org)| (*asn, org.as_str()))
    }

    pub fn entry_count(&self) -> usize {
        self.country_v4.len() + self.country_v6.len() + self.asn_v4.len() + self.asn_v6.len()
    }
}

fn open(path: &Path) -> Result<std::io::BufReader<std::fs::File>, GeoipError> {
    std::fs::File::open(path)
        .map(std::io::BufReader::new)
        .map_err(|source| GeoipError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn parse_v4_int(column: &str) -> Option<[u8; 16]> {
    let value: u32 = column.trim().parse().ok()?;
    Some(Ipv4Addr::from(value).to_ipv6_mapped().octets())
}

fn parse_v6(column: &str) -> Option<[u8; 16]> {
    let addr: std::net::Ipv6Addr = column.trim().parse().ok()?;
    Some(addr.octets())
}

fn load_lines<T>(
    reader: impl BufRead,
    columns: usize,
    mut parse: impl FnMut(&[&str], &mut RangeTable<T>) -> Option<()>,
    table: &mut RangeTable<T>,
) -> Result<usize, GeoipError> {
    let mut loaded = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| GeoipError::Io {
            path: "<stream>".to_string(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let split: Vec<&str> = trimmed.splitn(columns, ',').collect();
        if split.len() != columns || parse(&split, table).is_none() {
            return Err(GeoipError::BadLine {
                line: index + 1,
                content: line,
            });
        }
        loaded += 1;
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn v4_int(addr: &str) -> u32 {
        addr.parse::<Ipv4Addr>().unwrap().into()
    }

    fn test_geoip() -> GeoIp {
        let v4 = format!(
            "# comment line\n\
             {},{},CA\n\
             {},{},JP\n",
            v4_int("129.97.0.0"),
            v4_int("129.97.255.255"),
            v4_int("223.252.0.0"),
            v4_int("223.252.127.255"),
        );
        let v6 = "\
            2620:101:f000::,2620:101:f000:ffff:ffff:ffff:ffff:ffff,CA\n\
            2a07:2e40::,2a07:2e47:ffff:ffff:ffff:ffff:ffff:ffff,FR\n";

        let mut geoip = GeoIp::empty();
        assert_eq!(geoip.load_country_v4(Cursor::new(v4)).unwrap(), 2);
        assert_eq!(geoip.load_country_v6(Cursor::new(v6)).unwrap(), 2);
        geoip
    }

    fn country(geoip: &GeoIp, addr: &str) -> (String, bool) {
        match geoip.country(addr.parse().unwrap()) {
            Some(cc) => (cc.to_string(), true),
            None => (String::new(), false),
        }
    }

    #[test]
    fn ipv4_country_boundaries() {
        let geoip = test_geoip();
        assert_eq!(country(&geoip, "129.97.208.23"), ("CA".to_string(), true));
        assert_eq!(country(&geoip, "127.0.0.1"), (String::new(), false));
        assert_eq!(country(&geoip, "255.255.255.255"), (String::new(), false));
        assert_eq!(country(&geoip, "0.0.0.0"), (String::new(), false));
        // Both ends of a range resolve to the range's country.
        assert_eq!(country(&geoip, "223.252.0.0"), ("JP".to_string(), true));
        assert_eq!(country(&geoip, "223.252.127.255"), ("JP".to_string(), true));
        // One past the high end lands in the gap.
        assert_eq!(country(&geoip, "223.252.128.0"), (String::new(), false));
    }

    #[test]
    fn ipv6_country_boundaries() {
        let geoip = test_geoip();
        assert_eq!(
            country(&geoip, "2620:101:f000:0:250:56ff:fe80:168e"),
            ("CA".to_string(), true)
        );
        assert_eq!(country(&geoip, "2a07:2e40::"), ("FR".to_string(), true));
        assert_eq!(
            country(&geoip, "2a07:2e47:ffff:ffff:ffff:ffff:ffff:ffff"),
            ("FR".to_string(), true)
        );
        assert_eq!(country(&geoip, "fd00::1"), (String::new(), false));
        assert_eq!(country(&geoip, "::"), (String::new(), false));
        assert_eq!(
            country(&geoip, "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff"),
            (String::new(), false)
        );
    }

    #[test]
    fn asn_lookup_carries_org() {
        let asn = format!(
            "{},{},12345,Example Networks, Inc.\n",
            v4_int("198.51.100.0"),
            v4_int("198.51.100.255"),
        );
        let mut geoip = GeoIp::empty();
        geoip.load_asn_v4(Cursor::new(asn)).unwrap();

        let (number, org) = geoip.asn("198.51.100.7".parse().unwrap()).unwrap();
        assert_eq!(number, 12345);
        assert_eq!(org, "Example Networks, Inc.");
        assert!(geoip.asn("198.51.101.1".parse().unwrap()).is_none());
    }

    #[test]
    fn malformed_line_is_reported() {
        let mut geoip = GeoIp::empty();
        let err = geoip
            .load_country_v4(Cursor::new("1,2,US\nnot-a-number,5,FR\n"))
            .unwrap_err();
        match err {
            GeoipError::BadLine { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
