//! IANA transport protocol numbers.
//!
//! Only the protocols that routinely show up in flow exports are named; the
//! rest map to [`ProtocolTypes::Unknown`] while the raw number is preserved
//! in the flow record itself.

use serde::Serialize;

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Serialize)]
pub enum ProtocolTypes {
    HOPOPT = 0,
    ICMP = 1,
    IGMP = 2,
    IPv4 = 4,
    TCP = 6,
    EGP = 8,
    UDP = 17,
    DCCP = 33,
    IPv6 = 41,
    IPv6Route = 43,
    IPv6Frag = 44,
    RSVP = 46,
    GRE = 47,
    ESP = 50,
    AH = 51,
    IPv6ICMP = 58,
    IPv6NoNxt = 59,
    IPv6Opts = 60,
    EIGRP = 88,
    OSPF = 89,
    IPIP = 94,
    PIM = 103,
    VRRP = 112,
    L2TP = 115,
    SCTP = 132,
    UDPLite = 136,
    MPLSinIP = 137,
    Unknown,
    Reserved = 255,
}

impl From<u8> for ProtocolTypes {
    fn from(value: u8) -> Self {
        match value {
            0 => ProtocolTypes::HOPOPT,
            1 => ProtocolTypes::ICMP,
            2 => ProtocolTypes::IGMP,
            4 => ProtocolTypes::IPv4,
            6 => ProtocolTypes::TCP,
            8 => ProtocolTypes::EGP,
            17 => ProtocolTypes::UDP,
            33 => ProtocolTypes::DCCP,
            41 => ProtocolTypes::IPv6,
            43 => ProtocolTypes::IPv6Route,
            44 => ProtocolTypes::IPv6Frag,
            46 => ProtocolTypes::RSVP,
            47 => ProtocolTypes::GRE,
            50 => ProtocolTypes::ESP,
            51 => ProtocolTypes::AH,
            58 => ProtocolTypes::IPv6ICMP,
            59 => ProtocolTypes::IPv6NoNxt,
            60 => ProtocolTypes::IPv6Opts,
            88 => ProtocolTypes::EIGRP,
            89 => ProtocolTypes::OSPF,
            94 => ProtocolTypes::IPIP,
            103 => ProtocolTypes::PIM,
            112 => ProtocolTypes::VRRP,
            115 => ProtocolTypes::L2TP,
            132 => ProtocolTypes::SCTP,
            136 => ProtocolTypes::UDPLite,
            137 => ProtocolTypes::MPLSinIP,
            255 => ProtocolTypes::Reserved,
            _ => ProtocolTypes::Unknown,
        }
    }
}

impl ProtocolTypes {
    /// Short display name used by the text formatter.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolTypes::HOPOPT => "HOPOPT",
            ProtocolTypes::ICMP => "ICMP",
            ProtocolTypes::IGMP => "IGMP",
            ProtocolTypes::IPv4 => "IPv4",
            ProtocolTypes::TCP => "TCP",
            ProtocolTypes::EGP => "EGP",
            ProtocolTypes::UDP => "UDP",
            ProtocolTypes::DCCP => "DCCP",
            ProtocolTypes::IPv6 => "IPv6",
            ProtocolTypes::IPv6Route => "IPv6Route",
            ProtocolTypes::IPv6Frag => "IPv6Frag",
            ProtocolTypes::RSVP => "RSVP",
            ProtocolTypes::GRE => "GRE",
            ProtocolTypes::ESP => "ESP",
            ProtocolTypes::AH => "AH",
            ProtocolTypes::IPv6ICMP => "IPv6ICMP",
            ProtocolTypes::IPv6NoNxt => "IPv6NoNxt",
            ProtocolTypes::IPv6Opts => "IPv6Opts",
            ProtocolTypes::EIGRP => "EIGRP",
            ProtocolTypes::OSPF => "OSPF",
            ProtocolTypes::IPIP => "IPIP",
            ProtocolTypes::PIM => "PIM",
            ProtocolTypes::VRRP => "VRRP",
            ProtocolTypes::L2TP => "L2TP",
            ProtocolTypes::SCTP => "SCTP",
            ProtocolTypes::UDPLite => "UDPLite",
            ProtocolTypes::MPLSinIP => "MPLSinIP",
            ProtocolTypes::Reserved => "Reserved",
            ProtocolTypes::Unknown => "Unknown",
        }
    }
}
