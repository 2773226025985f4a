//! Neighbor table (ARP / NDP / bridge FDB) management.

use std::net::IpAddr;

use super::attr::{AttrIter, get};
use super::builder::Request;
use super::connection::{
    Connection, ack_request, append_request, create_request, dump_request, replace_request,
};
use super::error::{Error, Result};
use super::message::NlMsgType;
use super::parse::{ip_bytes, ip_family, parse_ip_by_len, split_header};
use super::types::neigh::{NdMsg, nda};

/// A neighbor entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neigh {
    pub link_index: u32,
    /// Inferred from `ip` when zero; set AF_BRIDGE for FDB entries.
    pub family: u8,
    /// NUD_* state bits.
    pub state: u16,
    pub neigh_type: u8,
    /// NTF_* flags.
    pub flags: u8,
    pub ip: Option<IpAddr>,
    pub hardware_addr: Vec<u8>,
    /// Bridge VLAN of an FDB entry.
    pub vlan: Option<u16>,
    pub master_index: u32,
}

impl Neigh {
    pub fn new(link_index: u32) -> Self {
        Self {
            link_index,
            ..Default::default()
        }
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn hardware_addr(mut self, addr: impl Into<Vec<u8>>) -> Self {
        self.hardware_addr = addr.into();
        self
    }

    pub fn state(mut self, state: u16) -> Self {
        self.state = state;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn family(mut self, family: u8) -> Self {
        self.family = family;
        self
    }

    pub fn vlan(mut self, vlan: u16) -> Self {
        self.vlan = Some(vlan);
        self
    }

    fn write_request(&self, req: &mut Request) -> Result<()> {
        let family = match (self.family, &self.ip) {
            (0, Some(ip)) => ip_family(ip),
            (0, None) => {
                return Err(Error::InvalidRequest(
                    "neighbor needs an IP address or an explicit family".into(),
                ));
            }
            (family, _) => family,
        };
        if self.link_index == 0 {
            return Err(Error::InvalidRequest("neighbor needs a link index".into()));
        }

        req.append(&NdMsg {
            ndm_family: family,
            ndm_ifindex: self.link_index as i32,
            ndm_state: self.state,
            ndm_flags: self.flags,
            ndm_type: self.neigh_type,
            ..Default::default()
        });
        if let Some(ip) = &self.ip {
            req.append_attr(nda::DST, &ip_bytes(ip));
        }
        if !self.hardware_addr.is_empty() {
            req.append_attr(nda::LLADDR, &self.hardware_addr);
        }
        if let Some(vlan) = self.vlan {
            req.append_attr_u16(nda::VLAN, vlan);
        }
        if self.master_index != 0 {
            req.append_attr_u32(nda::MASTER, self.master_index);
        }
        Ok(())
    }

    /// Decode an `RTM_NEWNEIGH`/`RTM_DELNEIGH` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, attrs) = split_header::<NdMsg>(payload)?;
        let mut neigh = Neigh {
            link_index: header.ndm_ifindex as u32,
            family: header.ndm_family,
            state: header.ndm_state,
            neigh_type: header.ndm_type,
            flags: header.ndm_flags,
            ..Default::default()
        };
        for attr in AttrIter::new(attrs) {
            let (kind, value) = attr?;
            match kind {
                nda::DST => neigh.ip = Some(parse_ip_by_len(value)?),
                nda::LLADDR => neigh.hardware_addr = value.to_vec(),
                nda::VLAN => neigh.vlan = Some(get::u16_ne(value)?),
                nda::MASTER => neigh.master_index = get::u32_ne(value)?,
                _ => {}
            }
        }
        Ok(neigh)
    }
}

impl Connection {
    /// Add a neighbor entry; fails if it exists.
    pub async fn neigh_add(&self, neigh: &Neigh) -> Result<()> {
        let mut req = create_request(NlMsgType::RTM_NEWNEIGH);
        neigh.write_request(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("neigh_add"))
    }

    /// Add or replace a neighbor entry.
    pub async fn neigh_set(&self, neigh: &Neigh) -> Result<()> {
        let mut req = replace_request(NlMsgType::RTM_NEWNEIGH);
        neigh.write_request(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("neigh_set"))
    }

    /// Append an entry, used for multiple FDB destinations.
    pub async fn neigh_append(&self, neigh: &Neigh) -> Result<()> {
        let mut req = append_request(NlMsgType::RTM_NEWNEIGH);
        neigh.write_request(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("neigh_append"))
    }

    pub async fn neigh_del(&self, neigh: &Neigh) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELNEIGH);
        neigh.write_request(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("neigh_del"))
    }

    /// List neighbors. `link_index` 0 and `family` 0 match everything.
    pub async fn neigh_list(&self, link_index: u32, family: u8) -> Result<Vec<Neigh>> {
        let mut req = dump_request(NlMsgType::RTM_GETNEIGH);
        req.append(&NdMsg::new().with_family(family));

        let mut out = Vec::new();
        for payload in self.dump(req, NlMsgType::RTM_NEWNEIGH).await? {
            let neigh = Neigh::decode(&payload)?;
            if link_index == 0 || neigh.link_index == link_index {
                out.push(neigh);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::MessageIter;
    use crate::netlink::types::neigh::{nud, ntf};

    fn encode(neigh: &Neigh) -> Vec<u8> {
        let mut req = create_request(NlMsgType::RTM_NEWNEIGH);
        neigh.write_request(&mut req).unwrap();
        let bytes = req.serialize(0).unwrap();
        let (_, payload) = MessageIter::new(&bytes).next().unwrap().unwrap();
        payload.to_vec()
    }

    #[test]
    fn test_arp_entry_roundtrip() {
        let neigh = Neigh::new(2)
            .ip("192.168.1.10".parse().unwrap())
            .hardware_addr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
            .state(nud::PERMANENT);
        let payload = encode(&neigh);
        let (header, _) = split_header::<NdMsg>(&payload).unwrap();
        assert_eq!(header.ndm_family, libc::AF_INET as u8);
        assert_eq!(header.ndm_state, nud::PERMANENT);

        let decoded = Neigh::decode(&payload).unwrap();
        assert_eq!(decoded.ip, neigh.ip);
        assert_eq!(decoded.hardware_addr, neigh.hardware_addr);
        assert_eq!(decoded.link_index, 2);
        assert_eq!(decoded.family, libc::AF_INET as u8);
    }

    #[test]
    fn test_fdb_entry_without_ip() {
        let neigh = Neigh::new(4)
            .family(libc::AF_BRIDGE as u8)
            .hardware_addr([2, 0, 0, 0, 0, 9])
            .flags(ntf::SELF)
            .vlan(10);
        let decoded = Neigh::decode(&encode(&neigh)).unwrap();
        assert_eq!(decoded.ip, None);
        assert_eq!(decoded.vlan, Some(10));
        assert_eq!(decoded.flags, ntf::SELF);
        assert_eq!(decoded.family, libc::AF_BRIDGE as u8);
    }

    #[test]
    fn test_incomplete_neighbor_rejected() {
        let mut req = create_request(NlMsgType::RTM_NEWNEIGH);
        assert!(Neigh::new(1).write_request(&mut req).is_err());
        assert!(
            Neigh::new(0)
                .ip("::1".parse().unwrap())
                .write_request(&mut req)
                .is_err()
        );
    }
}
