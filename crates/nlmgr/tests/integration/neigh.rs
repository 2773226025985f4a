//! Neighbor integration tests.

use nlmgr::Result;
use nlmgr::netlink::Protocol;
use nlmgr::netlink::addr::Addr;
use nlmgr::netlink::neigh::Neigh;
use nlmgr::netlink::types::neigh::nud;
use std::net::{IpAddr, Ipv4Addr};

use crate::common::{TestNamespace, add_dummy};

#[tokio::test]
async fn test_permanent_arp_entry() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("neigh")?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;
    conn.addr_add(index, &Addr::new(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)), 24))
        .await?;

    let neigh = Neigh::new(index)
        .ip(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 9)))
        .hardware_addr([0x02, 0x00, 0x5e, 0x10, 0x00, 0x09])
        .state(nud::PERMANENT);
    conn.neigh_add(&neigh).await?;

    let entries = conn.neigh_list(index, libc::AF_INET as u8).await?;
    let found = entries
        .iter()
        .find(|n| n.ip == neigh.ip)
        .expect("entry should be listed");
    assert_eq!(found.hardware_addr, neigh.hardware_addr);
    assert_eq!(found.state, nud::PERMANENT);

    let moved = neigh.clone().hardware_addr([0x02, 0, 0, 0, 0, 0x0a]);
    conn.neigh_set(&moved).await?;
    let entries = conn.neigh_list(index, libc::AF_INET as u8).await?;
    let found = entries.iter().find(|n| n.ip == neigh.ip).unwrap();
    assert_eq!(found.hardware_addr, moved.hardware_addr);

    conn.neigh_del(&neigh).await?;
    let entries = conn.neigh_list(index, libc::AF_INET as u8).await?;
    assert!(!entries.iter().any(|n| n.ip == neigh.ip));

    Ok(())
}
