//! Address integration tests.

use nlmgr::Result;
use nlmgr::netlink::Protocol;
use nlmgr::netlink::addr::Addr;
use std::net::{IpAddr, Ipv4Addr};

use crate::common::{TestNamespace, add_dummy};

#[tokio::test]
async fn test_add_and_delete_ipv4_address() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("addr4")?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;

    let addr = Addr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 7, 1)), 24).label("dummy0:web");
    conn.addr_add(index, &addr).await?;

    let addrs = conn.addr_list(index, libc::AF_INET as u8).await?;
    let found = addrs
        .iter()
        .find(|a| a.ip == addr.ip)
        .expect("address should be listed");
    assert_eq!(found.prefix_len, 24);
    assert_eq!(found.label.as_deref(), Some("dummy0:web"));
    // Derived from the prefix when not given.
    assert_eq!(
        found.broadcast,
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 7, 255)))
    );

    conn.addr_del(index, &addr).await?;
    let addrs = conn.addr_list(index, libc::AF_INET as u8).await?;
    assert!(!addrs.iter().any(|a| a.ip == addr.ip));

    Ok(())
}

#[tokio::test]
async fn test_ipv6_address_with_lifetimes() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("addr6")?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;

    let addr = Addr::new("2001:db8::10".parse().unwrap(), 64).lifetimes(300, 600);
    conn.addr_add(index, &addr).await?;

    let addrs = conn.addr_list(index, libc::AF_INET6 as u8).await?;
    let found = addrs
        .iter()
        .find(|a| a.ip == addr.ip)
        .expect("address should be listed");
    assert!(found.valid_lft <= 600 && found.valid_lft > 0);
    assert!(found.preferred_lft <= 300);

    Ok(())
}

#[tokio::test]
async fn test_replace_address() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("addrrep")?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;

    let addr = Addr::new(IpAddr::V4(Ipv4Addr::new(10, 9, 0, 1)), 16);
    conn.addr_add(index, &addr).await?;
    assert!(conn.addr_add(index, &addr).await.is_err());
    conn.addr_replace(index, &addr).await?;

    let count = conn
        .addr_list(index, 0)
        .await?
        .iter()
        .filter(|a| a.ip == addr.ip)
        .count();
    assert_eq!(count, 1);

    Ok(())
}
