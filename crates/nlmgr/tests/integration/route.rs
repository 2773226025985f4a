//! Route integration tests.

use nlmgr::Result;
use nlmgr::netlink::Protocol;
use nlmgr::netlink::addr::Addr;
use nlmgr::netlink::route::{IpNet, NexthopInfo, Route, RouteFilter};
use nlmgr::netlink::types::route::{rt_table, rtn};
use nlmgr::netlink::Connection;
use std::net::{IpAddr, Ipv4Addr};

use crate::common::{TestNamespace, add_dummy};

/// A namespace with `dummy0` up and addressed 192.168.1.1/24.
async fn setup_routed_ns(name: &str) -> Result<(TestNamespace, Connection, u32)> {
    let ns = TestNamespace::new(name)?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;
    conn.addr_add(index, &Addr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 24))
        .await?;
    Ok((ns, conn, index))
}

fn ten_slash_eight() -> IpNet {
    "10.0.0.0/8".parse().unwrap()
}

#[tokio::test]
async fn test_route_via_gateway() -> Result<()> {
    require_root!();

    let (_ns, conn, index) = setup_routed_ns("rtgw").await?;

    let route = Route::new()
        .dst(ten_slash_eight())
        .gateway(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 254)))
        .link_index(index);
    conn.route_add(&route).await?;

    let filter = RouteFilter::new().dst(ten_slash_eight());
    let routes = conn.route_list(libc::AF_INET as u8, &filter).await?;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].gw, route.gw);
    assert_eq!(routes[0].link_index, index);
    assert_eq!(routes[0].effective_table(), rt_table::MAIN);

    // Adding the same route again is rejected.
    assert_eq!(
        conn.route_add(&route).await.unwrap_err().errno(),
        Some(libc::EEXIST)
    );
    conn.route_replace(&route).await?;

    conn.route_del(&route).await?;
    let routes = conn.route_list(libc::AF_INET as u8, &filter).await?;
    assert!(routes.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_route_get_resolves_output_link() -> Result<()> {
    require_root!();

    let (_ns, conn, index) = setup_routed_ns("rtget").await?;

    let routes = conn
        .route_get(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77)))
        .await?;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].link_index, index);

    Ok(())
}

#[tokio::test]
async fn test_blackhole_route_in_custom_table() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("rtblack")?;
    let conn = ns.connection(Protocol::Route)?;

    let dst: IpNet = "10.255.0.0/16".parse().unwrap();
    let route = Route::new()
        .dst(dst)
        .route_type(rtn::BLACKHOLE)
        .table(1000);
    conn.route_add(&route).await?;

    let routes = conn
        .route_list(libc::AF_INET as u8, &RouteFilter::new().table(1000))
        .await?;
    let found = routes
        .iter()
        .find(|r| r.dst == Some(dst))
        .expect("route should be in table 1000");
    assert_eq!(found.route_type, rtn::BLACKHOLE);
    assert_eq!(found.table, 1000);

    let main = conn
        .route_list(libc::AF_INET as u8, &RouteFilter::new().dst(dst))
        .await?;
    assert!(main.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_multipath_route() -> Result<()> {
    require_root!();

    let (ns, conn, first) = setup_routed_ns("rtmp").await?;
    let second = add_dummy(&conn, "dummy1").await?;
    conn.addr_add(second, &Addr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 2, 1)), 24))
        .await?;

    let route = Route::new().dst(ten_slash_eight()).multipath(vec![
        NexthopInfo::new(first).gateway(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2))),
        NexthopInfo::new(second).gateway(IpAddr::V4(Ipv4Addr::new(192, 168, 2, 2))),
    ]);
    conn.route_add(&route).await?;

    let routes = conn
        .route_list(
            libc::AF_INET as u8,
            &RouteFilter::new().dst(ten_slash_eight()),
        )
        .await?;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].multipath.len(), 2);
    assert_eq!(routes[0].multipath[1].link_index, second);

    let shown = ns.exec("ip", &["route", "show", "10.0.0.0/8"])?;
    assert!(shown.contains("nexthop"));

    Ok(())
}
