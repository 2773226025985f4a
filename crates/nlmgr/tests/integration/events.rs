//! Subscription integration tests.

use nlmgr::netlink::addr::Addr;
use nlmgr::netlink::events::{
    SubscribeOptions, UpdateKind, subscribe_addrs, subscribe_links, subscribe_neighs,
    subscribe_routes, subscribe_xfrm_expire,
};
use nlmgr::netlink::link::{LinkKind, NewLink};
use nlmgr::netlink::neigh::Neigh;
use nlmgr::netlink::route::Route;
use nlmgr::netlink::types::neigh::nud;
use nlmgr::netlink::xfrm::{XfrmAlgo, XfrmLimits, XfrmProto, XfrmState};
use nlmgr::netlink::Protocol;
use nlmgr::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;

use crate::common::{TestNamespace, add_dummy};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_link_added_and_removed() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("linkev")?;
    let mut links = subscribe_links(SubscribeOptions::new().namespace(ns.spec()))?;

    let conn = ns.connection(Protocol::Route)?;
    conn.link_add(&NewLink::new("dummy0", LinkKind::Dummy)).await?;
    let index = conn.link_by_name("dummy0").await?.index;
    conn.link_del(index).await?;

    let mut seen = Vec::new();
    while let Ok(Some(update)) = tokio::time::timeout(WAIT, links.recv()).await {
        if update.value.name == "dummy0" {
            seen.push(update.kind);
            if update.kind == UpdateKind::Removed {
                break;
            }
        }
    }
    assert_eq!(seen.first(), Some(&UpdateKind::Added));
    assert_eq!(seen.last(), Some(&UpdateKind::Removed));

    links.close();
    links.join().await;
    Ok(())
}

#[tokio::test]
async fn test_list_existing_precedes_live_updates() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("addrlist")?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;
    let existing = Addr::new(IpAddr::V4(Ipv4Addr::new(10, 3, 0, 1)), 24);
    conn.addr_add(index, &existing).await?;

    let options = SubscribeOptions::new()
        .namespace(ns.spec())
        .list_existing(true);
    let mut addrs = subscribe_addrs(options)?.into_stream();

    let fresh = Addr::new(IpAddr::V4(Ipv4Addr::new(10, 4, 0, 1)), 24);
    conn.addr_add(index, &fresh).await?;

    let mut order = Vec::new();
    while let Ok(Some(update)) = tokio::time::timeout(WAIT, addrs.next()).await {
        if update.value.ip == existing.ip || update.value.ip == fresh.ip {
            order.push(update.value.ip);
        }
        if update.value.ip == fresh.ip {
            break;
        }
    }
    assert_eq!(order, vec![existing.ip, fresh.ip]);

    Ok(())
}

#[tokio::test]
async fn test_route_and_neigh_updates() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("rtev")?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;
    conn.addr_add(index, &Addr::new(IpAddr::V4(Ipv4Addr::new(10, 5, 0, 1)), 24))
        .await?;

    let mut routes = subscribe_routes(SubscribeOptions::new().namespace(ns.spec()))?;
    let mut neighs = subscribe_neighs(SubscribeOptions::new().namespace(ns.spec()))?;

    let route = Route::new()
        .dst("172.16.0.0/12".parse().unwrap())
        .gateway(IpAddr::V4(Ipv4Addr::new(10, 5, 0, 254)));
    conn.route_add(&route).await?;
    let neigh = Neigh::new(index)
        .ip(IpAddr::V4(Ipv4Addr::new(10, 5, 0, 7)))
        .hardware_addr([2, 0, 0, 0, 0, 7])
        .state(nud::PERMANENT);
    conn.neigh_add(&neigh).await?;

    let mut found_route = false;
    while let Ok(Some(update)) = tokio::time::timeout(WAIT, routes.recv()).await {
        if update.value.dst == route.dst {
            assert_eq!(update.kind, UpdateKind::Added);
            found_route = true;
            break;
        }
    }
    assert!(found_route);

    let mut found_neigh = false;
    while let Ok(Some(update)) = tokio::time::timeout(WAIT, neighs.recv()).await {
        if update.value.ip == neigh.ip {
            found_neigh = true;
            break;
        }
    }
    assert!(found_neigh);

    Ok(())
}

#[tokio::test]
async fn test_done_signal_stops_subscription() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("evdone")?;
    let (stop, done) = oneshot::channel();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    let mut links = subscribe_links(
        SubscribeOptions::new()
            .namespace(ns.spec())
            .error_channel(errors_tx)
            .done(done),
    )?;

    stop.send(()).unwrap();
    let end = tokio::time::timeout(WAIT, links.recv()).await;
    assert!(matches!(end, Ok(None)));
    assert!(errors.try_recv().is_err());

    Ok(())
}

#[tokio::test]
async fn test_soft_expire_notification() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("xfrmev")?;
    let mut expires = subscribe_xfrm_expire(SubscribeOptions::new().namespace(ns.spec()))?;

    let conn = ns.connection(Protocol::Xfrm)?;
    let state = XfrmState::new(
        "10.6.0.1".parse().unwrap(),
        "10.6.0.2".parse().unwrap(),
        XfrmProto::Esp,
        0x600,
    )
    .auth(XfrmAlgo::auth("hmac(sha256)", [0x44; 32], 128))
    .crypt(XfrmAlgo::new("cbc(aes)", [0x55; 16]))
    .limits(XfrmLimits {
        time_soft: 1,
        time_hard: 2,
        ..Default::default()
    });
    conn.xfrm_state_add(&state).await?;

    let first = tokio::time::timeout(Duration::from_secs(10), expires.recv())
        .await
        .expect("expire notification within the hard limit")
        .expect("subscription still running");
    assert_eq!(first.state.spi, 0x600);
    assert!(!first.hard);

    Ok(())
}
