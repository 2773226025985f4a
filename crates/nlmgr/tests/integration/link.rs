//! Link integration tests.

use nlmgr::netlink::Protocol;
use nlmgr::netlink::bridge_vlan::BridgeVlan;
use nlmgr::netlink::link::{LinkKind, NewLink};
use nlmgr::{Error, Result};

use crate::common::{TestNamespace, add_dummy};

#[tokio::test]
async fn test_create_dummy_interface() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("dummy")?;
    let conn = ns.connection(Protocol::Route)?;

    conn.link_add(&NewLink::new("dummy0", LinkKind::Dummy).mtu(1400))
        .await?;

    let dummy = conn.link_by_name("dummy0").await?;
    assert_eq!(dummy.kind, Some(LinkKind::Dummy));
    assert_eq!(dummy.mtu, 1400);
    assert!(!dummy.is_up());

    conn.link_set_up(dummy.index).await?;
    assert!(conn.link_by_index(dummy.index).await?.is_up());

    conn.link_set_mtu(dummy.index, 9000).await?;
    assert_eq!(conn.link_by_index(dummy.index).await?.mtu, 9000);

    conn.link_del(dummy.index).await?;
    let links = conn.link_list().await?;
    assert!(!links.iter().any(|l| l.name == "dummy0"));

    Ok(())
}

#[tokio::test]
async fn test_duplicate_link_rejected() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("duplink")?;
    let conn = ns.connection(Protocol::Route)?;

    let link = NewLink::new("dup0", LinkKind::Dummy);
    conn.link_add(&link).await?;
    let err = conn.link_add(&link).await.unwrap_err();
    assert_eq!(err.errno(), Some(libc::EEXIST));

    Ok(())
}

#[tokio::test]
async fn test_missing_link() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("nolink")?;
    let conn = ns.connection(Protocol::Route)?;

    let err = conn.link_by_name("nope0").await.unwrap_err();
    assert!(matches!(err, Error::InterfaceNotFound { .. }));
    assert!(err.is_not_found());

    Ok(())
}

#[tokio::test]
async fn test_loopback_present() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("lo")?;
    let conn = ns.connection(Protocol::Route)?;

    let lo = conn.link_by_name("lo").await?;
    assert!(lo.is_loopback());
    assert_eq!(lo.index, 1);

    Ok(())
}

#[tokio::test]
async fn test_bridge_port_vlans() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("brvlan")?;
    let conn = ns.connection(Protocol::Route)?;

    conn.link_add(&NewLink::new("br0", LinkKind::Bridge)).await?;
    let bridge = conn.link_by_name("br0").await?;
    conn.link_add(&NewLink::new("port0", LinkKind::Dummy).master(bridge.index))
        .await?;
    let port = conn.link_by_name("port0").await?;
    assert_eq!(port.master_index, bridge.index);

    conn.bridge_vlan_add(&BridgeVlan::new(port.index, 100).master())
        .await?;
    let vlans = conn.bridge_vlan_list().await?;
    let port_vlans = vlans.get(&port.index).cloned().unwrap_or_default();
    assert!(port_vlans.iter().any(|v| v.vid == 100));

    conn.bridge_vlan_del(&BridgeVlan::new(port.index, 100).master())
        .await?;
    let vlans = conn.bridge_vlan_list().await?;
    let port_vlans = vlans.get(&port.index).cloned().unwrap_or_default();
    assert!(!port_vlans.iter().any(|v| v.vid == 100));

    Ok(())
}

#[tokio::test]
async fn test_ifb_interface() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("ifb")?;
    let conn = ns.connection(Protocol::Route)?;

    let index = add_dummy(&conn, "dummy0").await?;
    conn.link_add(&NewLink::new("ifb0", LinkKind::Ifb)).await?;
    let ifb = conn.link_by_name("ifb0").await?;
    assert_eq!(ifb.kind, Some(LinkKind::Ifb));
    assert_ne!(ifb.index, index);

    Ok(())
}
