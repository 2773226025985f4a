//! IPsec state and policy integration tests.

use nlmgr::netlink::Protocol;
use nlmgr::netlink::xfrm::{
    PolicyDir, XfrmAlgo, XfrmLimits, XfrmMark, XfrmMode, XfrmPolicy, XfrmPolicyTmpl, XfrmProto,
    XfrmState,
};
use nlmgr::Result;
use std::net::IpAddr;

use crate::common::TestNamespace;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn esp_state(spi: u32) -> XfrmState {
    XfrmState::new(ip("10.10.0.1"), ip("10.10.0.2"), XfrmProto::Esp, spi)
        .mode(XfrmMode::Tunnel)
        .reqid(spi)
        .replay_window(32)
        .auth(XfrmAlgo::auth("hmac(sha256)", [0x11; 32], 128))
        .crypt(XfrmAlgo::new("cbc(aes)", [0x22; 16]))
}

#[tokio::test]
async fn test_state_lifecycle() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("xfrmsa")?;
    let conn = ns.connection(Protocol::Xfrm)?;

    let state = esp_state(0x100).mark(XfrmMark::new(5, 0xff));
    conn.xfrm_state_add(&state).await?;

    let found = conn.xfrm_state_get(&state).await?;
    assert_eq!(found.spi, 0x100);
    assert_eq!(found.mode, XfrmMode::Tunnel);
    assert_eq!(found.mark, state.mark);
    assert_eq!(
        found.auth.as_ref().map(|a| a.truncate_len),
        Some(128)
    );
    assert_eq!(found.crypt.as_ref().map(|a| a.name.as_str()), Some("cbc(aes)"));

    let limited = state.clone().limits(XfrmLimits {
        byte_hard: 1 << 30,
        ..Default::default()
    });
    conn.xfrm_state_update(&limited).await?;
    assert_eq!(conn.xfrm_state_get(&state).await?.limits.byte_hard, 1 << 30);

    let states = conn.xfrm_state_list(libc::AF_INET as u8).await?;
    assert_eq!(states.len(), 1);
    assert!(conn.xfrm_state_list(libc::AF_INET6 as u8).await?.is_empty());

    conn.xfrm_state_del(&state).await?;
    let err = conn.xfrm_state_get(&state).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");

    Ok(())
}

#[tokio::test]
async fn test_state_flush_by_protocol() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("xfrmflush")?;
    let conn = ns.connection(Protocol::Xfrm)?;

    conn.xfrm_state_add(&esp_state(0x200)).await?;
    let ah = XfrmState::new(ip("10.10.0.1"), ip("10.10.0.2"), XfrmProto::Ah, 0x201)
        .auth(XfrmAlgo::auth("hmac(sha1)", [0x33; 20], 96));
    conn.xfrm_state_add(&ah).await?;

    conn.xfrm_state_flush(Some(XfrmProto::Ah)).await?;
    let states = conn.xfrm_state_list(0).await?;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].proto, XfrmProto::Esp);

    conn.xfrm_state_flush(None).await?;
    assert!(conn.xfrm_state_list(0).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_policy_lifecycle() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("xfrmsp")?;
    let conn = ns.connection(Protocol::Xfrm)?;

    let policy = XfrmPolicy::new(
        "10.1.0.0/24".parse().unwrap(),
        "10.2.0.0/24".parse().unwrap(),
        PolicyDir::Out,
    )
    .priority(10)
    .template(
        XfrmPolicyTmpl::new(XfrmProto::Esp, XfrmMode::Tunnel)
            .endpoints(ip("10.10.0.1"), ip("10.10.0.2"))
            .reqid(0x100),
    );
    conn.xfrm_policy_add(&policy).await?;

    let found = conn.xfrm_policy_get(&policy).await?;
    assert_eq!(found.dst, policy.dst);
    assert_eq!(found.priority, 10);
    assert_eq!(found.templates.len(), 1);
    assert_eq!(found.templates[0].reqid, 0x100);
    assert_ne!(found.index, 0);

    conn.xfrm_policy_update(&policy.clone().priority(20)).await?;
    assert_eq!(conn.xfrm_policy_get(&policy).await?.priority, 20);

    let policies = conn.xfrm_policy_list(libc::AF_INET as u8).await?;
    assert_eq!(policies.len(), 1);

    conn.xfrm_policy_del(&policy).await?;
    let err = conn.xfrm_policy_get(&policy).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");

    conn.xfrm_policy_add(&policy).await?;
    conn.xfrm_policy_flush().await?;
    assert!(conn.xfrm_policy_list(0).await?.is_empty());

    Ok(())
}
