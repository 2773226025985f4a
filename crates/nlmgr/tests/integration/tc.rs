//! Traffic control integration tests.

use nlmgr::netlink::tc::{
    Class, ClassAttrs, Filter, FilterAttrs, FwFilter, HANDLE_INGRESS, HANDLE_ROOT, HtbClass,
    HtbQdisc, IngressQdisc, PschedClock, Qdisc, QdiscAttrs, TbfQdisc, U32Filter, U32Key, U32Sel,
    make_handle,
};
use nlmgr::netlink::types::tc::u32_attr;
use nlmgr::netlink::{Connection, Protocol};
use nlmgr::Result;

use crate::common::{TestNamespace, add_dummy};

async fn setup_tc_ns(name: &str) -> Result<(TestNamespace, Connection, u32)> {
    let ns = TestNamespace::new(name)?;
    let conn = ns.connection(Protocol::Route)?;
    let index = add_dummy(&conn, "dummy0").await?;
    Ok((ns, conn, index))
}

fn root_htb(index: u32) -> Qdisc {
    Qdisc::Htb(
        HtbQdisc::new(QdiscAttrs::new(index, make_handle(1, 0), HANDLE_ROOT)).default_class(0x10),
    )
}

#[tokio::test]
async fn test_tbf_qdisc() -> Result<()> {
    require_root!();

    let (_ns, conn, index) = setup_tc_ns("tbf").await?;
    let clock = PschedClock::from_proc().unwrap_or_default();

    let rate = 125_000;
    let tbf = TbfQdisc::new(
        QdiscAttrs::new(index, make_handle(1, 0), HANDLE_ROOT),
        rate,
        10_000,
        clock.xmit_time(rate, 3_000),
    );
    conn.qdisc_add(&Qdisc::Tbf(tbf)).await?;

    let qdiscs = conn.qdisc_list(index).await?;
    let Some(Qdisc::Tbf(found)) = qdiscs.iter().find(|q| q.kind() == "tbf") else {
        panic!("tbf qdisc should be listed: {qdiscs:?}");
    };
    assert_eq!(found.rate, rate);
    assert_eq!(found.attrs.handle, make_handle(1, 0));

    Ok(())
}

#[tokio::test]
async fn test_htb_hierarchy() -> Result<()> {
    require_root!();

    let (_ns, conn, index) = setup_tc_ns("htb").await?;
    let qdisc = root_htb(index);
    conn.qdisc_add(&qdisc).await?;

    let class = HtbClass::new(
        ClassAttrs::new(index, make_handle(1, 0x10), make_handle(1, 0)),
        1_000_000,
    )
    .ceil(2_000_000);
    conn.class_add(&Class::Htb(class)).await?;

    let classes = conn.class_list(index, make_handle(1, 0)).await?;
    let Some(Class::Htb(found)) = classes
        .iter()
        .find(|c| c.attrs().handle == make_handle(1, 0x10))
    else {
        panic!("htb class should be listed: {classes:?}");
    };
    assert_eq!(found.rate, 1_000_000);
    assert_eq!(found.ceil, 2_000_000);

    let filter = U32Filter::new(
        FilterAttrs::new(index, make_handle(1, 0), 1, libc::ETH_P_IP as u16),
    )
    .class_id(make_handle(1, 0x10))
    .sel(U32Sel::match_all());
    conn.filter_add(&Filter::U32(filter)).await?;

    let filters = conn.filter_list(index, make_handle(1, 0)).await?;
    let u32s: Vec<_> = filters
        .iter()
        .filter_map(|f| match f {
            Filter::U32(u) if u.class_id != 0 => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(u32s.len(), 1);
    assert_eq!(u32s[0].class_id, make_handle(1, 0x10));

    let fw = FwFilter::new(
        FilterAttrs::new(index, make_handle(1, 0), 2, libc::ETH_P_IP as u16).handle(7),
        make_handle(1, 0x10),
    );
    conn.filter_add(&Filter::Fw(fw.clone())).await?;
    let filters = conn.filter_list(index, make_handle(1, 0)).await?;
    assert!(filters.iter().any(|f| matches!(f, Filter::Fw(found) if found.class_id == fw.class_id)));

    conn.filter_del(&Filter::Fw(fw)).await?;
    conn.qdisc_del(&qdisc).await?;
    let qdiscs = conn.qdisc_list(index).await?;
    assert!(!qdiscs.iter().any(|q| q.kind() == "htb"));

    Ok(())
}

#[tokio::test]
async fn test_u32_hash_table_filter() -> Result<()> {
    require_root!();

    let (_ns, conn, index) = setup_tc_ns("u32ht").await?;
    let parent = make_handle(1, 0);
    conn.qdisc_add(&root_htb(index)).await?;
    let class_id = make_handle(1, 0x46cb);
    conn.class_replace(&Class::Htb(HtbClass::new(
        ClassAttrs::new(index, class_id, parent),
        512 * 1024,
    )))
    .await?;

    let htid = make_handle(0x10, 0);
    let table = Filter::U32(U32Filter {
        divisor: 1,
        ..U32Filter::new(FilterAttrs::new(index, parent, 1, libc::ETH_P_ALL as u16).handle(htid))
    });
    let copy = table.clone();
    conn.filter_add(&table).await?;
    assert_eq!(table, copy);

    let handle = make_handle(0, 1);
    let sel = U32Sel {
        flags: u32_attr::SEL_TERMINAL,
        keys: vec![
            U32Key {
                mask: 0xff,
                val: 80,
                off: 20,
                offmask: 0,
            },
            U32Key {
                mask: 0xffff,
                val: 0x46ca,
                off: 32,
                offmask: 0,
            },
        ],
        ..Default::default()
    };
    let filter = U32Filter {
        hash: htid,
        ..U32Filter::new(FilterAttrs::new(index, parent, 1, libc::ETH_P_ALL as u16).handle(handle))
            .class_id(class_id)
            .sel(sel.clone())
    };
    conn.filter_add(&Filter::U32(filter)).await?;

    let filters = conn.filter_list(index, parent).await?;
    let Some(found) = filters.iter().find_map(|f| match f {
        Filter::U32(u) if u.class_id == class_id => Some(u.clone()),
        _ => None,
    }) else {
        panic!("u32 filter should be listed: {filters:?}");
    };
    assert_eq!(found.attrs.handle, handle | htid);
    assert_eq!(found.hash, htid);
    let listed = found.sel.as_ref().expect("selector");
    assert_eq!(listed.keys, sel.keys);
    assert_eq!(listed.offmask, sel.offmask);
    assert_eq!(listed.hmask, sel.hmask);

    // The handle the kernel echoed back is the one that deletes it.
    conn.filter_del(&Filter::U32(found)).await?;
    let filters = conn.filter_list(index, parent).await?;
    assert!(
        !filters
            .iter()
            .any(|f| matches!(f, Filter::U32(u) if u.class_id == class_id))
    );

    Ok(())
}

#[tokio::test]
async fn test_ingress_qdisc() -> Result<()> {
    require_root!();

    let (_ns, conn, index) = setup_tc_ns("ingress").await?;
    conn.qdisc_add(&Qdisc::Ingress(IngressQdisc::new(index)))
        .await?;

    let qdiscs = conn.qdisc_list(index).await?;
    let found = qdiscs
        .iter()
        .find(|q| q.kind() == "ingress")
        .expect("ingress qdisc should be listed");
    assert_eq!(found.attrs().parent, HANDLE_INGRESS);

    Ok(())
}

#[tokio::test]
async fn test_replace_root_qdisc() -> Result<()> {
    require_root!();

    let (_ns, conn, index) = setup_tc_ns("qdrep").await?;
    conn.qdisc_add(&root_htb(index)).await?;
    assert!(conn.qdisc_add(&root_htb(index)).await.is_err());

    let tbf = TbfQdisc::new(
        QdiscAttrs::new(index, make_handle(1, 0), HANDLE_ROOT),
        250_000,
        20_000,
        PschedClock::default().xmit_time(250_000, 5_000),
    );
    conn.qdisc_replace(&Qdisc::Tbf(tbf)).await?;

    let qdiscs = conn.qdisc_list(index).await?;
    assert!(qdiscs.iter().any(|q| q.kind() == "tbf"));
    assert!(!qdiscs.iter().any(|q| q.kind() == "htb"));

    Ok(())
}
