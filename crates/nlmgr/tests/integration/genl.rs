//! Generic netlink integration tests.

use nlmgr::netlink::Protocol;
use nlmgr::{Error, Result};

use crate::common::TestNamespace;

#[tokio::test]
async fn test_resolve_families_in_namespace() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("genl")?;
    let conn = ns.connection(Protocol::Generic)?;

    let families = conn.genl_family_list().await?;
    let ctrl = families
        .iter()
        .find(|f| f.name == "nlctrl")
        .expect("control family is always registered");
    assert_eq!(ctrl.id, 0x10);
    assert!(!ctrl.ops.is_empty());

    let by_name = conn.genl_family_get("nlctrl").await?;
    assert_eq!(&by_name, ctrl);

    let err = conn.genl_family_get("no-such-family").await.unwrap_err();
    assert!(matches!(err, Error::FamilyNotFound { ref name } if name == "no-such-family"));

    Ok(())
}
