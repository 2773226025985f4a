//! Kernel ABI structures.
//!
//! Every struct here is `#[repr(C)]` with explicit padding fields so that
//! its zerocopy byte view is exactly the kernel layout. Integers are in
//! host byte order unless a field documents otherwise.

/// Wire a fixed kernel struct into [`FromNetlink`](super::parse::FromNetlink)
/// and [`ToNetlink`](super::parse::ToNetlink).
macro_rules! kernel_struct {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $ty {
                /// Size of this structure on the wire.
                pub const SIZE: usize = std::mem::size_of::<Self>();
            }

            impl $crate::netlink::parse::FromNetlink for $ty {
                fn parse(input: &mut &[u8]) -> $crate::netlink::parse::PResult<Self> {
                    $crate::netlink::parse::parse_fixed(input)
                }
            }

            impl $crate::netlink::parse::ToNetlink for $ty {
                fn netlink_len(&self) -> usize {
                    Self::SIZE
                }

                fn write_to(&self, buf: &mut Vec<u8>) -> $crate::netlink::error::Result<usize> {
                    buf.extend_from_slice(zerocopy::IntoBytes::as_bytes(self));
                    Ok(Self::SIZE)
                }
            }
        )+
    };
}

pub mod addr;
pub mod bridge;
pub mod genl;
pub mod link;
pub mod mpls;
pub mod neigh;
pub mod route;
pub mod srv6;
pub mod tc;
pub mod xfrm;
