use std::mem::size_of;

use anyhow::anyhow;
use bytes::Buf;


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow: {} bytes required, {} remaining", size_of::<$ty>(), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}

/// Big-endian getters that fail on truncated input instead of panicking. All integers on the
///  wire are in network byte order.
pub trait BufExt: Buf {
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_u64, u64, get_u64);
    get_checked_impl!(checked_get_i64, i64, get_i64);
}

impl <T: Buf> BufExt for T {
}
