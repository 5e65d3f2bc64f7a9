use anyhow::anyhow;

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Range-checked reads for decoding untrusted network input. The names are deliberately
///  distinct from `bytes::Buf::try_get_*` so that both can be in scope at the same time.
pub trait BufExt: bytes::Buf {
    get_checked_impl!(get_checked_u8, u8, get_u8);
    get_checked_impl!(get_checked_u16, u16, get_u16);
    get_checked_impl!(get_checked_u32, u32, get_u32);
    get_checked_impl!(get_checked_u128, u128, get_u128);

    fn get_checked_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            return Err(anyhow!("buffer underflow"));
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }
}

impl <T: bytes::Buf> BufExt for T {
}
