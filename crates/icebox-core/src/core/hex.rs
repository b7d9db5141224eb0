macro_rules! impl_base {
    ($name:ident, $type:ty) => {
        impl ::std::fmt::Debug for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }

        impl ::std::fmt::Display for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }
    };
}

fn impl_base_fmt<T>(f: &mut ::std::fmt::Formatter, data: T) -> ::std::fmt::Result
where
    T: Copy + ::std::fmt::LowerHex,
{
    match size_of::<T>() {
        1 => write!(f, "0x{:02x}", data),
        2 => write!(f, "0x{:04x}", data),
        4 => write!(f, "0x{:08x}", data),
        8 => write!(f, "0x{:016x}", data),
        _ => write!(f, "0x{:x}", data),
    }
}

/// A hexadecimal representation of a value.
///
/// This type is used to display values in hexadecimal format.
///
/// # Examples
///
/// ```
/// # use icebox_core::Hex;
/// assert_eq!(format!("{}", Hex(42u16)), "0x002a");
/// ```
pub struct Hex<T>(pub T);

impl_base!(Hex, i8);
impl_base!(Hex, i16);
impl_base!(Hex, i32);
impl_base!(Hex, i64);

impl_base!(Hex, u8);
impl_base!(Hex, u16);
impl_base!(Hex, u32);
impl_base!(Hex, u64);

impl_base!(Hex, isize);
impl_base!(Hex, usize);
