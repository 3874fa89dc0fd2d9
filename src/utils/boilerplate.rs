#![macro_use]

/// Define opaque, copyable provider handle types.
macro_rules! define_handles {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            #[repr(transparent)]
            pub struct $name(pub u64);

            impl From<u64> for $name {
                #[inline]
                fn from(raw: u64) -> Self {
                    Self(raw)
                }
            }

            impl From<$name> for u64 {
                #[inline]
                fn from(handle: $name) -> Self {
                    handle.0
                }
            }
        )*
    };
}
