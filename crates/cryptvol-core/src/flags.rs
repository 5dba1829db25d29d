//! Flag sets passed through to the backend. Bit values follow libcryptsetup so
//! they can be forwarded unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$fmeta:meta])* $flag:ident = $value:expr => $label:literal;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            const NAMED: &'static [(Self, &'static str)] = &[$((Self::$flag, $label),)*];

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Keep every bit, including ones this crate has no name for.
            pub const fn from_bits_retain(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Labels of the named flags that are set.
            pub fn labels(self) -> Vec<&'static str> {
                Self::NAMED
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, label)| *label)
                    .collect()
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x}", stringify!($name), self.0)?;
                let labels = self.labels();
                if !labels.is_empty() {
                    write!(f, " {}", labels.join("|"))?;
                }
                f.write_str(")")
            }
        }
    };
}

flag_set! {
    /// Options applied when a mapping is created.
    ActivateFlags {
        READONLY = 1 << 0 => "readonly";
        NO_UUID = 1 << 1 => "no-uuid";
        SHARED = 1 << 2 => "shared";
        ALLOW_DISCARDS = 1 << 3 => "allow-discards";
        PRIVATE = 1 << 4 => "private";
        CORRUPTED = 1 << 5 => "corrupted";
        SAME_CPU_CRYPT = 1 << 6 => "same-cpu-crypt";
        SUBMIT_FROM_CRYPT_CPUS = 1 << 7 => "submit-from-crypt-cpus";
        IGNORE_CORRUPTION = 1 << 8 => "ignore-corruption";
        RESTART_ON_CORRUPTION = 1 << 9 => "restart-on-corruption";
        IGNORE_ZERO_BLOCKS = 1 << 10 => "ignore-zero-blocks";
        /// Volume key is passed to the kernel through the keyring.
        KEYRING_KEY = 1 << 11 => "keyring-key";
        NO_JOURNAL = 1 << 12 => "no-journal";
        RECOVERY = 1 << 13 => "recovery";
        IGNORE_PERSISTENT = 1 << 14 => "ignore-persistent";
    }
}

flag_set! {
    /// Options applied when a mapping is removed.
    DeactivateFlags {
        /// Remove once the last user closes the device.
        DEFERRED = 1 << 0 => "deferred";
        /// Replace the table with an error target even while in use.
        FORCE = 1 << 1 => "force";
    }
}

flag_set! {
    WipeFlags {
        NO_DIRECT_IO = 1 << 0 => "no-direct-io";
    }
}

flag_set! {
    PbkdfFlags {
        /// Iteration time was set by the caller.
        ITER_TIME_SET = 1 << 0 => "iter-time-set";
        /// Use the supplied cost parameters as they are.
        NO_BENCHMARK = 1 << 1 => "no-benchmark";
    }
}
