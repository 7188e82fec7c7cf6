/// Generates an enum over a full integer code space where part of the space
/// is assigned to named values, part is reserved to ASHRAE, and a declared
/// range is open for vendor (proprietary) use.
///
/// BACnet is full of such spaces: MS/TP frame types reserve 8–127 and hand
/// 128–255 to vendors, reject and abort reasons reserve everything below 64
/// and open 64–255, and so on. The macro keeps the conversion in one place
/// instead of repeating the three-way match at every decode site.
///
/// # Arguments
///
/// * `$name` - enum name.
/// * `$variant = $value` - the named code points.
/// * `$unit` - underlying integer type (`u8`, `u16`, ...).
/// * `$range` - the vendor-proprietary range (e.g. `128..=255`). Unnamed
///   values inside it become `Proprietary`, unnamed values outside it
///   become `Reserved`.
///
/// # Generated items
///
/// The enum itself (named variants plus `Proprietary` and `Reserved`, each
/// wrapping a `<Name>Value` carrier), lossless `From` conversions in both
/// directions, and a `Display` impl that prints the variant name or
/// `Proprietary(n)` / `Reserved(n)`.
#[macro_export]
macro_rules! generate_ranged_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ }, $unit:ident, $proprietary_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                Proprietary( [<$name Value>] ),
                Reserved( [<$name Value>] ),
            }

            /// Carrier for a code point without a named variant.
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                fn new(value: $unit) -> Self {
                    Self { value }
                }

                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl core::fmt::Display for $name {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Proprietary( value ) => write!(f, "Proprietary({})", value.value()),
                        $name::Reserved( value ) => write!(f, "Reserved({})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary( value ) => value.value(),
                        $name::Reserved( value ) => value.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($proprietary_range).contains(&v) => {
                            $name::Proprietary( [<$name Value>]::new(v) )
                        }
                        v => $name::Reserved( [<$name Value>]::new(v) ),
                    }
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    generate_ranged_enum! {
        /// Test space: named 0-2, vendor range 100-200.
        Sample {
            Zero = 0,
            One = 1,
            Two = 2,
        },
        u8,
        100..=200
    }

    #[test]
    fn named_round_trip() {
        assert_eq!(Sample::from(1u8), Sample::One);
        assert_eq!(u8::from(Sample::Two), 2);
    }

    #[test]
    fn proprietary_and_reserved_split() {
        match Sample::from(150u8) {
            Sample::Proprietary(v) => assert_eq!(v.value(), 150),
            other => panic!("expected proprietary, got {}", other),
        }
        match Sample::from(50u8) {
            Sample::Reserved(v) => assert_eq!(v.value(), 50),
            other => panic!("expected reserved, got {}", other),
        }
        assert_eq!(u8::from(Sample::from(201u8)), 201);
    }
}
