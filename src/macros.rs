/// Generates a non-exhaustive enum of protocol names with their wire strings.
///
/// Produces: enum definition + `as_str()` + `Display` + `AsRef<str>` + `FromStr`
/// (case-insensitive). The parse error type is a tuple struct holding the
/// rejected input and must be defined next to the invocation.
///
/// ```ignore
/// wire_enum! {
///     error_type: ParseThingError,
///     /// Doc comment for the enum.
///     pub enum Thing {
///         Foo => "FOO",
///         Bar => "BAR",
///     }
/// }
/// ```
macro_rules! wire_enum {
    (
        error_type: $Err:ident,
        $(#[$enum_meta:meta])*
        $vis:vis enum $Name:ident {
            $(
                $(#[$var_meta:meta])*
                $variant:ident => $wire:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        $vis enum $Name {
            $(
                $(#[$var_meta])*
                $variant,
            )+
        }

        impl $Name {
            /// Name as it appears on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $Name::$variant => $wire, )+
                }
            }

            /// Case-insensitive lookup of a wire name.
            pub fn from_wire(s: &str) -> Option<Self> {
                $(
                    if s.eq_ignore_ascii_case($wire) {
                        return Some($Name::$variant);
                    }
                )+
                None
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl AsRef<str> for $Name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::str::FromStr for $Name {
            type Err = $Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_wire(s).ok_or_else(|| $Err(s.to_string()))
            }
        }
    };
}
