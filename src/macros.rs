macro_rules! string_wrapper {
    ($(#[$attr:meta])* $n:ident) => {
        $(#[$attr])*
        #[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $n(String);

        impl $n {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[allow(dead_code)]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl ::std::fmt::Display for $n {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl ::std::fmt::Debug for $n {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "{}({:?})", stringify!($n), self.0)
            }
        }

        impl ::std::convert::AsRef<str> for $n {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl ::std::borrow::Borrow<str> for $n {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $n {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $n {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}
