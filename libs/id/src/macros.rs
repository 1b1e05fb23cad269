//! Macros for defining typed name types.

/// Maximum length of a validated name, in characters.
pub const MAX_NAME_LEN: usize = 64;

/// Macro to define a typed, validated name.
///
/// This generates a newtype wrapper around `String` with:
/// - `parse()` enforcing the name grammar (1–64 chars, `[A-Za-z0-9._-]`)
/// - `as_str()` for borrowing the canonical form
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations that re-validate
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_name!(AgentName);
/// define_name!(ContainerName);
///
/// let agent: AgentName = "trader-7".parse()?;
/// ```
#[macro_export]
macro_rules! define_name {
    ($name:ident) => {
        /// A typed, validated name for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Parses a name from a string, enforcing the name grammar.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                if s.chars().count() > $crate::MAX_NAME_LEN {
                    return Err($crate::IdError::TooLong {
                        actual: s.chars().count(),
                        max: $crate::MAX_NAME_LEN,
                    });
                }
                if let Some(found) = s
                    .chars()
                    .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
                {
                    return Err($crate::IdError::InvalidChar {
                        name: s.to_string(),
                        found,
                    });
                }
                Ok(Self(s.to_string()))
            }

            /// Returns the canonical string form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
