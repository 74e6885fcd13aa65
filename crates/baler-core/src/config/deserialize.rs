use std::fmt;

use serde::Deserialize;

/// A scalar written either as a string ("25s", "2MiB") or a bare integer.
///
/// Integers are kept as their decimal text so sizes and durations go
/// through the same parser either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct HumanString(String);

impl HumanString {
    pub(super) fn into_inner(self) -> String {
        self.0
    }
}

impl<'de> Deserialize<'de> for HumanString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de;

        struct HumanStringVisitor;

        impl<'de> de::Visitor<'de> for HumanStringVisitor {
            type Value = HumanString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or a non-negative integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<HumanString, E> {
                Ok(HumanString(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<HumanString, E> {
                Ok(HumanString(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<HumanString, E> {
                Ok(HumanString(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<HumanString, E> {
                if v < 0 {
                    return Err(E::custom("value must not be negative"));
                }
                Ok(HumanString(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, _v: bool) -> Result<HumanString, E> {
                Err(E::custom("expected a size or duration, got a boolean"))
            }

            fn visit_unit<E: de::Error>(self) -> Result<HumanString, E> {
                Err(E::custom(
                    "value cannot be null or empty; provide a value or omit the field",
                ))
            }
        }

        deserializer.deserialize_any(HumanStringVisitor)
    }
}

pub(super) fn deserialize_human_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    HumanString::deserialize(deserializer).map(HumanString::into_inner)
}

pub(super) fn deserialize_optional_human_string<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<HumanString>::deserialize(deserializer).map(|v| v.map(HumanString::into_inner))
}
