//! Serialize address-like values as plain integers, for use with
//! `#[serde(with = "serde_usize")]` or from hand-written impls.

use std::{fmt, marker::PhantomData};

use serde::{
    de::{self, Visitor},
    Deserializer, Serializer,
};

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

/// Fallible, because some address types reserve values
pub trait FromUsize: Copy {
    fn from_usize(value: usize) -> Option<Self>;
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsUsize,
{
    serializer.serialize_u64((*value).as_usize() as u64)
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromUsize,
{
    struct V<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for V<T>
    where
        T: FromUsize,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a non-reserved address")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let v = usize::try_from(v).map_err(|_| E::custom("address out of range"))?;
            T::from_usize(v).ok_or_else(|| E::invalid_value(de::Unexpected::Unsigned(v as u64), &self))
        }
    }

    deserializer.deserialize_u64(V::<T>(PhantomData))
}
