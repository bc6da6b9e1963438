//! Serde helpers shared by the option and wire-model types.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub(crate) mod duration_option_as_int_seconds {
    use super::*;

    pub fn serialize<S: Serializer>(
        val: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match val {
            Some(duration) if duration.as_secs() <= i32::MAX as u64 => {
                serializer.serialize_i32(duration.as_secs() as i32)
            }
            Some(duration) => serializer.serialize_i64(duration.as_secs() as i64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let seconds: Option<i64> = Option::deserialize(deserializer)?;
        Ok(seconds.map(|s| Duration::from_secs(s.max(0) as u64)))
    }
}

pub(crate) fn serialize_u32_option_as_i32<S: Serializer>(
    val: &Option<u32>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match val {
        Some(v) => (*v as i32).serialize(serializer),
        None => serializer.serialize_none(),
    }
}
