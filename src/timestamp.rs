//! Jiff support for SQLx's SQLite driver.
//!
//! Instants are stored as the number of microseconds since the Unix epoch in
//! an `integer` column. Keeping the resolution integral makes the stored
//! values directly comparable in SQL, which the scheduled-fetch query relies
//! on.

use std::{
    fmt::{self, Display},
    ops::Deref,
    str::FromStr,
};

use jiff::SignedDuration;
use serde::{Deserialize, Serialize};
use sqlx::{
    encode::IsNull,
    error::BoxDynError,
    sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef},
    Decode, Encode, Sqlite, Type,
};

/// An instant in time, stored in the database as integer microseconds since
/// the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub jiff::Timestamp);

impl Timestamp {
    /// Returns the current instant.
    pub fn now() -> Self {
        Self(jiff::Timestamp::now())
    }

    /// Returns this instant as microseconds since the Unix epoch.
    pub fn as_microsecond(&self) -> i64 {
        self.0.as_microsecond()
    }

    /// Creates a timestamp from microseconds since the Unix epoch.
    pub fn from_microsecond(microsecond: i64) -> Result<Self, jiff::Error> {
        Ok(Self(jiff::Timestamp::from_microsecond(microsecond)?))
    }

    /// Returns this instant moved forwards by the given duration, saturating
    /// at the representable boundaries.
    pub fn saturating_add(&self, duration: SignedDuration) -> Self {
        Self(
            self.0
                .saturating_add(duration)
                .expect("SignedDuration arithmetic does not error"),
        )
    }

    /// Returns this instant moved backwards by the given duration, saturating
    /// at the representable boundaries.
    pub fn saturating_sub(&self, duration: SignedDuration) -> Self {
        Self(
            self.0
                .saturating_sub(duration)
                .expect("SignedDuration arithmetic does not error"),
        )
    }

    /// Returns the signed duration from `other` to `self`.
    pub fn duration_since(&self, other: Timestamp) -> SignedDuration {
        self.0.duration_since(other.0)
    }
}

impl Deref for Timestamp {
    type Target = jiff::Timestamp;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = jiff::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(jiff::Timestamp::from_str(s)?))
    }
}

impl From<jiff::Timestamp> for Timestamp {
    fn from(timestamp: jiff::Timestamp) -> Self {
        Self(timestamp)
    }
}

impl Type<Sqlite> for Timestamp {
    fn type_info() -> SqliteTypeInfo {
        <i64 as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <i64 as Type<Sqlite>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Sqlite> for Timestamp {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Int64(self.0.as_microsecond()));
        Ok(IsNull::No)
    }
}

impl<'r> Decode<'r, Sqlite> for Timestamp {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let microsecond = <i64 as Decode<Sqlite>>::decode(value)?;
        Ok(Self(jiff::Timestamp::from_microsecond(microsecond)?))
    }
}
