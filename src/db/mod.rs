use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error;

pub mod lock;
pub mod message;

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// A lease length in milliseconds. A zero lease would expire the moment it is taken.
pub(crate) fn lease_millis(name: &str, lease: Duration) -> Result<i64, Error> {
    match i64::try_from(lease.as_millis()) {
        Ok(0) => Err(Error::invalid_parameter(format!("{name} must be at least 1ms"))),
        Ok(ms) => Ok(ms),
        Err(_) => Err(Error::invalid_parameter(format!(
            "{name} of {lease:?} is out of range"
        ))),
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::internal(eyre::eyre!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_bounds() {
        assert_eq!(lease_millis("lease", Duration::from_millis(1500)).unwrap(), 1500);
        assert!(matches!(
            lease_millis("lease", Duration::ZERO),
            Err(Error::InvalidParameter { .. })
        ));
        // sub-millisecond leases round down to zero
        assert!(lease_millis("lease", Duration::from_micros(999)).is_err());
        assert!(matches!(
            lease_millis("lease", Duration::MAX),
            Err(Error::InvalidParameter { .. })
        ));
    }
}
