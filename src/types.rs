//! Small value types shared by the records
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, TimeZone, Utc};

/// Integral minor currency units.
pub type Amount = u64;

/// Catalog service identifier.
pub type ServiceId = u64;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// ordered by instant; a derive would require `T: Ord`, which `Utc` is not
impl<T: TimeZone + Eq> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone + Eq> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> CoreResult<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
            .ok_or_else(|| CoreError::invalid("date does not exist"))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Where the customer is stranded.
#[derive(Debug, Clone, Copy, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Location {
    #[n(0)]
    pub lat: f64,
    #[n(1)]
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> CoreResult<Self> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoreError::invalid(format!("latitude {lat} out of range")));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoreError::invalid(format!("longitude {lon} out of range")));
        }
        Ok(Self { lat, lon })
    }
}

/// Validates a caller supplied price.
pub fn price_from(raw: i64) -> CoreResult<Amount> {
    Amount::try_from(raw).map_err(|_| CoreError::invalid(format!("price {raw} is negative")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn new_with_rejects_impossible_dates() {
        assert!(TimeStamp::new_with(2024, 2, 30, 0, 0, 0).is_err());
        let ts = TimeStamp::new_with(2024, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(ts.to_datetime_utc().day(), 29);
    }

    #[test]
    fn timestamps_order_by_instant() {
        let earlier = TimeStamp::new_with(2024, 5, 1, 8, 0, 0).unwrap();
        let later = TimeStamp::new_with(2024, 5, 1, 8, 0, 1).unwrap();

        assert!(earlier < later);
        assert_eq!(later.cmp(&earlier), std::cmp::Ordering::Greater);
        assert_eq!(earlier.clone().max(later.clone()), later);
    }

    #[test]
    fn location_bounds() {
        assert!(Location::new(45.0, 7.5).is_ok());
        assert!(Location::new(91.0, 0.0).is_err());
        assert!(Location::new(0.0, -180.5).is_err());
        assert!(Location::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn negative_prices_are_invalid() {
        assert_eq!(price_from(1200), Ok(1200));
        assert_eq!(price_from(0), Ok(0));
        assert!(matches!(price_from(-1), Err(CoreError::Invalid(_))));
    }
}
