//! Decoding of `java.time.Ser` payloads.
//!
//! All `java.time` types funnel through one serialization proxy whose
//! externalized bytes start with a type byte followed by a shape-specific
//! field layout. The layouts use a few space optimizations: `LocalTime`
//! truncates trailing zero components by writing the last present component
//! bit-inverted, and zone offsets fit in one byte (quarter hours) unless
//! escaped with 127.

use crate::error::{ParseError, ParseResult};
use crate::mutf8;
use byteorder::{BigEndian, ReadBytesExt};
use serde_derive::Serialize;

pub const DURATION_TYPE: i8 = 1;
pub const INSTANT_TYPE: i8 = 2;
pub const LOCAL_DATE_TYPE: i8 = 3;
pub const LOCAL_TIME_TYPE: i8 = 4;
pub const LOCAL_DATE_TIME_TYPE: i8 = 5;
pub const ZONED_DATE_TIME_TYPE: i8 = 6;
pub const ZONE_REGION_TYPE: i8 = 7;
pub const ZONE_OFFSET_TYPE: i8 = 8;
pub const OFFSET_TIME_TYPE: i8 = 9;
pub const OFFSET_DATE_TIME_TYPE: i8 = 10;
pub const YEAR_TYPE: i8 = 11;
pub const YEAR_MONTH_TYPE: i8 = 12;
pub const MONTH_DAY_TYPE: i8 = 13;
pub const PERIOD_TYPE: i8 = 14;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum TimeKind {
    Duration,
    Instant,
    LocalDate,
    LocalTime,
    LocalDateTime,
    ZonedDateTime,
    ZoneRegion,
    ZoneOffset,
    OffsetTime,
    OffsetDateTime,
    Year,
    YearMonth,
    MonthDay,
    Period,
}

impl TimeKind {
    pub fn from_byte(byte: i8) -> Option<TimeKind> {
        match byte {
            DURATION_TYPE => Some(TimeKind::Duration),
            INSTANT_TYPE => Some(TimeKind::Instant),
            LOCAL_DATE_TYPE => Some(TimeKind::LocalDate),
            LOCAL_TIME_TYPE => Some(TimeKind::LocalTime),
            LOCAL_DATE_TIME_TYPE => Some(TimeKind::LocalDateTime),
            ZONED_DATE_TIME_TYPE => Some(TimeKind::ZonedDateTime),
            ZONE_REGION_TYPE => Some(TimeKind::ZoneRegion),
            ZONE_OFFSET_TYPE => Some(TimeKind::ZoneOffset),
            OFFSET_TIME_TYPE => Some(TimeKind::OffsetTime),
            OFFSET_DATE_TIME_TYPE => Some(TimeKind::OffsetDateTime),
            YEAR_TYPE => Some(TimeKind::Year),
            YEAR_MONTH_TYPE => Some(TimeKind::YearMonth),
            MONTH_DAY_TYPE => Some(TimeKind::MonthDay),
            PERIOD_TYPE => Some(TimeKind::Period),
            _ => None,
        }
    }
}

/// Decoded `java.time.Ser` payload. Which fields are populated depends on
/// `kind`; `second` holds epoch seconds for durations and instants and the
/// second-of-minute for time-of-day shapes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JavaTime {
    pub kind: TimeKind,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub day: Option<i32>,
    pub hour: Option<i32>,
    pub minute: Option<i32>,
    pub second: Option<i64>,
    pub nano: Option<i32>,
    /// Offset from UTC in seconds.
    pub offset: Option<i32>,
    pub zone: Option<String>,
}

impl JavaTime {
    fn empty(kind: TimeKind) -> JavaTime {
        JavaTime {
            kind,
            year: None,
            month: None,
            day: None,
            hour: None,
            minute: None,
            second: None,
            nano: None,
            offset: None,
            zone: None,
        }
    }

    /// Decodes the block-data bytes written by `java.time.Ser`.
    pub fn from_bytes(data: &[u8]) -> ParseResult<JavaTime> {
        let mut cursor = data;
        let type_byte = cursor.read_i8()?;
        let kind = TimeKind::from_byte(type_byte).ok_or_else(|| {
            ParseError::DecodingError(format!("unknown java.time form: {}", type_byte))
        })?;

        let mut time = JavaTime::empty(kind);
        match kind {
            TimeKind::Duration | TimeKind::Instant => {
                time.second = Some(cursor.read_i64::<BigEndian>()?);
                time.nano = Some(cursor.read_i32::<BigEndian>()?);
            }
            TimeKind::LocalDate => time.read_date(&mut cursor)?,
            TimeKind::LocalTime => time.read_time(&mut cursor)?,
            TimeKind::LocalDateTime => {
                time.read_date(&mut cursor)?;
                time.read_time(&mut cursor)?;
            }
            TimeKind::ZonedDateTime => {
                time.read_date(&mut cursor)?;
                time.read_time(&mut cursor)?;
                time.read_offset(&mut cursor)?;
                time.read_region(&mut cursor)?;
            }
            TimeKind::ZoneRegion => time.read_region(&mut cursor)?,
            TimeKind::ZoneOffset => time.read_offset(&mut cursor)?,
            TimeKind::OffsetTime => {
                time.read_time(&mut cursor)?;
                time.read_offset(&mut cursor)?;
            }
            TimeKind::OffsetDateTime => {
                time.read_date(&mut cursor)?;
                time.read_time(&mut cursor)?;
                time.read_offset(&mut cursor)?;
            }
            TimeKind::Year => time.year = Some(cursor.read_i32::<BigEndian>()?),
            TimeKind::YearMonth => {
                time.year = Some(cursor.read_i32::<BigEndian>()?);
                time.month = Some(i32::from(cursor.read_i8()?));
            }
            TimeKind::MonthDay => {
                time.month = Some(i32::from(cursor.read_i8()?));
                time.day = Some(i32::from(cursor.read_i8()?));
            }
            TimeKind::Period => {
                time.year = Some(cursor.read_i32::<BigEndian>()?);
                time.month = Some(cursor.read_i32::<BigEndian>()?);
                time.day = Some(cursor.read_i32::<BigEndian>()?);
            }
        }
        Ok(time)
    }

    fn read_date(&mut self, cursor: &mut &[u8]) -> ParseResult<()> {
        self.year = Some(cursor.read_i32::<BigEndian>()?);
        self.month = Some(i32::from(cursor.read_i8()?));
        self.day = Some(i32::from(cursor.read_i8()?));
        Ok(())
    }

    // A negative component is the bit-inverted final component; everything
    // after it was zero and not written.
    fn read_time(&mut self, cursor: &mut &[u8]) -> ParseResult<()> {
        let mut hour = cursor.read_i8()?;
        let mut minute = 0i8;
        let mut second = 0i8;
        let mut nano = 0i32;

        if hour < 0 {
            hour = !hour;
        } else {
            minute = cursor.read_i8()?;
            if minute < 0 {
                minute = !minute;
            } else {
                second = cursor.read_i8()?;
                if second < 0 {
                    second = !second;
                } else {
                    nano = cursor.read_i32::<BigEndian>()?;
                }
            }
        }

        self.hour = Some(i32::from(hour));
        self.minute = Some(i32::from(minute));
        self.second = Some(i64::from(second));
        self.nano = Some(nano);
        Ok(())
    }

    fn read_offset(&mut self, cursor: &mut &[u8]) -> ParseResult<()> {
        let offset_byte = cursor.read_i8()?;
        self.offset = Some(if offset_byte == 127 {
            cursor.read_i32::<BigEndian>()?
        } else {
            i32::from(offset_byte) * 900
        });
        Ok(())
    }

    fn read_region(&mut self, cursor: &mut &[u8]) -> ParseResult<()> {
        let length = usize::from(cursor.read_u16::<BigEndian>()?);
        if cursor.len() < length {
            return Err(ParseError::UnexpectedEndOfStream);
        }
        let (head, tail) = cursor.split_at(length);
        self.zone = Some(mutf8::decode(head)?);
        *cursor = tail;
        Ok(())
    }
}
