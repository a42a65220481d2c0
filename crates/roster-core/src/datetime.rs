use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Datelike,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  TimeZone,
  Utc
};
use chrono_tz::Tz;
use serde::Deserialize;

const TIMEZONE_CONFIG_FILE: &str =
  "roster-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "ROSTER_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "ROSTER_TIME_CONFIG";

const INPUT_DATE_FORMATS: [&str; 3] = [
  "%Y-%m-%d",
  "%m/%d/%Y",
  "%Y/%m/%d"
];

const INPUT_DATETIME_FORMATS: [&str;
  2] = [
  "%Y-%m-%dT%H:%M:%S",
  "%Y-%m-%dT%H:%M"
];

const CLOCK_FORMATS: [&str; 4] = [
  "%H:%M",
  "%H:%M:%S",
  "%I:%M %p",
  "%I:%M%p"
];

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Timezone calendar instants are
/// shown and booked in.
pub fn project_timezone() -> &'static Tz
{
  static PROJECT_TZ: OnceLock<Tz> =
    OnceLock::new();
  PROJECT_TZ.get_or_init(
    resolve_project_timezone
  )
}

#[must_use]
pub fn local_date_in(
  dt: DateTime<Utc>,
  tz: &Tz
) -> NaiveDate {
  dt.with_timezone(tz).date_naive()
}

#[must_use]
pub fn local_naive_in(
  dt: DateTime<Utc>,
  tz: &Tz
) -> NaiveDateTime {
  dt.with_timezone(tz).naive_local()
}

fn resolve_project_timezone() -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) = parse_timezone(
      &raw,
      TIMEZONE_ENV_VAR
    )
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  tracing::info!(
    "no timezone configured; using \
     UTC"
  );
  chrono_tz::UTC
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let timezone =
    match timezone_from_toml(&raw) {
      | Ok(timezone) => timezone,
      | Err(err) => {
        tracing::error!(
          file = %path.display(),
          error = %err,
          "failed parsing timezone config file"
        );
        return None;
      }
    };
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn timezone_from_toml(
  raw: &str
) -> anyhow::Result<Option<String>> {
  let parsed =
    toml::from_str::<TimezoneConfig>(
      raw
    )?;
  Ok(parsed.timezone.or_else(|| {
    parsed
      .time
      .and_then(|section| {
        section.timezone
      })
  }))
}

pub fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured project timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// Converts a wall-clock time in `tz`
/// to an instant. Ambiguous times
/// (DST fall-back) resolve to the
/// earlier instant.
pub fn local_to_utc_in(
  local_naive: NaiveDateTime,
  tz: &Tz,
  context: &str
) -> anyhow::Result<DateTime<Utc>> {
  match tz
    .from_local_datetime(&local_naive)
  {
    | LocalResult::Single(local_dt) => {
      Ok(local_dt.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::warn!(
        context,
        first = %first,
        second = %second,
        "ambiguous local datetime; using earliest"
      );
      let chosen = if first <= second {
        first
      } else {
        second
      };
      Ok(chosen.with_timezone(&Utc))
    }
    | LocalResult::None => {
      Err(anyhow!(
        "local datetime does not \
         exist in configured \
         timezone: {context}"
      ))
    }
  }
}

/// Date typed into a form or sent by
/// the API, in any supported format.
pub fn parse_input_date(
  input: &str
) -> Option<NaiveDate> {
  let token = input.trim();
  if token.is_empty() {
    return None;
  }

  for format in INPUT_DATE_FORMATS {
    if let Ok(date) =
      NaiveDate::parse_from_str(
        token, format
      )
    {
      return Some(date);
    }
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Some(dt.date_naive());
  }

  for format in INPUT_DATETIME_FORMATS
  {
    if let Ok(dt) =
      NaiveDateTime::parse_from_str(
        token, format
      )
    {
      return Some(dt.date());
    }
  }

  None
}

pub fn parse_clock_time(
  input: &str
) -> Option<NaiveTime> {
  let token = input.trim();
  if token.is_empty() {
    return None;
  }

  CLOCK_FORMATS.iter().find_map(
    |format| {
      NaiveTime::parse_from_str(
        token, format
      )
      .ok()
    }
  )
}

/// First day of the month and first
/// day of the following month.
pub fn month_bounds(
  year: i32,
  month: u32
) -> Option<(NaiveDate, NaiveDate)> {
  let first =
    NaiveDate::from_ymd_opt(
      year, month, 1
    )?;
  let next = if month == 12 {
    NaiveDate::from_ymd_opt(
      year + 1,
      1,
      1
    )?
  } else {
    NaiveDate::from_ymd_opt(
      year,
      month + 1,
      1
    )?
  };
  Some((first, next))
}

#[must_use]
pub fn month_of(
  date: NaiveDate
) -> (i32, u32) {
  (date.year(), date.month())
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    NaiveTime,
    TimeZone,
    Utc
  };

  use super::{
    local_date_in,
    local_to_utc_in,
    month_bounds,
    parse_clock_time,
    parse_input_date,
    timezone_from_toml
  };

  #[test]
  fn parses_supported_input_dates() {
    let expected =
      NaiveDate::from_ymd_opt(
        2024, 6, 10
      );
    for raw in [
      "2024-06-10",
      "06/10/2024",
      "2024/06/10",
      "2024-06-10T08:15:00+02:00",
      "2024-06-10T08:15"
    ] {
      assert_eq!(
        parse_input_date(raw),
        expected,
        "input {raw}"
      );
    }
    assert_eq!(
      parse_input_date("soon"),
      None
    );
  }

  #[test]
  fn parses_clock_times() {
    assert_eq!(
      parse_clock_time("14:15"),
      NaiveTime::from_hms_opt(
        14, 15, 0
      )
    );
    assert_eq!(
      parse_clock_time("09:05:30"),
      NaiveTime::from_hms_opt(9, 5, 30)
    );
    assert_eq!(
      parse_clock_time("later"),
      None
    );
  }

  #[test]
  fn december_rolls_into_next_year() {
    let (first, next) =
      month_bounds(2024, 12)
        .expect("valid month");
    assert_eq!(
      first,
      NaiveDate::from_ymd_opt(
        2024, 12, 1
      )
      .expect("date")
    );
    assert_eq!(
      next,
      NaiveDate::from_ymd_opt(2025, 1, 1)
        .expect("date")
    );
    assert!(
      month_bounds(2024, 13).is_none()
    );
  }

  #[test]
  fn local_dates_follow_the_timezone() {
    let tz: chrono_tz::Tz =
      "America/New_York"
        .parse()
        .expect("tz");
    let late_utc = Utc
      .with_ymd_and_hms(
        2024, 6, 11, 2, 30, 0
      )
      .single()
      .expect("valid instant");
    assert_eq!(
      local_date_in(late_utc, &tz),
      NaiveDate::from_ymd_opt(
        2024, 6, 10
      )
      .expect("date")
    );

    let local = NaiveDate::from_ymd_opt(
      2024, 6, 10
    )
    .and_then(|d| {
      d.and_hms_opt(22, 30, 0)
    })
    .expect("local");
    assert_eq!(
      local_to_utc_in(
        local, &tz, "test"
      )
      .expect("convert"),
      late_utc
    );
  }

  #[test]
  fn reads_timezone_from_either_toml_shape()
   {
    assert_eq!(
      timezone_from_toml(
        "timezone = \"Europe/Paris\""
      )
      .expect("parse"),
      Some("Europe/Paris".to_string())
    );
    assert_eq!(
      timezone_from_toml(
        "[time]\ntimezone = \"UTC\""
      )
      .expect("parse"),
      Some("UTC".to_string())
    );
  }
}
