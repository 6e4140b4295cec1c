use time::OffsetDateTime;

/// Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() * 1_000 + i64::from(now.millisecond())
}

pub fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `YYYY-MM-DD` for a timestamp, used to key daily rollups.
pub fn date_of_ms(ts_ms: i64) -> String {
    let ts = OffsetDateTime::from_unix_timestamp(ts_ms / 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    format!(
        "{:04}-{:02}-{:02}",
        ts.year(),
        u8::from(ts.month()),
        ts.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_formatting() {
        // 2024-03-05T00:00:10Z
        assert_eq!(date_of_ms(1_709_596_810_000), "2024-03-05");
        assert_eq!(date_of_ms(0), "1970-01-01");
    }
}
