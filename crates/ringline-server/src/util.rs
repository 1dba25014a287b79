//! Small shared helpers.

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Day of month in server-local time; drives the today-counter rollover.
pub fn current_day_of_month() -> u32 {
    use chrono::Datelike;
    chrono::Local::now().day()
}
