use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};

#[derive(Debug, Clone, Default, clap::Args)]
pub struct TimestampFormatter {
    /// Whether rfc3339 format is to be used (default: whatever chrono
    /// uses for `Display`).
    #[clap(long)]
    pub use_rfc3339: bool,

    /// If true, write log time stamps in the local time zone.
    /// Default: in UTC.
    #[clap(long)]
    pub local_time: bool,
}

impl TimestampFormatter {
    pub fn format_systemtime(&self, t: SystemTime) -> String {
        let Self {
            use_rfc3339,
            local_time,
        } = self;
        if *local_time {
            let t: DateTime<Local> = t.into();
            if *use_rfc3339 {
                t.to_rfc3339()
            } else {
                t.to_string()
            }
        } else {
            let t: DateTime<Utc> = t.into();
            if *use_rfc3339 {
                t.to_rfc3339()
            } else {
                t.to_string()
            }
        }
    }
}

impl FormatTime for TimestampFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.format_systemtime(SystemTime::now()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn t_utc_rfc3339() {
        let f = TimestampFormatter {
            use_rfc3339: true,
            local_time: false,
        };
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(86400);
        assert_eq!(f.format_systemtime(t), "1970-01-02T00:00:00+00:00");
    }
}
