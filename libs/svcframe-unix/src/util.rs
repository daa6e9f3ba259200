/// Render a duration given in seconds as e.g. `2d 03:04:05`.
pub fn format_duration_secs(secs: u64) -> String {
    let days = secs / 86400;
    let rest = secs % 86400;
    let (h, m, s) = (rest / 3600, (rest % 3600) / 60, rest % 60);
    if days > 0 {
        format!("{days}d {h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

#[test]
fn t_format_duration_secs() {
    assert_eq!(format_duration_secs(0), "00:00:00");
    assert_eq!(format_duration_secs(3661), "01:01:01");
    assert_eq!(format_duration_secs(2 * 86400 + 5), "2d 00:00:05");
}
