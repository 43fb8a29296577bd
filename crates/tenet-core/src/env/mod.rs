//! Environment discovery: system variables, hard classes, time classes.
//!
//! Runs at context creation and again on every reload. Everything here
//! writes into the `sys` scope or the hard class set.

use chrono::{DateTime, Datelike, Local, Timelike};

use crate::classes::canonify;
use crate::eval::EvalContext;

/// Discover the host environment into the context: `sys` variables and the
/// corresponding hard classes.
pub fn detect_environment(ctx: &mut EvalContext, state_dir: &str, work_dir: &str, input_dir: &str) {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());

    let (uqhost, domain) = match hostname.split_once('.') {
        Some((host, domain)) => (host.to_string(), domain.to_string()),
        None => (hostname.clone(), "undefined.domain".to_string()),
    };
    let fqhost = if hostname.contains('.') {
        hostname.clone()
    } else {
        format!("{uqhost}.{domain}")
    };

    ctx.put_sys("fqhost", fqhost.as_str());
    ctx.put_sys("uqhost", uqhost.as_str());
    ctx.put_sys("host", hostname.as_str());
    ctx.put_sys("domain", domain.as_str());
    ctx.put_sys("os", std::env::consts::OS);
    ctx.put_sys("arch", std::env::consts::ARCH);
    ctx.put_sys("workdir", work_dir);
    ctx.put_sys("statedir", state_dir);
    ctx.put_sys("inputdir", input_dir);

    let now = Local::now();
    ctx.put_sys("date", now.format("%a %b %e %H:%M:%S %Y").to_string());
    ctx.put_sys("cdate", canonify(&now.format("%a_%b_%e_%H_%M_%S_%Y").to_string()));

    ctx.class_put_hard(std::env::consts::OS);
    ctx.class_put_hard(std::env::consts::ARCH);
    ctx.class_put_hard(&uqhost);
    ctx.class_put_hard(&fqhost);
}

/// Define the time classes for the given instant: hour, minute, five-minute
/// interval, quarter of the hour, day of month, weekday, month, year and
/// the lifecycle index.
pub fn update_time_classes(ctx: &mut EvalContext, now: DateTime<Local>) {
    for class in time_classes(now) {
        ctx.class_put_hard(&class);
    }
}

/// The canonical time-class names for an instant.
#[must_use]
pub fn time_classes(now: DateTime<Local>) -> Vec<String> {
    let hour = now.hour();
    let minute = now.minute();
    let interval_start = (minute / 5) * 5;
    let interval_end = (interval_start + 5) % 60;
    let quarter = minute / 15 + 1;

    let weekday = match now.weekday() {
        chrono::Weekday::Mon => "Monday",
        chrono::Weekday::Tue => "Tuesday",
        chrono::Weekday::Wed => "Wednesday",
        chrono::Weekday::Thu => "Thursday",
        chrono::Weekday::Fri => "Friday",
        chrono::Weekday::Sat => "Saturday",
        chrono::Weekday::Sun => "Sunday",
    };
    let month = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ][now.month0() as usize];

    vec![
        format!("Hr{hour:02}"),
        format!("Hr{hour}"),
        format!("Min{minute:02}"),
        format!("Min{interval_start:02}_{interval_end:02}"),
        format!("Q{quarter}"),
        format!("Day{}", now.day()),
        weekday.to_string(),
        month.to_string(),
        format!("Yr{}", now.year()),
        format!("Lcycle_{}", now.year() % 3),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Rval;
    use chrono::TimeZone;

    #[test]
    fn test_time_classes_known_instant() {
        // 2024-03-05 07:23:00 local was a Tuesday.
        let t = Local.with_ymd_and_hms(2024, 3, 5, 7, 23, 0).unwrap();
        let classes = time_classes(t);
        assert!(classes.contains(&"Hr07".to_string()));
        assert!(classes.contains(&"Hr7".to_string()));
        assert!(classes.contains(&"Min23".to_string()));
        assert!(classes.contains(&"Min20_25".to_string()));
        assert!(classes.contains(&"Q2".to_string()));
        assert!(classes.contains(&"Day5".to_string()));
        assert!(classes.contains(&"Tuesday".to_string()));
        assert!(classes.contains(&"March".to_string()));
        assert!(classes.contains(&"Yr2024".to_string()));
    }

    #[test]
    fn test_interval_wraps_at_hour_end() {
        let t = Local.with_ymd_and_hms(2024, 3, 5, 7, 57, 0).unwrap();
        let classes = time_classes(t);
        assert!(classes.contains(&"Min55_00".to_string()));
    }

    #[test]
    fn test_detect_environment_populates_sys() {
        let mut ctx = EvalContext::new();
        detect_environment(&mut ctx, "/var/lib/tenet/state", "/var/lib/tenet", "/etc/tenet");
        let (value, _) = ctx.resolve(None, None, "sys.statedir").unwrap();
        assert_eq!(value, Rval::from("/var/lib/tenet/state"));
        assert!(ctx.resolve(None, None, "sys.fqhost").is_some());
        assert!(ctx.class_defined(std::env::consts::OS));
    }
}
