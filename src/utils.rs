//! Utility functions

/// transform bytes into a human readable format.
pub fn to_human_readable(mut n: f64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        if n.fract() == 0.0 {
            return format!("{:.0} {}", n, units[0]);
        }
        let formatted = format!("{n:.2}");
        let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
        return format!("{} {}", trimmed, units[0]);
    }

    let mut u = 0;
    while n >= delimiter && u < units.len() - 1 {
        n /= delimiter;
        u += 1;
    }

    let formatted = format!("{n:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, units[u])
}
