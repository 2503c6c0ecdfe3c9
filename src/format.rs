// Rendering of the quantities shown in the monitor panel

const UNITS: [&str; 5] = ["B", "kiB", "MiB", "GiB", "TiB"];

pub const UNAVAILABLE: &str = "unavailable";

/// Formats a byte count, optionally against a capacity.
///
/// The unit is picked from the limiting quantity (`total` when given) and
/// shared by both numbers: `"1.5 kiB"`, `"0.5 / 8.0 GiB"`, `"512 B"`.
pub fn format_memory(used: Option<u64>, total: Option<u64>) -> String {
    let Some(used) = used else {
        return UNAVAILABLE.to_string();
    };

    let mut limit = total.unwrap_or(used) as f64;
    let mut scale = 1.0;
    let mut unit = 0;
    while limit > 1024.0 && unit + 1 < UNITS.len() {
        limit /= 1024.0;
        scale *= 1024.0;
        unit += 1;
    }

    let render = |value: u64| {
        if unit == 0 {
            value.to_string()
        } else {
            format!("{:.1}", value as f64 / scale)
        }
    };

    match total {
        Some(total) => format!("{} / {} {}", render(used), render(total), UNITS[unit]),
        None => format!("{} {}", render(used), UNITS[unit]),
    }
}

pub fn format_power(draw: f64, limit: f64) -> String {
    format!("{:.2} / {:.0} W", draw, limit)
}

pub fn format_temperature(celsius: u32) -> String {
    format!("{} °C", celsius)
}

pub fn format_utilization(percent: u32) -> String {
    format!("{} %", percent)
}
