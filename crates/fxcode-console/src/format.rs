//! Cell formatters for the resource monitor.

const KIB: f64 = 1024.0;
const MIB: f64 = KIB * 1024.0;
const GIB: f64 = MIB * 1024.0;

/// Shown for values too small to be worth printing.
pub const NEGLIGIBLE: &str = "—";

pub fn format_ms(ms: f64) -> String {
    if ms <= 0.005 {
        return NEGLIGIBLE.to_string();
    }
    format!("{ms:.2} ms")
}

/// Fraction of a frame as a percentage.
pub fn format_time_percentage(fraction: f64) -> String {
    if fraction < 0.005 {
        return NEGLIGIBLE.to_string();
    }
    format!("{:.2}%", fraction * 100.0)
}

/// Binary-prefixed size with `postfix` appended (e.g. `"/s"`); `?` for
/// unknown (non-positive) sizes.
pub fn format_memory(postfix: &str, bytes: f64) -> String {
    if bytes <= 0.0 {
        return "?".to_string();
    }
    let (value, unit) = if bytes >= GIB {
        (bytes / GIB, "GiB")
    } else if bytes >= MIB {
        (bytes / MIB, "MiB")
    } else if bytes >= KIB {
        (bytes / KIB, "KiB")
    } else {
        (bytes, "B")
    };
    format!("{value:.2} {unit}{postfix}")
}

/// Background tint for a frame-fraction cell.
pub fn intensity_color(fraction: f64) -> String {
    let alpha = if fraction < 0.005 { 0.0 } else { fraction };
    format!("rgba(244, 5, 82, {alpha})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milliseconds() {
        assert_eq!(format_ms(0.004), "—");
        assert_eq!(format_ms(0.005), "—");
        assert_eq!(format_ms(1.234), "1.23 ms");
    }

    #[test]
    fn percentages() {
        assert_eq!(format_time_percentage(0.001), "—");
        assert_eq!(format_time_percentage(0.125), "12.50%");
    }

    #[test]
    fn memory_units() {
        assert_eq!(format_memory("", 0.0), "?");
        assert_eq!(format_memory("", 512.0), "512.00 B");
        assert_eq!(format_memory("", 2048.0), "2.00 KiB");
        assert_eq!(format_memory("/s", 3.0 * MIB), "3.00 MiB/s");
        assert_eq!(format_memory("", 1.5 * GIB), "1.50 GiB");
    }

    #[test]
    fn intensity() {
        assert_eq!(intensity_color(0.001), "rgba(244, 5, 82, 0)");
        assert_eq!(intensity_color(0.5), "rgba(244, 5, 82, 0.5)");
    }
}
