const THOUSAND: f64 = 1_000.0;
const MILLION: f64 = 1_000_000.0;
const BILLION: f64 = 1_000_000_000.0;

/// Short dollar amount: `$950`, `$1.5K`, `$2.3M`, `$4.1B`.
pub fn format_currency(value: f64) -> String {
    if value >= BILLION {
        format!("${}B", fixed_one_decimal(value / BILLION))
    } else if value >= MILLION {
        format!("${}M", fixed_one_decimal(value / MILLION))
    } else if value >= THOUSAND {
        format!("${}K", fixed_one_decimal(value / THOUSAND))
    } else {
        format!("${:.0}", value.round())
    }
}

/// Integer with `.` as thousands separator. Four-digit values stay
/// ungrouped, as Spanish locale formatting does.
pub fn format_number(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let grouped = if digits.len() <= 4 {
        digits
    } else {
        let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
        for (index, digit) in digits.chars().enumerate() {
            if index > 0 && (digits.len() - index) % 3 == 0 {
                grouped.push('.');
            }
            grouped.push(digit);
        }
        grouped
    };

    if value < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// One decimal place. Exact midpoints (only possible for quarter values)
/// round away from zero; everything else rounds to nearest.
fn fixed_one_decimal(value: f64) -> String {
    let quarters = value * 4.0;
    if quarters.fract() == 0.0 && quarters % 2.0 != 0.0 {
        return format!("{:.1}", (value * 10.0).round() / 10.0);
    }
    format!("{value:.1}")
}

#[cfg(test)]
#[path = "tests/format_tests.rs"]
mod tests;
