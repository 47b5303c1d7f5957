use std::time::Duration;

pub(crate) fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

// Convert a &str into a usize, if possible, and return the result if it's a
// power of 2
pub(crate) fn value_is_power_of_two(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid usize"))?;
    // Now we have a value, test whether it's a power of 2
    if value.is_power_of_two() {
        Ok(value)
    } else {
        Err(format!("{} is not a power of 2", value))
    }
}

pub(crate) fn value_is_positive(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid usize"))?;
    if value == 0 {
        return Err("must be at least 1".to_string());
    }
    Ok(value)
}
