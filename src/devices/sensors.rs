//! Sysfs sensor attributes

use std::fs;
use std::path::PathBuf;

use crate::error::{ControlError, Result};

/// One integer-valued sysfs attribute, such as the board temperature ADC.
pub struct SysfsScalar {
    path: PathBuf,
}

impl SysfsScalar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and parse the current value. Trailing newline and units after
    /// the number are tolerated, the way sysfs formats attributes.
    pub fn read(&self) -> Result<i32> {
        let raw = fs::read_to_string(&self.path)?;
        let digits: &str = raw
            .trim_start()
            .split(|c: char| !(c.is_ascii_digit() || c == '-'))
            .next()
            .unwrap_or("");
        digits
            .parse()
            .map_err(|_| ControlError::Config(format!("unparseable sensor value {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sensor_with(contents: &str) -> (tempfile::NamedTempFile, SysfsScalar) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let sensor = SysfsScalar::new(file.path());
        (file, sensor)
    }

    #[test]
    fn test_reads_plain_integer() {
        let (_file, sensor) = sensor_with("415\n");
        assert_eq!(sensor.read().unwrap(), 415);
    }

    #[test]
    fn test_rejects_non_numeric_value() {
        let (_file, sensor) = sensor_with("unavailable\n");
        assert!(sensor.read().is_err());
    }

    #[test]
    fn test_reads_negative_value() {
        let (_file, sensor) = sensor_with("-12\n");
        assert_eq!(sensor.read().unwrap(), -12);
    }

    #[test]
    fn test_missing_attribute_is_an_error() {
        let sensor = SysfsScalar::new("/nonexistent/sysfs/attr");
        assert!(sensor.read().is_err());
    }
}
