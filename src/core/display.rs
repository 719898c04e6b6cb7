//! Local rendering of the latest temperature.
//!
//! Values are formatted the way a segment display shows them: a fixed number
//! of character cells, with the decimal point folded into the preceding cell.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::telemetry::{DisplayConfig, DisplayKind};

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Failed to write display output to {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Display misconfigured: {0}")]
    Misconfigured(String),
}

/// Best-effort output for the current value. Callers log failures and move on.
#[async_trait]
pub trait Display: Send + Sync {
    async fn show(&self, value: f64) -> Result<(), DisplayError>;
}

/// Builds the display selected in configuration.
pub fn from_config(config: &DisplayConfig) -> Result<Box<dyn Display>, DisplayError> {
    match config.kind {
        DisplayKind::None => Ok(Box::new(NullDisplay)),
        DisplayKind::Log => Ok(Box::new(LogDisplay::new(config.width))),
        DisplayKind::File => {
            let path = config
                .path
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| DisplayError::Misconfigured("file display without path".into()))?;
            Ok(Box::new(FileDisplay::new(path, config.width)))
        }
    }
}

/// Renders `value` into at most `width` cells, keeping as many decimals as fit.
///
/// A decimal point does not take a cell. Values that cannot be shown even
/// without decimals, and non-finite values, render as dashes.
///
/// ```
/// use weatherbee::core::display::format_segments;
///
/// assert_eq!(format_segments(21.5, 4), "21.50");
/// assert_eq!(format_segments(1013.2, 4), "1013");
/// assert_eq!(format_segments(-5.25, 4), "-5.25");
/// assert_eq!(format_segments(123456.0, 4), "----");
/// ```
pub fn format_segments(value: f64, width: usize) -> String {
    let overflow = "-".repeat(width);
    if !value.is_finite() || width == 0 {
        return overflow;
    }

    for decimals in (0..width).rev() {
        let text = format!("{value:.decimals$}");
        if text.chars().filter(|c| *c != '.').count() <= width {
            return text;
        }
    }
    overflow
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullDisplay;

#[async_trait]
impl Display for NullDisplay {
    async fn show(&self, _value: f64) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Writes the rendered value to the log.
#[derive(Debug, Clone, Copy)]
pub struct LogDisplay {
    width: usize,
}

impl LogDisplay {
    pub fn new(width: usize) -> Self {
        Self { width }
    }
}

#[async_trait]
impl Display for LogDisplay {
    async fn show(&self, value: f64) -> Result<(), DisplayError> {
        info!(display = %format_segments(value, self.width), "Display updated");
        Ok(())
    }
}

/// Overwrites a file with the rendered value, e.g. for a status bar or a
/// display daemon watching the file.
#[derive(Debug, Clone)]
pub struct FileDisplay {
    path: PathBuf,
    width: usize,
}

impl FileDisplay {
    pub fn new(path: impl AsRef<Path>, width: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            width,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Display for FileDisplay {
    async fn show(&self, value: f64) -> Result<(), DisplayError> {
        let text = format_segments(value, self.width);
        tokio::fs::write(&self.path, format!("{text}\n"))
            .await
            .map_err(|source| DisplayError::Write {
                path: self.path.display().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn test_format_segments() {
        assert_eq!(format_segments(21.5, 4), "21.50");
        assert_eq!(format_segments(21.537, 4), "21.54");
        assert_eq!(format_segments(3.14159, 4), "3.142");
        assert_eq!(format_segments(1013.2, 4), "1013");
        assert_eq!(format_segments(-5.25, 4), "-5.25");
        assert_eq!(format_segments(0.0, 1), "0");
        assert_eq!(format_segments(99999.0, 4), "----");
        assert_eq!(format_segments(f64::NAN, 4), "----");
        assert_eq!(format_segments(12.0, 8), "12.000000");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_display() {
        LogDisplay::new(4).show(21.5).await.unwrap();
        assert!(logs_contain("21.50"));
    }

    #[tokio::test]
    async fn test_file_display_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("display");
        let display = FileDisplay::new(&path, 4);

        display.show(21.5).await.unwrap();
        display.show(1013.2).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1013\n");
    }

    #[tokio::test]
    async fn test_file_display_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let display = FileDisplay::new(dir.path().join("missing/display"), 4);

        assert!(matches!(
            display.show(1.0).await,
            Err(DisplayError::Write { .. })
        ));
    }

    #[test]
    fn test_file_display_requires_path() {
        let config = DisplayConfig {
            kind: DisplayKind::File,
            path: None,
            width: 4,
        };
        assert!(matches!(
            from_config(&config),
            Err(DisplayError::Misconfigured(_))
        ));
    }
}
