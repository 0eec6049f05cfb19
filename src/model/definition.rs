//! Parameter and event definitions.

use serde::{Deserialize, Serialize};

use super::DataKind;

/// Severity level attached to event definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl Default for Level {
    fn default() -> Self {
        Self::Information
    }
}

/// Describes one named parameter or event of a stream.
///
/// The set of active definitions is versioned per stream: any change starts
/// a new schema generation, and rows are only accepted for names present in
/// the active set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Which row channel this definition belongs to.
    pub kind: DataKind,
    /// Unique name within the stream.
    pub name: String,
    /// Human-readable label.
    pub label: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Unit of measurement.
    pub unit: Option<String>,
    /// Expected numeric range `[min, max]`.
    pub range: Option<(f64, f64)>,
    /// Severity level (events).
    pub level: Option<Level>,
}

impl Definition {
    /// Create a parameter definition with only a name.
    pub fn parameter(name: impl Into<String>) -> Self {
        Self {
            kind: DataKind::Parameters,
            name: name.into(),
            label: None,
            description: None,
            unit: None,
            range: None,
            level: None,
        }
    }

    /// Create an event definition with only a name.
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            kind: DataKind::Events,
            ..Self::parameter(name)
        }
    }

    /// Set the human-readable label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the unit of measurement.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the expected numeric range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Set the severity level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_builder() {
        let def = Definition::parameter("speed")
            .with_label("Speed")
            .with_unit("km/h")
            .with_range(0.0, 400.0);

        assert_eq!(def.kind, DataKind::Parameters);
        assert_eq!(def.name, "speed");
        assert_eq!(def.unit.as_deref(), Some("km/h"));
        assert_eq!(def.range, Some((0.0, 400.0)));
        assert!(def.level.is_none());
    }

    #[test]
    fn test_event_builder() {
        let def = Definition::event("overheat").with_level(Level::Critical);
        assert_eq!(def.kind, DataKind::Events);
        assert_eq!(def.level, Some(Level::Critical));
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Critical);
        assert!(Level::Warning < Level::Error);
        assert_eq!(Level::default(), Level::Information);
    }
}
