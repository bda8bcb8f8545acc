//! Routing data derived from a source entity's labels and annotations.

use std::fmt;

use crate::{BindingError, ObjectKey, SourceEntity};

/// The target resource a source entity routes through.
///
/// Encoded on the entity as a label whose value is `<namespace>.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetBinding {
    target: ObjectKey,
}

impl TargetBinding {
    /// Decode the binding from `entity.labels[label]`.
    pub fn from_entity(entity: &SourceEntity, label: &str) -> Result<Self, BindingError> {
        let Some(value) = entity.labels.get(label) else {
            return Err(BindingError::MissingLabel {
                label: label.to_string(),
            });
        };

        Self::parse(label, value)
    }

    /// Decode a `<namespace>.<name>` label value.
    ///
    /// Exactly one separator with non-empty segments on both sides.
    pub fn parse(label: &str, value: &str) -> Result<Self, BindingError> {
        let malformed = || BindingError::MalformedLabel {
            label: label.to_string(),
            value: value.to_string(),
        };

        let mut segments = value.split('.');
        let (Some(namespace), Some(name), None) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(malformed());
        };

        if namespace.is_empty() || name.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            target: ObjectKey::new(namespace, name),
        })
    }

    /// Identity of the bound target resource.
    pub fn target(&self) -> &ObjectKey {
        &self.target
    }
}

impl fmt::Display for TargetBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.target.fmt(f)
    }
}

/// The single port a source entity's route forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutePort(u16);

impl RoutePort {
    /// Select the port for `entity`.
    ///
    /// The override annotation wins when present; otherwise the first
    /// declared port is used.
    pub fn select(entity: &SourceEntity, annotation: &str) -> Result<Self, BindingError> {
        if let Some(value) = entity.annotations.get(annotation) {
            return match value.parse::<u16>() {
                Ok(port) if port != 0 => Ok(Self(port)),
                _ => Err(BindingError::InvalidPortAnnotation {
                    annotation: annotation.to_string(),
                    value: value.clone(),
                }),
            };
        }

        let first = entity.ports.first().ok_or(BindingError::NoPorts)?;
        match u16::try_from(first.port) {
            Ok(port) if port != 0 => Ok(Self(port)),
            _ => Err(BindingError::PortOutOfRange(first.port)),
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for RoutePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
