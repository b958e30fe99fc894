use super::writer::{BinaryWriterFactory, TabularWriterFactory};
use super::ConsumerFactory;
use crate::domain::Format;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// No writer is registered for a requested format
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no writer available for format '{0}'")]
pub struct UnsupportedFormatError(pub Format);

type Constructor = fn() -> Arc<dyn ConsumerFactory>;

/// Lookup table from output format to the writer producing it
pub struct FormatRegistry {
    constructors: BTreeMap<Format, Constructor>,
}

impl FormatRegistry {
    /// Creates a registry without any writers
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registers a writer for a format, replacing any previous one
    pub fn register(&mut self, format: Format, constructor: Constructor) {
        self.constructors.insert(format, constructor);
    }

    /// Formats for which a writer is available
    pub fn formats(&self) -> Vec<Format> {
        self.constructors.keys().copied().collect()
    }

    /// Builds a fresh writer for the format
    pub fn build(&self, format: Format) -> Result<Arc<dyn ConsumerFactory>, UnsupportedFormatError> {
        self.constructors
            .get(&format)
            .map(|constructor| constructor())
            .ok_or(UnsupportedFormatError(format))
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Format::Csv, || Arc::new(TabularWriterFactory::new()));
        registry.register(Format::Binary, || Arc::new(BinaryWriterFactory::new()));
        registry
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_writers_for_known_formats() {
        let registry = FormatRegistry::default();

        assert_eq!(registry.formats(), vec![Format::Csv, Format::Binary]);

        let tabular = registry.build(Format::Csv).unwrap().describe();
        assert!(tabular.formats.contains(&Format::Csv));
        assert!(tabular.consumer_id.starts_with("csv-"));
    }

    #[test]
    fn reject_formats_without_writer() {
        assert_eq!(
            FormatRegistry::default().build(Format::Netcdf).err(),
            Some(UnsupportedFormatError(Format::Netcdf))
        );
    }
}
