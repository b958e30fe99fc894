use super::event::Notification;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Error raised when a logical destination name has no physical address
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("destination '{name}' is not configured in the naming context")]
pub struct DestinationNotFoundError {
    /// Logical name which failed to resolve
    pub name: String,
}

/// Resolved location on the broker to which notifications are published
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    name: String,
    address: String,
}

impl Destination {
    /// Creates a new destination from a logical name and physical address
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Logical name this destination was resolved from
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical address on the broker
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Derives a sub-destination by appending an extension to the address
    pub fn extend(&self, extension: &str) -> Self {
        Self {
            name: self.name.clone(),
            address: format!("{}.{}", self.address, extension),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Resolves logical destination names into [`Destinations`](Destination)
pub trait DestinationResolver {
    /// Looks up the destination registered for a logical name
    fn lookup(&self, name: &str) -> Result<Destination, DestinationNotFoundError>;

    /// Resolves the destination of a [`Notification`] type and extends it with the given parts
    fn route<N: Notification>(
        &self,
        extensions: &[&str],
    ) -> Result<Destination, DestinationNotFoundError> {
        let base = self.lookup(N::DESTINATION)?;
        Ok(extensions
            .iter()
            .fold(base, |destination, extension| destination.extend(extension)))
    }
}

/// Table mapping logical destination names to physical addresses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamingContext(BTreeMap<String, String>);

impl NamingContext {
    /// Registers an address for a logical name, replacing any previous one
    pub fn insert(&mut self, name: impl Into<String>, address: impl Into<String>) {
        self.0.insert(name.into(), address.into());
    }

    /// Verifies that every given name resolves
    pub fn ensure(&self, names: &[&str]) -> Result<(), DestinationNotFoundError> {
        for name in names {
            self.lookup(name)?;
        }

        Ok(())
    }

    /// Iterates over all registered names and addresses
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl<N, A> std::iter::FromIterator<(N, A)> for NamingContext
where
    N: Into<String>,
    A: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (N, A)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, address)| (name.into(), address.into()))
                .collect(),
        )
    }
}

impl DestinationResolver for NamingContext {
    fn lookup(&self, name: &str) -> Result<Destination, DestinationNotFoundError> {
        self.0
            .get(name)
            .map(|address| Destination::new(name, address.as_str()))
            .ok_or_else(|| DestinationNotFoundError {
                name: name.to_owned(),
            })
    }
}
